//! Plugin messages (plugin runtime → UI)

use serde::{Deserialize, Serialize};

use crate::{Cloned, CtrlSignal, IframeOptions, RequestId, ScriptFailure, SourcePos, WorkerId};

/// Output of one `print` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintMessage {
    /// Pre-formatted text; empty when the UI should render `args`
    pub message: String,
    pub args: Vec<Cloned>,
    pub req_id: RequestId,
    pub src_pos: SourcePos,
    pub src_line_offset: u32,
}

/// Every message the plugin runtime can send to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PluginMessage {
    #[serde(rename = "worker-create-req")]
    WorkerCreateReq {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        js: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iframe: Option<IframeOptions>,
    },

    #[serde(rename = "worker-message")]
    WorkerMessage {
        evtype: String,
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        data: serde_json::Value,
    },

    #[serde(rename = "worker-ctrl")]
    WorkerCtrl {
        signal: CtrlSignal,
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
    },

    #[serde(rename = "worker-setFrame")]
    WorkerSetFrame {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },

    #[serde(rename = "print")]
    Print(PrintMessage),

    /// Settlement of an `eval` request
    #[serde(rename = "eval-response")]
    EvalResponse {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ScriptFailure>,
    },
}

impl PluginMessage {
    /// Plain `message` event posted to a worker
    #[must_use]
    pub fn worker_message(worker_id: WorkerId, data: serde_json::Value) -> Self {
        Self::WorkerMessage {
            evtype: "message".into(),
            worker_id,
            data,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
