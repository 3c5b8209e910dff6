//! Host messages (UI → plugin runtime)

use serde::{Deserialize, Serialize};

use crate::{RequestId, WorkerErrorInfo, WorkerId};

/// Control signal of a `worker-ctrl` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtrlSignal {
    Close,
    Terminate,
    #[serde(other)]
    Unknown,
}

/// Every message the UI can deliver to the plugin runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    /// Acknowledges a `worker-create-req`; `error` is set when creation failed
    #[serde(rename = "worker-create-res")]
    WorkerCreateRes {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkerErrorInfo>,
    },

    /// Message posted by a worker
    #[serde(rename = "worker-message")]
    WorkerMessage {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        evtype: String,
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Uncaught error inside a worker
    #[serde(rename = "worker-error")]
    WorkerError {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        error: WorkerErrorInfo,
    },

    /// Lifecycle signal from a worker
    #[serde(rename = "worker-ctrl")]
    WorkerCtrl {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        signal: CtrlSignal,
    },

    /// Run a script
    #[serde(rename = "eval")]
    Eval { id: RequestId, js: String },

    /// Cancel a running script
    #[serde(rename = "stop-script")]
    StopScript { id: RequestId },
}

impl HostMessage {
    /// Parse a message received as raw JSON
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Worker this message is addressed to, if any
    #[must_use]
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            Self::WorkerCreateRes { worker_id, .. }
            | Self::WorkerMessage { worker_id, .. }
            | Self::WorkerError { worker_id, .. }
            | Self::WorkerCtrl { worker_id, .. } => Some(worker_id),
            Self::Eval { .. } | Self::StopScript { .. } => None,
        }
    }
}
