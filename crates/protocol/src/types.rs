//! Common types used across host and plugin messages

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Property set on a worker request payload to correlate its response
pub const REQUEST_ID_PROP: &str = "__figpadRequestId";

/// Property set on a worker response when the request failed
pub const REQUEST_ERROR_PROP: &str = "__figpadRequestError";

/// Prefix of the `origin` field of worker message events
pub const WORKER_ORIGIN_PREFIX: &str = "figpad-worker";

/// Identifier of one script invocation, chosen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random id for callers that have none of their own
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker identifier: `<invocation id>.<base36 sequence>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    #[must_use]
    pub fn new(owner: &RequestId, seq: u64) -> Self {
        Self(format!("{}.{}", owner, base36(seq)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the `origin` field for events coming from this worker
    #[must_use]
    pub fn origin(&self) -> String {
        format!("{}:{}", WORKER_ORIGIN_PREFIX, self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase base-36 rendering of a sequence number
#[must_use]
pub fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// Position in the framed script source. Lines are 1-based and include the
/// framing header; the UI subtracts `srcLineOffset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.line > 0
    }
}

/// Error reported by a worker, either from creation or at runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerErrorInfo {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub lineno: Option<u32>,
    #[serde(default)]
    pub colno: Option<u32>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl WorkerErrorInfo {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Options for workers backed by an iframe in the UI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IframeOptions {
    #[serde(default)]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// One parsed frame of a script stack trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default)]
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

/// Printable form of an error value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDescriptor {
    /// `String(error)`, usually `"<name>: <message>"`
    pub message: String,
    pub stack: Vec<StackFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcpos: Option<SourcePos>,
}

/// Snapshot of a script value taken by `print`.
///
/// Arrays and objects carry an `id`; a container reached a second time
/// (including through a cycle) is emitted as `Ref(id)` of its first copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "camelCase")]
pub enum Cloned {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array { id: u32, items: Vec<Cloned> },
    Object { id: u32, entries: Vec<(String, Cloned)> },
    Ref(u32),
    Error(ErrorDescriptor),
    Bytes(Vec<u8>),
    Function { name: String },
    /// Host-native value carrying a pass-through marker; not walked
    Opaque { marker: String, repr: serde_json::Value },
}

/// Failure of a script invocation, as reported to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptFailure {
    pub name: String,
    pub message: String,
    /// Stack text whose first line is always the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_stack: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}
