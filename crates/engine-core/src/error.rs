//! Errors shared by the runtime core and script hosts

use figpad_protocol::{ScriptFailure, WorkerErrorInfo};
use thiserror::Error;

/// Error value thrown by script code
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThrownError {
    pub name: String,
    pub message: String,
    /// Stack text as reported by the engine
    pub stack: Option<String>,
    /// Stack text whose first line is the message
    pub user_stack: Option<String>,
}

impl ThrownError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Fill `user_stack` from `stack`, prepending the message when the
    /// engine left it out.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let stack = self.stack.as_deref().unwrap_or("").trim_end();
        let user_stack = if stack.starts_with(&self.message) {
            stack.to_string()
        } else if stack.is_empty() {
            self.message.clone()
        } else {
            format!("{}\n{}", self.message, stack)
        };
        self.user_stack = Some(user_stack);
        self
    }
}

impl std::fmt::Display for ThrownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Error reported by or about a worker
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", .0.message)]
pub struct WorkerError(pub WorkerErrorInfo);

impl WorkerError {
    pub fn message(message: impl Into<String>) -> Self {
        Self(WorkerErrorInfo::message(message))
    }
}

/// Errors from script execution
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("{0}")]
    Thrown(ThrownError),

    /// Default reason of an explicit cancellation
    #[error("cancel")]
    Cancelled,

    /// Delivered to promise-style timers cut short by a cancellation
    #[error("Timer canceled")]
    TimerCancellation,

    /// Scheduling attempted after the invocation was cancelled
    #[error("script canceled")]
    ScriptCanceled,

    /// Worker use after the owning invocation ended
    #[error("script stopped")]
    ScriptStopped,

    #[error("worker terminated")]
    WorkerTerminated,

    #[error("worker closed")]
    WorkerClosed,

    #[error("{0}")]
    Worker(WorkerError),

    #[error("timeout")]
    RequestTimeout,

    #[error("{message}")]
    Unavailable { name: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    /// Script refused by the capability policy before it ran
    #[error("{message}")]
    Denied { code: String, message: String },

    #[error("Runtime initialization failed: {0}")]
    Init(String),
}

impl ScriptError {
    /// Plain `Error` thrown with `message`
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown(ThrownError::new("Error", message))
    }

    /// Constructor name the error carries when handed back to script code
    pub fn name(&self) -> &str {
        match self {
            Self::Thrown(e) if !e.name.is_empty() => &e.name,
            Self::TimerCancellation => "TimerCancellation",
            Self::Unavailable { .. } => "ScripterError",
            Self::Worker(_) => "FigpadWorkerError",
            Self::Denied { .. } => "PolicyError",
            _ => "Error",
        }
    }

    /// Message without the constructor name
    pub fn message(&self) -> String {
        match self {
            Self::Thrown(e) => e.message.clone(),
            other => other.to_string(),
        }
    }

    /// Apply stack normalization to thrown script errors
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Thrown(e) => Self::Thrown(e.normalized()),
            other => other,
        }
    }

    /// Wire form for the UI
    pub fn to_failure(&self) -> ScriptFailure {
        let user_stack = match self {
            Self::Thrown(e) => e.user_stack.clone().or_else(|| e.stack.clone()),
            _ => None,
        };
        ScriptFailure {
            name: self.name().to_string(),
            message: self.message(),
            user_stack,
            cancelled: matches!(self, Self::Cancelled),
        }
    }
}

impl From<WorkerError> for ScriptError {
    fn from(e: WorkerError) -> Self {
        Self::Worker(e)
    }
}
