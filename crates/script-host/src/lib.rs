//! figpad Script Host
//!
//! QuickJS sandbox for running user scripts against a capability-limited
//! environment.
//!
//! ## Script API
//!
//! Every capability is passed to the script as a positional parameter, in
//! the order of [`CapabilityTable`]. Scripts see:
//!
//! - `print(...values)` - Show values in the UI (deep-copied, cycle safe)
//! - `setTimeout`, `setInterval`, `clearTimeout`, `clearInterval` - Timers
//!   owned by the running script
//! - `Timer(ms, handler?)` / `timer(...)` - Promise that resolves after `ms`,
//!   with `.cancel()`
//! - `animate(frame)` - Calls `frame(seconds)` every frame until it returns
//!   `"STOP"`
//! - `createWorker(options?, script)`, `createWindow(options?, script)` -
//!   Workers running on the UI side
//! - `scripter.onend`, `scripter.addEndCallback(f)`,
//!   `scripter.removeEndCallback(f)`, `scripter.visualizePrint`
//! - `host.*` - Members of the embedding design tool, filtered by policy
//! - `Frame(props, ...children)`, `createRectangle(...)`, `Group(...)`, ... -
//!   Node constructors
//! - `Color`, `RGB`, `RGBA`, named colors, `isFrame`-style predicates,
//!   `range`, `visit`, `find`, `assert`, `TimerCancellation`
//! - `fetch`, `fetchText`, `fetchJson`, `fetchData`, `fetchImg` - Only when
//!   the policy allows network access
//!
//! The variable `canceled` turns `true` once the script has been cancelled.

mod bindings;
mod core;
mod env;
mod runtime;

pub use bindings::render;
pub use env::*;
pub use runtime::*;

use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Configuration for script execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Maximum memory usage of the script engine in bytes
    pub memory_limit: usize,
    /// Maximum stack size of the script engine in bytes
    pub max_stack_size: usize,
    /// Initial value of `scripter.visualizePrint`
    pub visualize_print: bool,
    /// Printed binary buffers are cut to this many bytes
    pub print_bytes_cap: usize,
    /// Continuous work `visit`/`find` do before yielding
    pub traversal_budget_ms: u64,
    /// Interval between `animate` frames
    pub animation_frame_ms: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,  // 64 MB
            max_stack_size: 1024 * 1024,     // 1 MB
            visualize_print: true,
            print_bytes_cap: figpad_engine::clone::DEFAULT_BYTES_CAP,
            traversal_budget_ms: 100,
            animation_frame_ms: 16,
        }
    }
}

/// Request from a script to the embedding host
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    /// Call a member of the `host` object, e.g. `"currentPage"` or `"notify"`
    Call {
        member: String,
        args: Vec<serde_json::Value>,
    },
    /// Materialize a node built by a node constructor
    CreateNode { node: serde_json::Value },
}

/// Response from the host to a script
#[derive(Debug, Clone, PartialEq)]
pub enum HostResponse {
    Value(serde_json::Value),
    Ok,
    Error(String),
}

pub type HostHandler = Rc<dyn Fn(HostRequest) -> HostResponse>;

/// The embedder's side of the `host` capability
#[derive(Clone, Default)]
pub struct HostApi {
    /// Dotted member paths the embedder implements
    members: Vec<String>,
    handler: Option<HostHandler>,
}

impl HostApi {
    pub fn new<I, S, F>(members: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(HostRequest) -> HostResponse + 'static,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            handler: Some(Rc::new(handler)),
        }
    }

    /// No embedder: `host` only carries the policy stubs and nodes stay local
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_attached(&self) -> bool {
        self.handler.is_some()
    }

    pub fn handle(&self, request: HostRequest) -> HostResponse {
        match &self.handler {
            Some(handler) => handler(request),
            None => HostResponse::Error("no host is attached".into()),
        }
    }
}
