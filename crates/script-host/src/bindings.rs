//! Native functions exposed to the prelude
//!
//! Every native returns a JSON envelope string, `{"ok": value}` or
//! `{"err": {name, message, stack?, capability?}}`. The prelude turns error
//! envelopes back into the matching error classes, so no engine value ever
//! outlives the call that produced it.

use std::fmt::Write as _;
use std::rc::{Rc, Weak};

use rquickjs::function::Func;
use rquickjs::{Ctx, Function, Object};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use figpad_engine::clone::{Inspect, Shape};
use figpad_engine::{ScriptError, ThrownError};
use figpad_protocol::Cloned;

use crate::core::{caught, JsCore};
use crate::runtime::HostState;

const PRELUDE: &str = include_str!("prelude.js");

/// Error as it crosses the engine boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ErrorDesc {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl ErrorDesc {
    pub fn of(error: &ScriptError) -> Self {
        let (stack, capability) = match error {
            ScriptError::Thrown(e) => (e.stack.clone(), None),
            ScriptError::Unavailable { name, .. } => (None, Some(name.clone())),
            _ => (None, None),
        };
        Self {
            name: error.name().to_string(),
            message: error.message(),
            stack,
            capability,
        }
    }

    pub fn into_error(self) -> ScriptError {
        match (self.name.as_str(), self.capability) {
            ("TimerCancellation", _) => ScriptError::TimerCancellation,
            ("ScripterError", Some(name)) => ScriptError::Unavailable {
                name,
                message: self.message,
            },
            _ => ScriptError::Thrown(ThrownError {
                name: self.name,
                message: self.message,
                stack: self.stack,
                user_stack: None,
            }),
        }
    }

    pub fn to_json(error: &ScriptError) -> Json {
        serde_json::to_value(Self::of(error)).unwrap_or(Json::Null)
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: Json,
    #[serde(default)]
    err: Option<ErrorDesc>,
}

/// Decode the result of a prelude handler
pub(crate) fn open_envelope(text: &str) -> Result<Json, ScriptError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| ScriptError::thrown(format!("malformed reply from script engine: {e}")))?;
    match envelope.err {
        Some(desc) => Err(desc.into_error()),
        None => Ok(envelope.ok),
    }
}

/// Encode the result of a native
pub(crate) fn respond<T: Serialize>(result: Result<T, ScriptError>) -> String {
    let envelope = match result.and_then(|v| serde_json::to_value(v).map_err(bad_value)) {
        Ok(value) => json!({ "ok": value }),
        Err(error) => json!({ "err": ErrorDesc::to_json(&error) }),
    };
    envelope.to_string()
}

/// Argument the prelude handed over in an unexpected shape
pub(crate) fn bad_value(error: serde_json::Error) -> ScriptError {
    ScriptError::Thrown(ThrownError::new("TypeError", error.to_string()))
}

/// Error descriptor sent by the prelude
pub(crate) fn error_from_json(text: &str) -> ScriptError {
    match serde_json::from_str::<ErrorDesc>(text) {
        Ok(desc) => desc.into_error(),
        Err(_) => ScriptError::thrown(text),
    }
}

// ---------------------------------------------------------------------------
// print snapshots

/// Node of a value graph flattened by the prelude
#[derive(Debug, Deserialize)]
#[serde(tag = "k", rename_all = "lowercase")]
enum SnapNode {
    Undefined,
    Null,
    Bool { v: bool },
    /// Kept as text so `NaN` and the infinities survive JSON
    Num { v: String },
    Str { v: String },
    Fn { name: String },
    Date { v: String },
    Err {
        display: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Bytes { v: Vec<u8> },
    Marked { marker: String, repr: Json },
    Arr { items: Vec<usize> },
    Obj { entries: Vec<(String, usize)> },
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    nodes: Vec<SnapNode>,
    roots: Vec<usize>,
}

/// Value inside a snapshot; two values are the same object when they point
/// at the same node of the same snapshot
#[derive(Clone)]
pub(crate) struct SnapshotValue {
    graph: Rc<Snapshot>,
    index: usize,
}

impl SnapshotValue {
    fn at(&self, index: usize) -> Self {
        Self {
            graph: self.graph.clone(),
            index,
        }
    }
}

impl Inspect for SnapshotValue {
    type Identity = (usize, usize);

    fn shape(&self, bytes_cap: usize) -> Shape<Self> {
        let Some(node) = self.graph.nodes.get(self.index) else {
            return Shape::Undefined;
        };
        match node {
            SnapNode::Undefined => Shape::Undefined,
            SnapNode::Null => Shape::Null,
            SnapNode::Bool { v } => Shape::Bool(*v),
            SnapNode::Num { v } => Shape::Number(v.parse().unwrap_or(f64::NAN)),
            SnapNode::Str { v } => Shape::String(v.clone()),
            SnapNode::Fn { name } => Shape::Function(name.clone()),
            SnapNode::Date { v } => Shape::Date(v.clone()),
            SnapNode::Err { display, stack } => Shape::Error {
                display: display.clone(),
                stack: stack.clone(),
            },
            SnapNode::Bytes { v } => Shape::Bytes(v.iter().copied().take(bytes_cap).collect()),
            SnapNode::Marked { marker, repr } => Shape::Marked {
                marker: marker.clone(),
                repr: repr.clone(),
            },
            SnapNode::Arr { items } => Shape::Array(items.iter().map(|&i| self.at(i)).collect()),
            SnapNode::Obj { entries } => Shape::Object(
                entries
                    .iter()
                    .map(|(k, i)| (k.clone(), self.at(*i)))
                    .collect(),
            ),
        }
    }

    fn identity(&self) -> Self::Identity {
        (Rc::as_ptr(&self.graph) as usize, self.index)
    }
}

/// Root values of a snapshot produced by the prelude
pub(crate) fn parse_snapshot(text: &str) -> Result<Vec<SnapshotValue>, ScriptError> {
    let snapshot: Snapshot = serde_json::from_str(text).map_err(bad_value)?;
    let roots = snapshot.roots.clone();
    let graph = Rc::new(snapshot);
    Ok(roots
        .into_iter()
        .map(|index| SnapshotValue {
            graph: graph.clone(),
            index,
        })
        .collect())
}

/// One-line text form of printed values
pub fn render(args: &[Cloned]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match arg {
            Cloned::String(s) => out.push_str(s),
            other => write_value(&mut out, other),
        }
    }
    out
}

fn write_value(out: &mut String, value: &Cloned) {
    match value {
        Cloned::Undefined => out.push_str("undefined"),
        Cloned::Null => out.push_str("null"),
        Cloned::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Cloned::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Cloned::String(s) => {
            let _ = write!(out, "{s:?}");
        }
        Cloned::Array { items, .. } => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Cloned::Object { entries, .. } => {
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                out.push_str(if i > 0 { ", " } else { " " });
                let _ = write!(out, "{key}: ");
                write_value(out, item);
            }
            out.push_str(if entries.is_empty() { "}" } else { " }" });
        }
        Cloned::Ref(id) => {
            let _ = write!(out, "[Circular *{id}]");
        }
        Cloned::Error(e) => out.push_str(&e.message),
        Cloned::Bytes(bytes) => {
            let _ = write!(out, "<{} bytes>", bytes.len());
        }
        Cloned::Function { name } if name.is_empty() => out.push_str("[Function]"),
        Cloned::Function { name } => {
            let _ = write!(out, "[Function {name}]");
        }
        Cloned::Opaque { repr: Json::String(s), .. } => out.push_str(s),
        Cloned::Opaque { repr, .. } => {
            let _ = write!(out, "{repr}");
        }
    }
}

// ---------------------------------------------------------------------------
// install

fn with_state<T>(
    state: &Weak<HostState>,
    f: impl FnOnce(&HostState) -> Result<T, ScriptError>,
) -> Result<T, ScriptError> {
    let state = state.upgrade().ok_or(ScriptError::ScriptStopped)?;
    f(&state)
}

/// Register `$name` on `$obj` as a native that forwards to `HostState`
macro_rules! native {
    ($obj:ident, $state:ident, $name:literal, |$st:ident $(, $arg:ident : $ty:ty)*| $body:expr) => {{
        let weak = $state.clone();
        $obj.set(
            $name,
            Func::from(move |$($arg: $ty),*| -> String {
                respond(with_state(&weak, |$st| $body))
            }),
        )?;
    }};
}

fn natives<'js>(ctx: &Ctx<'js>, state: &Weak<HostState>) -> rquickjs::Result<Object<'js>> {
    let n = Object::new(ctx.clone())?;

    native!(n, state, "timerSet", |st, slot: u32, kind: String, ms: f64| st.timer_set(slot, &kind, ms));
    native!(n, state, "timerClear", |st, slot: u32, id: f64| st.timer_clear(slot, id as u32));
    native!(n, state, "timerCancel", |st, slot: u32, id: f64| st.timer_cancel(slot, id as u32));
    native!(n, state, "defer", |st, ms: f64| Ok(st.defer(ms)));

    native!(n, state, "print", |st, slot: u32, snapshot: String, stack: String, visualize: bool| {
        st.print(slot, &snapshot, &stack, visualize)
    });
    native!(n, state, "settle", |st, slot: u32, error: Option<String>, value: Option<String>| {
        st.settle(slot, error, value)
    });

    native!(n, state, "workerCreate", |st, slot: u32, js: String, options: String| {
        st.worker_create(slot, js, &options)
    });
    native!(n, state, "workerPost", |st, slot: u32, wid: String, data: String| {
        st.worker_post(slot, &wid, &data)
    });
    native!(n, state, "workerRecv", |st, slot: u32, wid: String| st.worker_recv(slot, &wid));
    native!(n, state, "workerRequest", |st, slot: u32, wid: String, data: String, timeout_ms: f64| {
        st.worker_request(slot, &wid, &data, timeout_ms)
    });
    native!(n, state, "workerClosed", |st, slot: u32, wid: String| st.worker_closed(slot, &wid));
    native!(n, state, "workerTerminate", |st, slot: u32, wid: String| st.worker_terminate(slot, &wid));
    native!(n, state, "workerSetFrame", |st, slot: u32, wid: String, x: f64, y: f64, w: f64, h: f64| {
        st.worker_set_frame(slot, &wid, x, y, w, h)
    });
    native!(n, state, "workerListen", |st, slot: u32, wid: String, kind: String, on: bool| {
        st.worker_listen(slot, &wid, &kind, on)
    });

    native!(n, state, "endAdd", |st, slot: u32, id: f64| st.end_add(slot, id as u32));
    native!(n, state, "endRemove", |st, slot: u32, id: f64| st.end_remove(slot, id as u32));

    native!(n, state, "hostCall", |st, member: String, args: String| st.host_call(&member, &args));
    native!(n, state, "domCreate", |st, slot: u32, kind: String, spec: String| {
        st.dom_create(slot, &kind, &spec)
    });

    Ok(n)
}

/// Evaluate the prelude and hand it the natives and its configuration
pub(crate) fn install(core: &JsCore, state: Weak<HostState>, config: &Json) -> Result<(), ScriptError> {
    let config = config.to_string();
    core.enter(|ctx| -> Result<(), ScriptError> {
        let init: Function = ctx.eval(PRELUDE).map_err(|e| caught(&ctx, e))?;
        let natives = natives(&ctx, &state).map_err(|e| caught(&ctx, e))?;
        init.call::<_, bool>((natives, config.as_str()))
            .map_err(|e| caught(&ctx, e))?;
        Ok(())
    })
    .and_then(|installed| installed)
    .map_err(|e| ScriptError::Init(e.to_string()))
}
