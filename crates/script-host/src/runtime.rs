//! Script host: runs framed scripts as invocations of the engine core
//!
//! One QuickJS runtime serves every invocation. Each invocation owns a
//! numbered slot that ties the script-side state to its
//! [`InvocationScope`]; the slot is released once the invocation's end
//! listeners have run.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::sync::oneshot;

use figpad_engine::clone::clone_values;
use figpad_engine::{
    stack, AnimationStep, CloseHandler, Completion, DeferredHandler, EndCallback, ErrorHandler,
    FrameCallback, Invocation, InvocationScope, ListenerId, MessageEvent, MessageHandler,
    ScriptDispatcher, ScriptError, ScriptFuture, ScriptProgram, ScriptValue, Supervisor,
    TimerCallback, TimerFuture, TimerId, WorkerError, WorkerHandle, WorkerOptions,
};
use figpad_policy::{CapabilityPolicy, PolicyDecision};
use figpad_protocol::{IframeOptions, PluginMessage, PrintMessage, RequestId};

use crate::bindings::{self, bad_value, ErrorDesc};
use crate::core::JsCore;
use crate::{prelude_config, CapabilityTable, DomBuilder, HostApi, HostRequest, HostResponse, NodeSpec, ScriptConfig};

type Settle = oneshot::Sender<Result<ScriptValue, ScriptError>>;

/// Host side of one invocation
struct Slot {
    scope: InvocationScope,
    settle: RefCell<Option<Settle>>,
    workers: RefCell<HashMap<String, WorkerHandle>>,
    end_callbacks: RefCell<HashMap<u32, ListenerId>>,
    dom: DomBuilder,
}

impl Slot {
    fn worker(&self, id: &str) -> Result<WorkerHandle, ScriptError> {
        self.workers
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| ScriptError::thrown(format!("unknown worker {id}")))
    }
}

#[derive(Deserialize)]
struct CreateOptions {
    #[serde(default)]
    iframe: Option<IframeOptions>,
}

/// Delay for a timer request: non-finite and negative values mean "now"
fn delay_of(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_millis(ms.min(i32::MAX as f64) as u64)
    } else {
        Duration::ZERO
    }
}

pub(crate) struct HostState {
    this: Weak<HostState>,
    supervisor: Supervisor,
    config: ScriptConfig,
    policy: CapabilityPolicy,
    host: HostApi,
    table: CapabilityTable,
    core: OnceCell<JsCore>,
    slots: RefCell<HashMap<u32, Rc<Slot>>>,
    next_slot: Cell<u32>,
    next_call: Cell<u64>,
}

impl HostState {
    fn core(&self) -> Result<&JsCore, ScriptError> {
        self.core
            .get()
            .ok_or_else(|| ScriptError::Init("script engine is not running".into()))
    }

    /// Create the engine and load the prelude on first use
    fn ensure_ready(&self) -> Result<&JsCore, ScriptError> {
        if self.core.get().is_none() {
            let core = JsCore::new(&self.config)?;
            let config = prelude_config(&self.table, &self.policy, &self.host, &self.config);
            bindings::install(&core, self.this.clone(), &config)?;
            tracing::debug!(capabilities = self.table.names().len(), "script engine ready");
            let _ = self.core.set(core);
        }
        self.core()
    }

    fn slot(&self, id: u32) -> Result<Rc<Slot>, ScriptError> {
        self.slots
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(ScriptError::ScriptStopped)
    }

    /// Call into the script engine from outside of it, queueing the call
    /// while script code runs. Failures are only logged.
    fn notify(&self, handler: &'static str, args: Json) {
        let result = self.core().and_then(|core| core.call_or_defer(handler, args));
        if let Err(error) = result {
            tracing::warn!(handler, %error, "script callback failed");
        }
    }

    fn build(&self, scope: &InvocationScope, framed: String) -> Result<Box<dyn ScriptProgram>, ScriptError> {
        let id = self.next_slot.get() + 1;
        self.next_slot.set(id);

        let (settle, done) = oneshot::channel();
        let slot = Rc::new(Slot {
            scope: scope.clone(),
            settle: RefCell::new(Some(settle)),
            workers: RefCell::new(HashMap::new()),
            end_callbacks: RefCell::new(HashMap::new()),
            dom: DomBuilder::new(self.host.clone(), scope.request_id.clone()),
        });
        self.slots.borrow_mut().insert(id, slot);

        let weak = self.this.clone();
        scope.end_listeners.add(Box::new(move || {
            // After the listeners added by the script itself
            tokio::task::spawn_local(async move {
                if let Some(state) = weak.upgrade() {
                    state.release(id);
                }
            });
            Ok(())
        }));

        let request_id = scope.request_id.clone();
        scope.timers.set_unhandled_hook(Rc::new(move |error: &ScriptError| {
            tracing::error!(%request_id, %error, "uncaught error in timer callback");
        }));

        let this = self.this.upgrade().ok_or(ScriptError::ScriptStopped)?;
        Ok(Box::new(JsProgram {
            state: this,
            slot: id,
            request_id: scope.request_id.clone(),
            framed: Some(framed),
            done: Some(done),
        }))
    }

    fn release(&self, id: u32) {
        if self.slots.borrow_mut().remove(&id).is_some() {
            tracing::trace!(slot = id, "releasing script slot");
            self.notify("release", json!([id]));
        }
    }

    /// Run `work` in the background and complete the script-side promise
    /// registered under the returned call id
    fn complete_later<F>(&self, work: F) -> u64
    where
        F: Future<Output = Result<Json, ScriptError>> + 'static,
    {
        let call = self.next_call.get() + 1;
        self.next_call.set(call);
        let weak = self.this.clone();
        tokio::task::spawn_local(async move {
            let (error, value) = match work.await {
                Ok(value) => (Json::Null, value),
                Err(error) => (ErrorDesc::to_json(&error), Json::Null),
            };
            if let Some(state) = weak.upgrade() {
                state.notify("complete", json!([call, error, value]));
            }
        });
        call
    }

    fn watch_timer(&self, slot: u32, id: TimerId, done: TimerFuture) {
        let weak = self.this.clone();
        tokio::task::spawn_local(async move {
            let error = match done.await {
                Ok(()) => Json::Null,
                Err(error) => ErrorDesc::to_json(&error),
            };
            if let Some(state) = weak.upgrade() {
                state.notify("timerDone", json!([slot, id, error]));
            }
        });
    }

    // -----------------------------------------------------------------------
    // natives

    pub(crate) fn timer_set(&self, slot: u32, kind: &str, ms: f64) -> Result<TimerId, ScriptError> {
        let timers = self.slot(slot)?.scope.timers.clone();
        let delay = delay_of(ms);
        let weak = self.this.clone();
        let timer_id = Rc::new(Cell::new(0));
        let id_ref = timer_id.clone();

        let id = match kind {
            "timeout" | "interval" => {
                let repeat = kind == "interval";
                let callback: TimerCallback = Box::new(move || {
                    let state = weak.upgrade().ok_or(ScriptError::ScriptStopped)?;
                    state.core()?.call("fire", json!([slot, id_ref.get(), repeat]))?;
                    Ok(())
                });
                if repeat {
                    timers.set_interval(delay, callback)?
                } else {
                    timers.set_timeout(delay, callback)?
                }
            }
            "timer" => {
                let handler: DeferredHandler = Box::new(move |canceled| {
                    let state = weak.upgrade().ok_or(ScriptError::ScriptStopped)?;
                    state
                        .core()?
                        .call_or_defer("timerHandler", json!([slot, id_ref.get(), canceled]))
                });
                let (id, done) = timers.timer(delay, Some(handler))?;
                self.watch_timer(slot, id, done);
                id
            }
            "animate" => {
                let frame: FrameCallback = Box::new(move |t| {
                    let state = weak.upgrade().ok_or(ScriptError::ScriptStopped)?;
                    let step = state.core()?.call("frame", json!([slot, id_ref.get(), t]))?;
                    Ok(match step.as_str() {
                        Some("stop") => AnimationStep::Stop,
                        _ => AnimationStep::Continue,
                    })
                });
                let period = Duration::from_millis(self.config.animation_frame_ms);
                let (id, done) = timers.animate(period, frame)?;
                self.watch_timer(slot, id, done);
                id
            }
            other => return Err(ScriptError::thrown(format!("unknown timer kind {other}"))),
        };
        timer_id.set(id);
        Ok(id)
    }

    pub(crate) fn timer_clear(&self, slot: u32, id: TimerId) -> Result<(), ScriptError> {
        self.slot(slot)?.scope.timers.clear(id);
        Ok(())
    }

    pub(crate) fn timer_cancel(&self, slot: u32, id: TimerId) -> Result<(), ScriptError> {
        self.slot(slot)?.scope.timers.cancel_timer(id);
        Ok(())
    }

    pub(crate) fn defer(&self, ms: f64) -> u64 {
        let delay = delay_of(ms);
        self.complete_later(async move {
            tokio::time::sleep(delay).await;
            Ok(Json::Null)
        })
    }

    pub(crate) fn print(&self, slot: u32, snapshot: &str, stack: &str, visualize: bool) -> Result<(), ScriptError> {
        let slot = self.slot(slot)?;
        let values = bindings::parse_snapshot(snapshot)?;
        let args = clone_values(&values, self.config.print_bytes_cap);
        let request_id = &slot.scope.request_id;
        tracing::info!(target: "figpad::print", %request_id, "{}", bindings::render(&args));
        if !visualize {
            return Ok(());
        }

        // The innermost frame is `print` itself
        let frames = stack::user_frames(stack);
        let message = PluginMessage::Print(PrintMessage {
            message: String::new(),
            args,
            req_id: request_id.clone(),
            src_pos: stack::first_source_pos(&frames, 1).unwrap_or_default(),
            src_line_offset: self.table.line_offset(),
        });
        if let Err(error) = self.supervisor.send(message) {
            tracing::warn!(%error, "failed to send print message");
        }
        Ok(())
    }

    pub(crate) fn settle(&self, slot: u32, error: Option<String>, value: Option<String>) -> Result<(), ScriptError> {
        let slot = self.slot(slot)?;
        let result = match (error, value) {
            (Some(error), _) => Err(bindings::error_from_json(&error)),
            (None, Some(value)) => Ok(Some(serde_json::from_str(&value).map_err(bad_value)?)),
            (None, None) => Ok(None),
        };
        if let Some(settle) = slot.settle.borrow_mut().take() {
            let _ = settle.send(result);
        }
        Ok(())
    }

    pub(crate) fn worker_create(&self, slot: u32, js: String, options: &str) -> Result<String, ScriptError> {
        let slot = self.slot(slot)?;
        let options: CreateOptions = serde_json::from_str(options).map_err(bad_value)?;
        let handle = slot.scope.workers.create_worker(
            js,
            WorkerOptions {
                iframe: options.iframe,
            },
        )?;
        let id = handle.id().0;
        slot.workers.borrow_mut().insert(id.clone(), handle);
        Ok(id)
    }

    pub(crate) fn worker_post(&self, slot: u32, wid: &str, data: &str) -> Result<(), ScriptError> {
        let data = serde_json::from_str(data).map_err(bad_value)?;
        self.slot(slot)?.worker(wid)?.post_message(data)
    }

    pub(crate) fn worker_recv(&self, slot: u32, wid: &str) -> Result<u64, ScriptError> {
        let reply = self.slot(slot)?.worker(wid)?.recv()?;
        Ok(self.complete_later(reply))
    }

    pub(crate) fn worker_request(&self, slot: u32, wid: &str, data: &str, timeout_ms: f64) -> Result<u64, ScriptError> {
        let data = serde_json::from_str(data).map_err(bad_value)?;
        let timeout = (timeout_ms.is_finite() && timeout_ms > 0.0).then(|| delay_of(timeout_ms));
        let reply = self.slot(slot)?.worker(wid)?.request(data, timeout)?;
        Ok(self.complete_later(reply))
    }

    pub(crate) fn worker_closed(&self, slot: u32, wid: &str) -> Result<u64, ScriptError> {
        let handle = self.slot(slot)?.worker(wid)?;
        Ok(self.complete_later(async move { handle.closed().await.map(|()| Json::Null) }))
    }

    pub(crate) fn worker_terminate(&self, slot: u32, wid: &str) -> Result<(), ScriptError> {
        self.slot(slot)?.worker(wid)?.terminate();
        Ok(())
    }

    pub(crate) fn worker_set_frame(
        &self,
        slot: u32,
        wid: &str,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<(), ScriptError> {
        self.slot(slot)?.worker(wid)?.set_frame(x, y, width, height)
    }

    /// Route one kind of worker event to the script, or stop routing it
    pub(crate) fn worker_listen(&self, slot: u32, wid: &str, kind: &str, on: bool) -> Result<(), ScriptError> {
        let handle = self.slot(slot)?.worker(wid)?;
        let weak = self.this.clone();
        let wid = wid.to_string();
        let forward = move |kind: &'static str, payload: Json| {
            if let Some(state) = weak.upgrade() {
                state.notify("workerEvent", json!([slot, wid, kind, payload]));
            }
        };

        match kind {
            "message" | "messageerror" => {
                let kind = if kind == "message" { "message" } else { "messageerror" };
                let handler: Option<MessageHandler> = on.then(|| {
                    Rc::new(move |event: MessageEvent| {
                        forward(kind, json!({"data": event.data, "origin": event.origin}));
                    }) as MessageHandler
                });
                if kind == "message" {
                    handle.set_on_message(handler);
                } else {
                    handle.set_on_message_error(handler);
                }
            }
            "error" => {
                let handler: Option<ErrorHandler> = on.then(|| {
                    Rc::new(move |error: &WorkerError| {
                        forward("error", serde_json::to_value(&error.0).unwrap_or(Json::Null));
                    }) as ErrorHandler
                });
                handle.set_on_error(handler);
            }
            "close" => {
                let handler: Option<CloseHandler> =
                    on.then(|| Rc::new(move || forward("close", Json::Null)) as CloseHandler);
                handle.set_on_close(handler);
            }
            other => return Err(ScriptError::thrown(format!("unknown worker event {other}"))),
        }
        Ok(())
    }

    pub(crate) fn end_add(&self, slot: u32, id: u32) -> Result<(), ScriptError> {
        let s = self.slot(slot)?;
        let weak = self.this.clone();
        let listener = s.scope.end_listeners.add(Box::new(move || {
            let state = weak.upgrade().ok_or(ScriptError::ScriptStopped)?;
            state.core()?.call_or_defer("endCallback", json!([slot, id]))
        }));
        s.end_callbacks.borrow_mut().insert(id, listener);
        Ok(())
    }

    pub(crate) fn end_remove(&self, slot: u32, id: u32) -> Result<(), ScriptError> {
        let s = self.slot(slot)?;
        let listener = s.end_callbacks.borrow_mut().remove(&id);
        if let Some(listener) = listener {
            s.scope.end_listeners.remove(listener);
        }
        Ok(())
    }

    pub(crate) fn host_call(&self, member: &str, args: &str) -> Result<Json, ScriptError> {
        for decision in [self.policy.check_capability(member), self.policy.check_host_member(member)] {
            if let PolicyDecision::Deny(reason) = decision {
                return Err(ScriptError::Unavailable {
                    name: member.to_string(),
                    message: reason.message,
                });
            }
        }
        let args: Vec<Json> = serde_json::from_str(args).map_err(bad_value)?;
        tracing::debug!(member, "host call");
        match self.host.handle(HostRequest::Call {
            member: member.to_string(),
            args,
        }) {
            HostResponse::Value(value) => Ok(value),
            HostResponse::Ok => Ok(Json::Null),
            HostResponse::Error(message) => Err(ScriptError::thrown(message)),
        }
    }

    pub(crate) fn dom_create(&self, slot: u32, kind: &str, spec: &str) -> Result<Json, ScriptError> {
        let spec: NodeSpec = serde_json::from_str(spec).map_err(bad_value)?;
        self.slot(slot)?.dom.create(kind, spec)
    }
}

/// A framed script bound to one slot
struct JsProgram {
    state: Rc<HostState>,
    slot: u32,
    request_id: RequestId,
    framed: Option<String>,
    done: Option<oneshot::Receiver<Result<ScriptValue, ScriptError>>>,
}

impl ScriptProgram for JsProgram {
    fn start(&mut self) -> Result<ScriptFuture, ScriptError> {
        let (Some(framed), Some(done)) = (self.framed.take(), self.done.take()) else {
            return Err(ScriptError::thrown("script was already started"));
        };
        self.state
            .core()?
            .call("start", json!([self.slot, framed, self.request_id.as_str()]))?;
        Ok(Box::pin(async move {
            done.await.unwrap_or(Err(ScriptError::ScriptStopped))
        }))
    }

    fn cancel_inner(&mut self) {
        self.state.notify("cancel", json!([self.slot]));
    }

    fn take_on_end(&mut self) -> Option<EndCallback> {
        let state = self.state.clone();
        let slot = self.slot;
        Some(Box::new(move || {
            state.core()?.call_or_defer("onEnd", json!([slot]))
        }))
    }
}

/// Runs scripts for the plugin
#[derive(Clone)]
pub struct ScriptHost {
    state: Rc<HostState>,
}

impl ScriptHost {
    pub fn new(supervisor: Supervisor, config: ScriptConfig, policy: CapabilityPolicy, host: HostApi) -> Self {
        Self {
            state: Rc::new_cyclic(|this| HostState {
                this: this.clone(),
                supervisor,
                config,
                policy,
                host,
                table: CapabilityTable::new(),
                core: OnceCell::new(),
                slots: RefCell::new(HashMap::new()),
                next_slot: Cell::new(0),
                next_call: Cell::new(0),
            }),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.state.supervisor
    }

    pub fn table(&self) -> &CapabilityTable {
        &self.state.table
    }

    /// Start `source` under `id`.
    ///
    /// Must be called inside a `LocalSet`. Fails without starting anything
    /// when the policy refuses the script or the engine cannot start.
    pub fn run(&self, id: RequestId, source: &str) -> Result<(Invocation, Completion), ScriptError> {
        if let PolicyDecision::Deny(reason) = self.state.policy.check_script(source) {
            tracing::warn!(request_id = %id, code = %reason.code, "script refused by policy");
            return Err(ScriptError::Denied {
                code: reason.code,
                message: reason.message,
            });
        }
        self.state.ensure_ready()?;
        let framed = self.state.table.frame(source);
        let state = self.state.clone();
        self.state
            .supervisor
            .invoke(id, move |scope| state.build(scope, framed))
    }

    /// Run `source` to completion
    pub async fn execute(&self, id: RequestId, source: &str) -> Result<ScriptValue, ScriptError> {
        let (_, completion) = self.run(id, source)?;
        completion.await
    }
}

impl ScriptDispatcher for ScriptHost {
    fn eval(&self, id: RequestId, js: String) {
        let host = self.clone();
        tokio::task::spawn_local(async move {
            let message = match host.execute(id.clone(), &js).await {
                Ok(result) => PluginMessage::EvalResponse {
                    id,
                    result,
                    error: None,
                },
                Err(error) => PluginMessage::EvalResponse {
                    id,
                    result: None,
                    error: Some(error.to_failure()),
                },
            };
            if let Err(error) = host.state.supervisor.send(message) {
                tracing::warn!(%error, "failed to send eval response");
            }
        });
    }
}
