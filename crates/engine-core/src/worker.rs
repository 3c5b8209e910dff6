//! Worker bridge
//!
//! Scripts can start workers: separate execution contexts hosted by the UI.
//! Each worker is a logical channel over the plugin ↔ UI transport.
//! The bridge keeps the process-wide map from worker id to handle so that
//! inbound messages reach the right worker. [`WorkerScope`] ties a set of
//! workers to one invocation and tears them down when it ends.
//!
//! Lifecycle of a handle:
//!
//! ```text
//! Pending --create ok--> Active --close / terminate--> Closed
//!    \____________________ terminate __________________/
//! ```
//!
//! Messages posted while `Pending` are queued and flushed in order once the
//! UI acknowledges creation.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use figpad_protocol::{
    base36, CtrlSignal, HostMessage, IframeOptions, PluginMessage, RequestId, WorkerErrorInfo,
    WorkerId, REQUEST_ERROR_PROP, REQUEST_ID_PROP,
};

use crate::{PluginSender, ScriptError, WorkerError};

/// Event handed to `onmessage` / `onmessageerror`
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// `"message"` or the evtype of a failed delivery
    pub kind: String,
    pub data: Value,
    pub origin: String,
}

pub type MessageHandler = Rc<dyn Fn(MessageEvent)>;
pub type ErrorHandler = Rc<dyn Fn(&WorkerError)>;
pub type CloseHandler = Rc<dyn Fn()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Pending,
    Active,
    Closed,
}

/// Options for `WorkerScope::create_worker`
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub iframe: Option<IframeOptions>,
}

impl WorkerOptions {
    /// Worker shown in a visible iframe
    pub fn window(iframe: IframeOptions) -> Self {
        Self {
            iframe: Some(IframeOptions {
                visible: true,
                ..iframe
            }),
        }
    }
}

type Settle<T> = oneshot::Sender<Result<T, ScriptError>>;

struct PendingRequest {
    settle: Settle<Value>,
    timeout: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Handlers {
    on_message: Option<MessageHandler>,
    on_message_error: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_close: Option<CloseHandler>,
}

struct WorkerState {
    id: WorkerId,
    owner: RequestId,
    phase: WorkerPhase,
    terminated: bool,
    last_error: Option<WorkerError>,
    queue: Vec<Value>,
    recv_waiters: Vec<Settle<Value>>,
    requests: HashMap<String, PendingRequest>,
    next_request: u64,
    handlers: Handlers,
    iframe: Option<IframeOptions>,
    outcome: Option<Result<(), ScriptError>>,
    done_waiters: Vec<Settle<()>>,
}

/// Reply to `recv` or `request`
pub struct Reply(oneshot::Receiver<Result<Value, ScriptError>>);

impl Future for Reply {
    type Output = Result<Value, ScriptError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ScriptError::WorkerClosed)))
    }
}

/// Handle to one worker
#[derive(Clone)]
pub struct WorkerHandle {
    state: Rc<RefCell<WorkerState>>,
    bridge: Weak<BridgeShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.state.borrow().id.clone()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.state.borrow().phase
    }

    pub fn is_terminated(&self) -> bool {
        self.state.borrow().terminated
    }

    pub fn last_error(&self) -> Option<WorkerError> {
        self.state.borrow().last_error.clone()
    }

    /// Whether this worker is shown in a visible iframe
    pub fn is_window(&self) -> bool {
        self.state
            .borrow()
            .iframe
            .as_ref()
            .is_some_and(|f| f.visible)
    }

    pub fn set_on_message(&self, handler: Option<MessageHandler>) {
        self.state.borrow_mut().handlers.on_message = handler;
    }

    pub fn set_on_message_error(&self, handler: Option<MessageHandler>) {
        self.state.borrow_mut().handlers.on_message_error = handler;
    }

    pub fn set_on_error(&self, handler: Option<ErrorHandler>) {
        self.state.borrow_mut().handlers.on_error = handler;
    }

    pub fn set_on_close(&self, handler: Option<CloseHandler>) {
        self.state.borrow_mut().handlers.on_close = handler;
    }

    fn bridge(&self) -> Result<Rc<BridgeShared>, ScriptError> {
        self.bridge.upgrade().ok_or(ScriptError::WorkerTerminated)
    }

    /// Send `data` to the worker, queueing it until creation is acknowledged
    pub fn post_message(&self, data: Value) -> Result<(), ScriptError> {
        let id = {
            let mut state = self.state.borrow_mut();
            if state.terminated {
                return Err(ScriptError::WorkerTerminated);
            }
            if state.phase == WorkerPhase::Pending {
                state.queue.push(data);
                return Ok(());
            }
            state.id.clone()
        };
        self.bridge()?.send(PluginMessage::worker_message(id, data))
    }

    /// Wait for the next message. Concurrent callers share the message.
    pub fn recv(&self) -> Result<Reply, ScriptError> {
        let mut state = self.state.borrow_mut();
        if state.terminated {
            return Err(ScriptError::WorkerTerminated);
        }
        let (tx, rx) = oneshot::channel();
        state.recv_waiters.push(tx);
        Ok(Reply(rx))
    }

    /// Send `data` and wait for the correlated response.
    ///
    /// With a non-zero `timeout` the reply fails with `RequestTimeout` when
    /// no response arrived in time; a response arriving later is dropped.
    pub fn request(&self, data: Value, timeout: Option<Duration>) -> Result<Reply, ScriptError> {
        let request_id = {
            let mut state = self.state.borrow_mut();
            if state.terminated {
                return Err(ScriptError::WorkerTerminated);
            }
            let seq = state.next_request;
            state.next_request += 1;
            format!("{}.{}", state.owner, base36(seq))
        };

        let mut payload = serde_json::Map::new();
        payload.insert(REQUEST_ID_PROP.into(), Value::String(request_id.clone()));
        payload.insert("data".into(), data);
        self.post_message(Value::Object(payload))?;

        let timeout = timeout.filter(|d| !d.is_zero()).map(|delay| {
            let handle = self.clone();
            let request_id = request_id.clone();
            tokio::task::spawn_local(async move {
                tokio::time::sleep(delay).await;
                let pending = handle.state.borrow_mut().requests.remove(&request_id);
                if let Some(pending) = pending {
                    tracing::debug!(%request_id, "worker request timed out");
                    let _ = pending.settle.send(Err(ScriptError::RequestTimeout));
                }
            })
        });

        let (settle, rx) = oneshot::channel();
        tracing::debug!(%request_id, "worker request sent");
        self.state
            .borrow_mut()
            .requests
            .insert(request_id, PendingRequest { settle, timeout });
        Ok(Reply(rx))
    }

    /// Resize or move a windowed worker
    pub fn set_frame(&self, x: f64, y: f64, width: f64, height: f64) -> Result<(), ScriptError> {
        if !self.is_window() {
            return Err(ScriptError::thrown("setFrame is only available on windows"));
        }
        self.bridge()?.send(PluginMessage::WorkerSetFrame {
            worker_id: self.id(),
            x,
            y,
            width,
            height,
        })
    }

    /// Completes when the worker closes; fails with its last error, if any
    pub async fn closed(&self) -> Result<(), ScriptError> {
        let done = {
            let mut state = self.state.borrow_mut();
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.done_waiters.push(tx);
            rx
        };
        done.await.unwrap_or(Err(ScriptError::WorkerClosed))
    }

    /// Stop the worker. Runs the local close path first; the UI is told
    /// only if the worker was still registered.
    pub fn terminate(&self) {
        self.close_locally();
        let id = {
            let mut state = self.state.borrow_mut();
            state.terminated = true;
            state.id.clone()
        };
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        if bridge.unregister(&id) {
            tracing::debug!(worker_id = %id, "terminating worker");
            let msg = PluginMessage::WorkerCtrl {
                signal: CtrlSignal::Terminate,
                worker_id: id,
            };
            if let Err(error) = bridge.send(msg) {
                tracing::warn!(%error, "failed to send worker terminate");
            }
        }
    }

    /// Terminate with `reason` recorded as the error, unless one is already set
    pub fn cancel(&self, reason: &ScriptError) {
        {
            let mut state = self.state.borrow_mut();
            if state.last_error.is_none() {
                state.last_error = Some(WorkerError::message(reason.to_string()));
            }
        }
        self.terminate();
    }

    fn on_created(&self, error: Option<WorkerErrorInfo>) {
        let (id, queued) = {
            let mut state = self.state.borrow_mut();
            if state.terminated {
                tracing::debug!(worker_id = %state.id, "worker terminated before it started");
                return;
            }
            if let Some(info) = error {
                let error = WorkerError(info);
                state.last_error = Some(error.clone());
                let on_error = state.handlers.on_error.clone();
                let id = state.id.clone();
                drop(state);
                match on_error {
                    Some(handler) => {
                        handler(&error);
                        self.terminate();
                    }
                    None => tracing::error!(worker_id = %id, %error, "worker creation failed"),
                }
                return;
            }
            state.phase = WorkerPhase::Active;
            (state.id.clone(), std::mem::take(&mut state.queue))
        };
        tracing::debug!(worker_id = %id, queued = queued.len(), "worker created");

        let Ok(bridge) = self.bridge() else {
            return;
        };
        for data in queued {
            if let Err(error) = bridge.send(PluginMessage::worker_message(id.clone(), data)) {
                tracing::warn!(worker_id = %id, %error, "failed to flush queued worker message");
            }
        }
    }

    fn on_message(&self, evtype: &str, data: Value) {
        if self.is_terminated() {
            return;
        }

        if evtype == "message" {
            if let Some(request_id) = data.get(REQUEST_ID_PROP).and_then(Value::as_str) {
                let pending = self.state.borrow_mut().requests.remove(request_id);
                match pending {
                    Some(pending) => {
                        if let Some(timeout) = pending.timeout {
                            timeout.abort();
                        }
                        let result = match data.get(REQUEST_ERROR_PROP) {
                            Some(err) if is_truthy(err) => {
                                Err(ScriptError::thrown(display_value(err)))
                            }
                            _ => Ok(data.get("data").cloned().unwrap_or(Value::Null)),
                        };
                        let _ = pending.settle.send(result);
                    }
                    None => tracing::debug!(request_id, "response to unknown or expired request"),
                }
                return;
            }
        }

        let (handler, waiters, origin) = {
            let mut state = self.state.borrow_mut();
            let handler = if evtype == "message" {
                state.handlers.on_message.clone()
            } else {
                state.handlers.on_message_error.clone()
            };
            (
                handler,
                std::mem::take(&mut state.recv_waiters),
                state.id.origin(),
            )
        };

        if let Some(handler) = handler {
            handler(MessageEvent {
                kind: if evtype == "message" {
                    "message".into()
                } else {
                    "messageerror".into()
                },
                data: data.clone(),
                origin,
            });
        }
        for waiter in waiters {
            let result = if evtype == "message" {
                Ok(data.clone())
            } else {
                Err(ScriptError::thrown(display_value(&data)))
            };
            let _ = waiter.send(result);
        }
    }

    fn on_error(&self, error: WorkerError) {
        let handler = {
            let mut state = self.state.borrow_mut();
            state.last_error = Some(error.clone());
            state.handlers.on_error.clone()
        };
        match handler {
            Some(handler) => handler(&error),
            None => tracing::warn!(%error, "unhandled worker error"),
        }
    }

    /// Idempotent close: fail waiters, notify `onclose`, settle completion
    fn close_locally(&self) {
        let (waiters, requests, on_close, done, outcome, reason) = {
            let mut state = self.state.borrow_mut();
            if state.phase == WorkerPhase::Closed {
                return;
            }
            state.phase = WorkerPhase::Closed;
            state.terminated = true;
            let error = state.last_error.clone().map(ScriptError::Worker);
            let reason = error.clone().unwrap_or(ScriptError::WorkerClosed);
            let outcome = error.map_or(Ok(()), Err);
            state.outcome = Some(outcome.clone());
            tracing::debug!(worker_id = %state.id, "worker closed");
            (
                std::mem::take(&mut state.recv_waiters),
                std::mem::take(&mut state.requests),
                state.handlers.on_close.clone(),
                std::mem::take(&mut state.done_waiters),
                outcome,
                reason,
            )
        };

        for waiter in waiters {
            let _ = waiter.send(Err(reason.clone()));
        }
        for (_, pending) in requests {
            if let Some(timeout) = pending.timeout {
                timeout.abort();
            }
            let _ = pending.settle.send(Err(reason.clone()));
        }
        if let Some(on_close) = on_close {
            on_close();
        }
        for waiter in done {
            let _ = waiter.send(outcome.clone());
        }
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct BridgeShared {
    outbox: Rc<dyn PluginSender>,
    workers: RefCell<HashMap<WorkerId, WorkerHandle>>,
}

impl BridgeShared {
    fn send(&self, message: PluginMessage) -> Result<(), ScriptError> {
        self.outbox
            .send(message)
            .map_err(|e| ScriptError::Transport(e.to_string()))
    }

    fn unregister(&self, id: &WorkerId) -> bool {
        self.workers.borrow_mut().remove(id).is_some()
    }
}

/// Process-wide worker registry and inbound dispatch
#[derive(Clone)]
pub struct WorkerBridge {
    shared: Rc<BridgeShared>,
    next_worker: Rc<Cell<u64>>,
}

impl WorkerBridge {
    pub fn new(outbox: Rc<dyn PluginSender>) -> Self {
        Self {
            shared: Rc::new(BridgeShared {
                outbox,
                workers: RefCell::new(HashMap::new()),
            }),
            next_worker: Rc::new(Cell::new(0)),
        }
    }

    /// Worker factory bound to one invocation
    pub fn scope(&self, owner: RequestId) -> WorkerScope {
        WorkerScope {
            inner: Rc::new(ScopeInner {
                owner,
                bridge: self.clone(),
                ended: Cell::new(false),
                workers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.shared.workers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &WorkerId) -> Option<WorkerHandle> {
        self.shared.workers.borrow().get(id).cloned()
    }

    /// Route an inbound worker message to its handle
    pub fn dispatch(&self, message: HostMessage) {
        let Some(worker_id) = message.worker_id().cloned() else {
            tracing::warn!(?message, "worker bridge received a non-worker message");
            return;
        };
        let Some(worker) = self.get(&worker_id) else {
            // Close and terminate race each other, so this is expected
            tracing::debug!(%worker_id, "message for unknown worker");
            return;
        };

        match message {
            HostMessage::WorkerCreateRes { error, .. } => worker.on_created(error),
            HostMessage::WorkerMessage { evtype, data, .. } => worker.on_message(&evtype, data),
            HostMessage::WorkerError { error, .. } => worker.on_error(WorkerError(error)),
            HostMessage::WorkerCtrl {
                signal: CtrlSignal::Close,
                ..
            } => {
                worker.close_locally();
                self.shared.unregister(&worker_id);
            }
            HostMessage::WorkerCtrl { signal, .. } => {
                tracing::error!(%worker_id, ?signal, "unexpected worker control message");
            }
            other => tracing::warn!(?other, "unexpected worker message"),
        }
    }

    /// Terminate every registered worker
    pub fn terminate_all(&self, reason: &ScriptError) {
        let workers: Vec<WorkerHandle> = self.shared.workers.borrow().values().cloned().collect();
        for worker in workers {
            worker.cancel(reason);
        }
    }
}

struct ScopeInner {
    owner: RequestId,
    bridge: WorkerBridge,
    ended: Cell<bool>,
    workers: RefCell<Vec<WorkerHandle>>,
}

/// Workers created by one invocation
#[derive(Clone)]
pub struct WorkerScope {
    inner: Rc<ScopeInner>,
}

impl WorkerScope {
    pub fn owner(&self) -> &RequestId {
        &self.inner.owner
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.get()
    }

    /// Ask the UI to start a worker running `js`
    pub fn create_worker(&self, js: String, options: WorkerOptions) -> Result<WorkerHandle, ScriptError> {
        if self.is_ended() {
            tracing::info!(owner = %self.inner.owner, "ignoring createWorker call after script has been stopped");
            return Err(ScriptError::ScriptStopped);
        }

        let bridge = &self.inner.bridge;
        let seq = bridge.next_worker.get();
        bridge.next_worker.set(seq + 1);
        let id = WorkerId::new(&self.inner.owner, seq);

        let handle = WorkerHandle {
            state: Rc::new(RefCell::new(WorkerState {
                id: id.clone(),
                owner: self.inner.owner.clone(),
                phase: WorkerPhase::Pending,
                terminated: false,
                last_error: None,
                queue: Vec::new(),
                recv_waiters: Vec::new(),
                requests: HashMap::new(),
                next_request: 0,
                handlers: Handlers::default(),
                iframe: options.iframe.clone(),
                outcome: None,
                done_waiters: Vec::new(),
            })),
            bridge: Rc::downgrade(&bridge.shared),
        };

        tracing::debug!(worker_id = %id, "requesting worker");
        bridge.shared.send(PluginMessage::WorkerCreateReq {
            worker_id: id.clone(),
            js,
            iframe: options.iframe,
        })?;

        // Registered only once the request is out; the reply is dispatched
        // on a later turn of the loop.
        bridge.shared.workers.borrow_mut().insert(id, handle.clone());
        self.inner.workers.borrow_mut().push(handle.clone());
        Ok(handle)
    }

    /// Terminate every worker of this invocation and refuse new ones
    pub fn end(&self) {
        self.inner.ended.set(true);
        let workers = std::mem::take(&mut *self.inner.workers.borrow_mut());
        if !workers.is_empty() {
            tracing::debug!(owner = %self.inner.owner, count = workers.len(), "terminating workers");
        }
        for worker in workers {
            worker.cancel(&ScriptError::ScriptStopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportError;
    use serde_json::json;
    use tokio::task::LocalSet;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<PluginMessage>>);

    impl PluginSender for Recorder {
        fn send(&self, message: PluginMessage) -> Result<(), TransportError> {
            self.0.borrow_mut().push(message);
            Ok(())
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<PluginMessage> {
            std::mem::take(&mut *self.0.borrow_mut())
        }
    }

    fn setup() -> (Rc<Recorder>, WorkerBridge, WorkerScope) {
        let recorder = Rc::new(Recorder::default());
        let bridge = WorkerBridge::new(recorder.clone());
        let scope = bridge.scope(RequestId::new("r1"));
        (recorder, bridge, scope)
    }

    fn created(id: &WorkerId) -> HostMessage {
        HostMessage::WorkerCreateRes {
            worker_id: id.clone(),
            error: None,
        }
    }

    fn message(id: &WorkerId, data: Value) -> HostMessage {
        HostMessage::WorkerMessage {
            worker_id: id.clone(),
            evtype: "message".into(),
            data,
        }
    }

    #[test]
    fn ids_are_sequential_base36() {
        let (recorder, _bridge, scope) = setup();
        let ids: Vec<_> = (0..12)
            .map(|_| scope.create_worker("x".into(), WorkerOptions::default()).unwrap().id())
            .collect();
        assert_eq!(ids[0].as_str(), "r1.0");
        assert_eq!(ids[11].as_str(), "r1.b");
        assert!(matches!(recorder.take()[0], PluginMessage::WorkerCreateReq { .. }));
    }

    #[test]
    fn queued_messages_flush_in_order_after_creation() {
        let (recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        recorder.take();

        worker.post_message(json!(1)).unwrap();
        worker.post_message(json!(2)).unwrap();
        worker.post_message(json!(3)).unwrap();
        assert!(recorder.take().is_empty());

        bridge.dispatch(created(&worker.id()));
        worker.post_message(json!(4)).unwrap();

        let sent: Vec<Value> = recorder
            .take()
            .into_iter()
            .map(|m| match m {
                PluginMessage::WorkerMessage { data, .. } => data,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sent, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(worker.phase(), WorkerPhase::Active);
    }

    #[tokio::test]
    async fn messages_reach_handler_and_recv() {
        let (_recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        worker.set_on_message(Some(Rc::new(move |ev: MessageEvent| sink.borrow_mut().push(ev))));

        let reply = worker.recv().unwrap();
        bridge.dispatch(message(&worker.id(), json!({"hello": "world"})));
        assert_eq!(reply.await.unwrap(), json!({"hello": "world"}));

        let events = seen.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "message");
        assert_eq!(events[0].origin, "figpad-worker:r1.0");
    }

    #[tokio::test]
    async fn message_errors_reject_recv() {
        let (_recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        let reply = worker.recv().unwrap();
        bridge.dispatch(HostMessage::WorkerMessage {
            worker_id: worker.id(),
            evtype: "messageerror".into(),
            data: json!("could not clone"),
        });
        assert_eq!(reply.await.unwrap_err(), ScriptError::thrown("could not clone"));
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let (recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        bridge.dispatch(created(&worker.id()));
        recorder.take();

        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        worker.set_on_message(Some(Rc::new(move |_: MessageEvent| s.set(s.get() + 1))));

        let ok = worker.request(json!({"q": 1}), None).unwrap();
        let failed = worker.request(json!({"q": 2}), None).unwrap();

        let ids: Vec<String> = recorder
            .take()
            .into_iter()
            .map(|m| match m {
                PluginMessage::WorkerMessage { data, .. } => {
                    data[REQUEST_ID_PROP].as_str().unwrap().to_string()
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["r1.0", "r1.1"]);

        bridge.dispatch(message(
            &worker.id(),
            json!({ REQUEST_ID_PROP: ids[1], REQUEST_ERROR_PROP: "nope" }),
        ));
        bridge.dispatch(message(&worker.id(), json!({ REQUEST_ID_PROP: ids[0], "data": 42 })));

        assert_eq!(ok.await.unwrap(), json!(42));
        assert_eq!(failed.await.unwrap_err(), ScriptError::thrown("nope"));
        assert_eq!(seen.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_ignores_late_response() {
        LocalSet::new()
            .run_until(async {
                let (_recorder, bridge, scope) = setup();
                let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
                bridge.dispatch(created(&worker.id()));

                let reply = worker.request(json!(null), Some(Duration::from_millis(50))).unwrap();
                assert_eq!(reply.await.unwrap_err(), ScriptError::RequestTimeout);

                let seen = Rc::new(Cell::new(0));
                let s = seen.clone();
                worker.set_on_message(Some(Rc::new(move |_: MessageEvent| s.set(s.get() + 1))));
                bridge.dispatch(message(&worker.id(), json!({ REQUEST_ID_PROP: "r1.0", "data": 1 })));
                assert_eq!(seen.get(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        let closes = Rc::new(Cell::new(0));
        let c = closes.clone();
        worker.set_on_close(Some(Rc::new(move || c.set(c.get() + 1))));
        let reply = worker.recv().unwrap();

        let close = HostMessage::WorkerCtrl {
            worker_id: worker.id(),
            signal: CtrlSignal::Close,
        };
        bridge.dispatch(close.clone());
        bridge.dispatch(close);

        assert_eq!(closes.get(), 1);
        assert!(bridge.is_empty());
        assert_eq!(reply.await.unwrap_err(), ScriptError::WorkerClosed);
        assert_eq!(worker.closed().await, Ok(()));
        assert_eq!(worker.post_message(json!(1)), Err(ScriptError::WorkerTerminated));
    }

    #[tokio::test]
    async fn worker_error_then_close_rejects_completion() {
        let (_recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        worker.set_on_error(Some(Rc::new(move |e: &WorkerError| {
            sink.borrow_mut().push(e.to_string())
        })));

        bridge.dispatch(HostMessage::WorkerError {
            worker_id: worker.id(),
            error: WorkerErrorInfo::message("kaput"),
        });
        bridge.dispatch(HostMessage::WorkerCtrl {
            worker_id: worker.id(),
            signal: CtrlSignal::Close,
        });

        assert_eq!(*errors.borrow(), vec!["kaput".to_string()]);
        assert_eq!(
            worker.closed().await,
            Err(ScriptError::Worker(WorkerError::message("kaput")))
        );
    }

    #[test]
    fn terminate_sends_ctrl_once() {
        let (recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        recorder.take();

        worker.terminate();
        worker.terminate();

        let sent = recorder.take();
        assert_eq!(
            sent,
            vec![PluginMessage::WorkerCtrl {
                signal: CtrlSignal::Terminate,
                worker_id: worker.id(),
            }]
        );
        assert!(bridge.is_empty());
        assert!(worker.recv().is_err());
    }

    #[test]
    fn create_failure_with_handler_terminates() {
        let (recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        let failed = Rc::new(Cell::new(false));
        let f = failed.clone();
        worker.set_on_error(Some(Rc::new(move |_: &WorkerError| f.set(true))));

        bridge.dispatch(HostMessage::WorkerCreateRes {
            worker_id: worker.id(),
            error: Some(WorkerErrorInfo::message("no iframe support")),
        });

        assert!(failed.get());
        assert!(worker.is_terminated());
        assert!(matches!(
            recorder.take().last(),
            Some(PluginMessage::WorkerCtrl {
                signal: CtrlSignal::Terminate,
                ..
            })
        ));
    }

    #[test]
    fn create_failure_without_handler_is_only_logged() {
        let (_recorder, bridge, scope) = setup();
        let worker = scope.create_worker("js".into(), WorkerOptions::default()).unwrap();
        bridge.dispatch(HostMessage::WorkerCreateRes {
            worker_id: worker.id(),
            error: Some(WorkerErrorInfo::message("no")),
        });
        assert!(!worker.is_terminated());
        assert_eq!(worker.phase(), WorkerPhase::Pending);
    }

    #[tokio::test]
    async fn scope_end_stops_all_workers() {
        let (recorder, bridge, scope) = setup();
        let a = scope.create_worker("a".into(), WorkerOptions::default()).unwrap();
        let b = scope.create_worker("b".into(), WorkerOptions::default()).unwrap();
        let other = bridge.scope(RequestId::new("r2"));
        let c = other.create_worker("c".into(), WorkerOptions::default()).unwrap();
        recorder.take();

        scope.end();

        assert!(a.is_terminated() && b.is_terminated());
        assert!(!c.is_terminated());
        assert_eq!(
            a.closed().await,
            Err(ScriptError::Worker(WorkerError::message("script stopped")))
        );
        assert_eq!(recorder.take().len(), 2);
        assert_eq!(
            scope.create_worker("late".into(), WorkerOptions::default()).err(),
            Some(ScriptError::ScriptStopped)
        );
    }

    #[tokio::test]
    async fn messages_for_workers_stopped_at_end_are_dropped() {
        let (recorder, bridge, scope) = setup();
        let a = scope.create_worker("a".into(), WorkerOptions::default()).unwrap();
        let b = scope.create_worker("b".into(), WorkerOptions::default()).unwrap();
        bridge.dispatch(created(&a.id()));
        bridge.dispatch(created(&b.id()));

        let handled = Rc::new(Cell::new(0));
        for worker in [&a, &b] {
            let count = handled.clone();
            worker.set_on_message(Some(Rc::new(move |_ev: MessageEvent| count.set(count.get() + 1))));
        }
        let pending = a.recv().unwrap();
        recorder.take();

        scope.end();
        assert!(bridge.is_empty());
        recorder.take();

        bridge.dispatch(message(&a.id(), json!("late")));
        bridge.dispatch(message(&b.id(), json!("late")));

        assert_eq!(handled.get(), 0);
        assert!(recorder.take().is_empty());
        assert!(pending.await.is_err());
        assert_eq!(a.recv().err(), Some(ScriptError::WorkerTerminated));
    }

    struct ClosedOutbox;

    impl PluginSender for ClosedOutbox {
        fn send(&self, _message: PluginMessage) -> Result<(), TransportError> {
            Err(TransportError::Disconnected)
        }
    }

    #[test]
    fn failed_create_leaves_no_worker_behind() {
        let bridge = WorkerBridge::new(Rc::new(ClosedOutbox));
        let scope = bridge.scope(RequestId::new("r1"));
        let result = scope.create_worker("js".into(), WorkerOptions::default());
        assert!(matches!(result, Err(ScriptError::Transport(_))));
        assert!(bridge.is_empty());
        assert!(scope.inner.workers.borrow().is_empty());
    }

    #[test]
    fn unknown_worker_ids_are_ignored() {
        let (recorder, bridge, _scope) = setup();
        bridge.dispatch(message(&WorkerId("zz.9".into()), json!(1)));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn set_frame_only_on_windows() {
        let (recorder, _bridge, scope) = setup();
        let plain = scope.create_worker("a".into(), WorkerOptions::default()).unwrap();
        assert!(plain.set_frame(0.0, 0.0, 10.0, 10.0).is_err());

        let window = scope
            .create_worker("b".into(), WorkerOptions::window(IframeOptions::default()))
            .unwrap();
        recorder.take();
        window.set_frame(1.0, 2.0, 300.0, 200.0).unwrap();
        assert!(matches!(
            recorder.take()[0],
            PluginMessage::WorkerSetFrame { width, .. } if width == 300.0
        ));
    }
}
