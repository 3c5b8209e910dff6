//! Script invocation controller
//!
//! Drives one script run from start to settlement. The script itself sits
//! behind [`ScriptProgram`], so the settlement rules here hold for any
//! engine:
//!
//! - fulfillment waits for the invocation's timers to drain, then runs the
//!   end hook and resolves;
//! - rejection (or a failure while starting) cancels all timers right away,
//!   runs the end hook and rejects with a normalized stack;
//! - [`Invocation::cancel`] settles immediately, resolving with no value
//!   when no reason is given.
//!
//! Whichever happens first wins; later outcomes are dropped. The end hook
//! runs exactly once.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use figpad_protocol::RequestId;

use crate::{CancelFlag, ScriptError, TimerRegistry, WorkerScope};

/// Script result; `None` is `undefined`
pub type ScriptValue = Option<serde_json::Value>;

/// Future of the script's own completion, before any timer draining
pub type ScriptFuture = Pin<Box<dyn Future<Output = Result<ScriptValue, ScriptError>>>>;

/// Callback run when an invocation ends
pub type EndCallback = Box<dyn FnOnce() -> Result<(), ScriptError>>;

/// Handle returned by [`EndListeners::add`]
pub type ListenerId = u64;

/// A script ready to run inside an invocation
pub trait ScriptProgram {
    /// Call the script's entry point
    fn start(&mut self) -> Result<ScriptFuture, ScriptError>;

    /// Make the cancellation visible to script code
    fn cancel_inner(&mut self);

    /// The script's `onend` hook, read when the invocation ends
    fn take_on_end(&mut self) -> Option<EndCallback>;
}

#[derive(Default)]
struct ListenerState {
    next_id: ListenerId,
    items: Vec<(ListenerId, EndCallback)>,
}

/// Callbacks registered to run after the script's own `onend`
#[derive(Clone, Default)]
pub struct EndListeners(Rc<RefCell<ListenerState>>);

impl EndListeners {
    pub fn add(&self, callback: EndCallback) -> ListenerId {
        let mut state = self.0.borrow_mut();
        state.next_id += 1;
        let id = state.next_id;
        state.items.push((id, callback));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut state = self.0.borrow_mut();
        let before = state.items.len();
        state.items.retain(|(i, _)| *i != id);
        state.items.len() != before
    }

    pub fn len(&self) -> usize {
        self.0.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_all(&self) -> Vec<EndCallback> {
        std::mem::take(&mut self.0.borrow_mut().items)
            .into_iter()
            .map(|(_, cb)| cb)
            .collect()
    }
}

/// Per-invocation state handed to the environment builder
#[derive(Clone)]
pub struct InvocationScope {
    pub request_id: RequestId,
    pub canceled: CancelFlag,
    pub timers: TimerRegistry,
    pub workers: WorkerScope,
    pub end_listeners: EndListeners,
}

impl InvocationScope {
    pub fn new(request_id: RequestId, workers: WorkerScope) -> Self {
        let canceled = CancelFlag::new();
        Self {
            request_id,
            timers: TimerRegistry::new(canceled.clone()),
            canceled,
            workers,
            end_listeners: EndListeners::default(),
        }
    }
}

type Settle = oneshot::Sender<Result<ScriptValue, ScriptError>>;

struct Shared {
    scope: InvocationScope,
    program: RefCell<Option<Box<dyn ScriptProgram>>>,
    ended: Cell<bool>,
    settle: RefCell<Option<Settle>>,
    driver: RefCell<Option<JoinHandle<()>>>,
}

/// Settled outcome of an invocation
pub struct Completion(oneshot::Receiver<Result<ScriptValue, ScriptError>>);

impl Future for Completion {
    type Output = Result<ScriptValue, ScriptError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ScriptError::ScriptStopped)))
    }
}

/// Handle to a running script
#[derive(Clone)]
pub struct Invocation {
    shared: Rc<Shared>,
}

impl Invocation {
    /// Build the program with `build` and start it.
    ///
    /// Must be called inside a `LocalSet`. A failing `build` or a failing
    /// start settles the invocation as a rejection.
    pub fn start<B>(scope: InvocationScope, build: B) -> (Self, Completion)
    where
        B: FnOnce(&InvocationScope) -> Result<Box<dyn ScriptProgram>, ScriptError>,
    {
        let (settle, done) = oneshot::channel();
        let invocation = Self {
            shared: Rc::new(Shared {
                scope,
                program: RefCell::new(None),
                ended: Cell::new(false),
                settle: RefCell::new(Some(settle)),
                driver: RefCell::new(None),
            }),
        };

        let workers = invocation.shared.scope.workers.clone();
        invocation.shared.scope.end_listeners.add(Box::new(move || {
            workers.end();
            Ok(())
        }));

        tracing::info!(request_id = %invocation.request_id(), "starting script");
        match build(&invocation.shared.scope) {
            Ok(mut program) => {
                let started = program.start();
                *invocation.shared.program.borrow_mut() = Some(program);
                match started {
                    Ok(future) => invocation.drive(future),
                    Err(error) => invocation.fail(error),
                }
            }
            Err(error) => invocation.fail(error),
        }

        (invocation, Completion(done))
    }

    pub fn request_id(&self) -> &RequestId {
        &self.shared.scope.request_id
    }

    pub fn scope(&self) -> &InvocationScope {
        &self.shared.scope
    }

    pub fn is_settled(&self) -> bool {
        self.shared.settle.borrow().is_none()
    }

    /// Stop the script. Without a reason the invocation resolves with no
    /// value; with one it rejects with it. No-op once settled.
    pub fn cancel(&self, reason: Option<ScriptError>) {
        if self.is_settled() {
            return;
        }
        tracing::info!(request_id = %self.request_id(), ?reason, "cancelling script");
        self.shared.scope.canceled.cancel();

        let program = self.shared.program.borrow_mut().take();
        if let Some(mut program) = program {
            program.cancel_inner();
            *self.shared.program.borrow_mut() = Some(program);
        }

        self.shared
            .scope
            .timers
            .cancel_all(reason.clone().unwrap_or(ScriptError::Cancelled));
        self.run_end();
        self.settle(reason.map_or(Ok(None), Err));

        if let Some(driver) = self.shared.driver.borrow_mut().take() {
            driver.abort();
        }
    }

    fn drive(&self, future: ScriptFuture) {
        let this = self.clone();
        let driver = tokio::task::spawn_local(async move {
            match future.await {
                Ok(value) => match this.shared.scope.timers.wait_idle().await {
                    Ok(()) => this.finish(value),
                    Err(error) => this.fail(error),
                },
                Err(error) => this.fail(error),
            }
        });
        *self.shared.driver.borrow_mut() = Some(driver);
    }

    fn finish(&self, value: ScriptValue) {
        if self.is_settled() {
            return;
        }
        self.run_end();
        tracing::info!(request_id = %self.request_id(), "script finished");
        self.settle(Ok(value));
    }

    fn fail(&self, error: ScriptError) {
        if self.is_settled() {
            return;
        }
        self.shared.scope.timers.cancel_all(error.clone());
        self.run_end();
        tracing::info!(request_id = %self.request_id(), %error, "script failed");
        self.settle(Err(error.normalized()));
    }

    fn settle(&self, result: Result<ScriptValue, ScriptError>) {
        if let Some(settle) = self.shared.settle.borrow_mut().take() {
            let _ = settle.send(result);
        }
    }

    /// One-shot: the script's `onend`, then every end listener
    fn run_end(&self) {
        if self.shared.ended.replace(true) {
            return;
        }
        let on_end = self
            .shared
            .program
            .borrow_mut()
            .as_mut()
            .and_then(|p| p.take_on_end());
        if let Some(on_end) = on_end {
            if let Err(error) = on_end() {
                tracing::warn!(%error, "uncaught exception in onend");
            }
        }
        // Listeners may register more listeners while running
        loop {
            let listeners = self.shared.scope.end_listeners.take_all();
            if listeners.is_empty() {
                break;
            }
            for listener in listeners {
                if let Err(error) = listener() {
                    tracing::warn!(%error, "end callback failed");
                }
            }
        }
    }
}
