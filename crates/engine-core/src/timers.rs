//! Cooperative timer registry
//!
//! Every timer a script schedules lives in the registry of its invocation
//! until it fires, is cleared, or the invocation cancels everything at once.
//! The registry also answers "is there still pending work", which is what
//! lets a script's completion wait for its timers.
//!
//! Timers run as tasks on the current `LocalSet`; all methods that schedule
//! must be called from inside one.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ScriptError;

/// Opaque handle returned to scripts
pub type TimerId = u32;

/// Callback of a timeout or interval
pub type TimerCallback = Box<dyn FnMut() -> Result<(), ScriptError>>;

/// Handler of a promise-style timer; receives `true` when it was cancelled
pub type DeferredHandler = Box<dyn FnOnce(bool) -> Result<(), ScriptError>>;

/// Animation frame callback; receives seconds since the animation started
pub type FrameCallback = Box<dyn FnMut(f64) -> Result<AnimationStep, ScriptError>>;

/// Receives errors thrown by timer callbacks
pub type UnhandledHook = Rc<dyn Fn(&ScriptError)>;

/// What an animation frame asks for next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationStep {
    Continue,
    Stop,
}

/// Cancellation flag shared by everything belonging to one invocation
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Rc<Cell<bool>>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

type Settle = oneshot::Sender<Result<(), ScriptError>>;

enum Entry {
    Timeout(JoinHandle<()>),
    Interval(JoinHandle<()>),
    /// Promise-style timer or animation
    Deferred {
        task: JoinHandle<()>,
        settle: Settle,
        handler: Option<DeferredHandler>,
    },
}

impl Entry {
    fn abort(self) -> Option<(Settle, Option<DeferredHandler>)> {
        match self {
            Entry::Timeout(task) | Entry::Interval(task) => {
                task.abort();
                None
            }
            Entry::Deferred {
                task,
                settle,
                handler,
            } => {
                task.abort();
                Some((settle, handler))
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    next_id: TimerId,
    entries: BTreeMap<TimerId, Entry>,
    /// Subscribers of the single idle waiter
    idle: Vec<Settle>,
    unhandled: Option<UnhandledHook>,
}

/// Completion of a promise-style timer or animation
pub struct TimerFuture(oneshot::Receiver<Result<(), ScriptError>>);

impl Future for TimerFuture {
    type Output = Result<(), ScriptError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the entry was cleared without settling
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ScriptError::TimerCancellation)))
    }
}

/// Timers of one invocation
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Rc<RefCell<Inner>>,
    canceled: CancelFlag,
}

impl TimerRegistry {
    pub fn new(canceled: CancelFlag) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::default())),
            canceled,
        }
    }

    /// Route errors thrown by timer callbacks somewhere other than the log
    pub fn set_unhandled_hook(&self, hook: UnhandledHook) {
        self.inner.borrow_mut().unhandled = Some(hook);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.inner.borrow().entries.contains_key(&id)
    }

    fn allocate(&self) -> Result<TimerId, ScriptError> {
        if self.canceled.is_cancelled() {
            return Err(ScriptError::ScriptCanceled);
        }
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        Ok(inner.next_id)
    }

    fn insert(&self, id: TimerId, entry: Entry) {
        self.inner.borrow_mut().entries.insert(id, entry);
    }

    /// Call `callback` once after `delay`
    pub fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> Result<TimerId, ScriptError> {
        let id = self.allocate()?;
        let registry = self.clone();
        let mut callback = callback;
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            // The entry leaves the registry before the callback runs; idle
            // waiters hear about it only once the callback succeeded
            if registry.remove(id).is_none() {
                return;
            }
            match callback() {
                Ok(()) => registry.notify_if_idle(),
                Err(error) => registry.fail(error),
            }
        });
        self.insert(id, Entry::Timeout(task));
        tracing::trace!(id, ?delay, "timeout scheduled");
        Ok(id)
    }

    /// Call `callback` every `period` until cleared
    pub fn set_interval(&self, period: Duration, callback: TimerCallback) -> Result<TimerId, ScriptError> {
        let id = self.allocate()?;
        let registry = self.clone();
        let mut callback = callback;
        let period = period.max(Duration::from_millis(1));
        let task = tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !registry.contains(id) {
                    break;
                }
                if let Err(error) = callback() {
                    registry.remove(id);
                    registry.fail(error);
                    break;
                }
            }
        });
        self.insert(id, Entry::Interval(task));
        tracing::trace!(id, ?period, "interval scheduled");
        Ok(id)
    }

    /// Promise-style timer: completes after `delay`, or with
    /// `TimerCancellation` when cancelled first.
    ///
    /// A failing handler fails only this timer's future.
    pub fn timer(
        &self,
        delay: Duration,
        handler: Option<DeferredHandler>,
    ) -> Result<(TimerId, TimerFuture), ScriptError> {
        let id = self.allocate()?;
        let (settle, done) = oneshot::channel();
        let registry = self.clone();
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(Entry::Deferred { settle, handler, .. }) = registry.take(id) {
                let result = handler.map_or(Ok(()), |h| h(false));
                let _ = settle.send(result);
            }
        });
        self.insert(
            id,
            Entry::Deferred {
                task,
                settle,
                handler,
            },
        );
        Ok((id, TimerFuture(done)))
    }

    /// Run `frame` every `period` until it returns `Stop`, fails, or the
    /// animation is cancelled
    pub fn animate(&self, period: Duration, frame: FrameCallback) -> Result<(TimerId, TimerFuture), ScriptError> {
        let id = self.allocate()?;
        let (settle, done) = oneshot::channel();
        let registry = self.clone();
        let mut frame = frame;
        let period = period.max(Duration::from_millis(1));
        let task = tokio::task::spawn_local(async move {
            let start = Instant::now();
            let mut ticker = tokio::time::interval_at(start + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !registry.contains(id) {
                    break;
                }
                match frame(start.elapsed().as_secs_f64()) {
                    Ok(AnimationStep::Continue) => {}
                    Ok(AnimationStep::Stop) => {
                        registry.settle(id, Ok(()));
                        break;
                    }
                    Err(error) => {
                        if let Some(Entry::Deferred { settle, .. }) = registry.remove(id) {
                            let _ = settle.send(Err(error.clone()));
                        }
                        registry.fail(error);
                        break;
                    }
                }
            }
        });
        self.insert(
            id,
            Entry::Deferred {
                task,
                settle,
                handler: None,
            },
        );
        Ok((id, TimerFuture(done)))
    }

    /// Remove a timer. Unknown ids are ignored.
    pub fn clear(&self, id: TimerId) {
        if let Some(entry) = self.take(id) {
            // Dropping the settle sender fails the future with TimerCancellation
            drop(entry.abort());
        }
    }

    /// Cancel a promise-style timer, calling its handler with `true`
    pub fn cancel_timer(&self, id: TimerId) {
        let Some(entry) = self.take(id) else {
            return;
        };
        if let Some((settle, handler)) = entry.abort() {
            if let Some(handler) = handler {
                if let Err(error) = handler(true) {
                    tracing::warn!(%error, "timer handler failed during cancellation");
                }
            }
            let _ = settle.send(Err(ScriptError::TimerCancellation));
        }
    }

    /// Wait until no timers are pending.
    ///
    /// Unbounded: an interval that is never cleared keeps this pending
    /// until `cancel_all` rejects it.
    pub async fn wait_idle(&self) -> Result<(), ScriptError> {
        loop {
            let signal = {
                let mut inner = self.inner.borrow_mut();
                if inner.entries.is_empty() {
                    return Ok(());
                }
                let (tx, rx) = oneshot::channel();
                inner.idle.push(tx);
                rx
            };
            match signal.await {
                Ok(Err(reason)) => return Err(reason),
                // New timers may have been scheduled since the signal fired
                Ok(Ok(())) | Err(_) => continue,
            }
        }
    }

    /// Drop every pending timer.
    ///
    /// Promise-style timers fail with `TimerCancellation`; an idle waiter
    /// fails with `reason`.
    pub fn cancel_all(&self, reason: ScriptError) {
        let (entries, waiters) = {
            let mut inner = self.inner.borrow_mut();
            (
                std::mem::take(&mut inner.entries),
                std::mem::take(&mut inner.idle),
            )
        };
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), %reason, "cancelling timers");
        }
        for entry in entries.into_values() {
            if let Some((settle, _)) = entry.abort() {
                let _ = settle.send(Err(ScriptError::TimerCancellation));
            }
        }
        for waiter in waiters {
            let _ = waiter.send(Err(reason.clone()));
        }
    }

    fn remove(&self, id: TimerId) -> Option<Entry> {
        self.inner.borrow_mut().entries.remove(&id)
    }

    fn notify_if_idle(&self) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.entries.is_empty() {
                std::mem::take(&mut inner.idle)
            } else {
                Vec::new()
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn take(&self, id: TimerId) -> Option<Entry> {
        let entry = self.remove(id);
        if entry.is_some() {
            self.notify_if_idle();
        }
        entry
    }

    fn settle(&self, id: TimerId, result: Result<(), ScriptError>) {
        if let Some(Entry::Deferred { settle, .. }) = self.take(id) {
            let _ = settle.send(result);
        }
    }

    fn fail(&self, error: ScriptError) {
        let hook = self.inner.borrow().unhandled.clone();
        match hook {
            Some(hook) => hook(&error),
            None => tracing::error!(%error, "unhandled error in timer callback"),
        }
        self.cancel_all(error);
    }
}
