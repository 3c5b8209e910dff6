//! QuickJS runtime and context
//!
//! All calls into script code go through [`JsCore::enter`], which drains
//! the microtask queue before returning. The context cannot be entered
//! while script code is on the stack, so host callbacks that fire
//! synchronously from inside a native (a worker's `onclose` during
//! `terminate()`, a timer handler during `cancel()`) are queued with
//! [`JsCore::call_or_defer`] and run as soon as the engine returns.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use rquickjs::{Coerced, Context, Ctx, Exception, FromJs, Function, Runtime, Value};
use serde_json::Value as Json;

use figpad_engine::{ScriptError, ThrownError};

use crate::bindings::open_envelope;
use crate::ScriptConfig;

/// Global the prelude installs for calls from the host
pub(crate) const DISPATCH: &str = "__figpad_dispatch";

type Deferred = Box<dyn FnOnce(&JsCore)>;

pub(crate) struct JsCore {
    context: Context,
    runtime: Runtime,
    busy: Cell<bool>,
    deferred: RefCell<VecDeque<Deferred>>,
}

impl JsCore {
    pub fn new(config: &ScriptConfig) -> Result<Self, ScriptError> {
        let runtime = Runtime::new().map_err(|e| ScriptError::Init(e.to_string()))?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);
        let context = Context::full(&runtime).map_err(|e| ScriptError::Init(e.to_string()))?;
        Ok(Self {
            context,
            runtime,
            busy: Cell::new(false),
            deferred: RefCell::new(VecDeque::new()),
        })
    }

    /// Whether script code is currently on the stack
    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    /// Run `f` inside the context, then drain pending jobs and queued calls
    pub fn enter<F, R>(&self, f: F) -> Result<R, ScriptError>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        if self.busy.replace(true) {
            return Err(ScriptError::thrown("script engine entered re-entrantly"));
        }
        let result = self.context.with(f);
        self.drain_jobs();
        self.busy.set(false);
        self.run_deferred();
        Ok(result)
    }

    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => tracing::warn!("uncaught exception in promise job"),
            }
        }
    }

    fn run_deferred(&self) {
        loop {
            let next = self.deferred.borrow_mut().pop_front();
            match next {
                Some(job) => job(self),
                None => break,
            }
        }
    }

    /// Call a prelude handler and return its result
    pub fn call(&self, name: &str, args: Json) -> Result<Json, ScriptError> {
        let args = args.to_string();
        let envelope = self.enter(|ctx| -> Result<String, ScriptError> {
            let dispatch: Function = ctx.globals().get(DISPATCH).map_err(|e| caught(&ctx, e))?;
            dispatch
                .call::<_, String>((name, args.as_str()))
                .map_err(|e| caught(&ctx, e))
        })??;
        open_envelope(&envelope)
    }

    /// Like [`call`](Self::call), but queued when script code is running.
    ///
    /// Failures of queued calls are logged; immediate failures are returned.
    pub fn call_or_defer(&self, name: &'static str, args: Json) -> Result<(), ScriptError> {
        if self.is_busy() {
            tracing::trace!(handler = name, "deferring call into script");
            self.deferred
                .borrow_mut()
                .push_back(Box::new(move |core: &JsCore| {
                    if let Err(error) = core.call(name, args) {
                        tracing::warn!(handler = name, %error, "deferred script callback failed");
                    }
                }));
            return Ok(());
        }
        self.call(name, args).map(drop)
    }
}

/// Turn an engine error into a script error, taking the pending exception
pub(crate) fn caught(ctx: &Ctx<'_>, error: rquickjs::Error) -> ScriptError {
    if !matches!(error, rquickjs::Error::Exception) {
        return ScriptError::thrown(error.to_string());
    }
    let value = ctx.catch();
    ScriptError::Thrown(thrown_from_value(ctx, value))
}

fn thrown_from_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> ThrownError {
    let name = value
        .as_object()
        .and_then(|o| o.get::<_, Option<String>>("name").ok().flatten())
        .unwrap_or_else(|| "Error".into());
    if let Ok(obj) = value.clone().try_into_object() {
        if let Some(exception) = Exception::from_object(obj) {
            let mut thrown = ThrownError::new(name, exception.message().unwrap_or_default());
            thrown.stack = exception.stack();
            return thrown;
        }
    }
    match Coerced::<String>::from_js(ctx, value) {
        Ok(text) => ThrownError::new("", text.0),
        Err(err) => ThrownError::new("Error", format!("(failed to stringify exception: {err})")),
    }
}
