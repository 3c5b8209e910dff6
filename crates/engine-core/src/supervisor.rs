//! Root runtime state shared by all invocations

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use figpad_protocol::{PluginMessage, RequestId};

use crate::{
    Completion, Invocation, InvocationScope, PluginSender, ScriptError, ScriptProgram,
    TransportError, WorkerBridge,
};

/// Owns the worker bridge and tracks running invocations by request id
#[derive(Clone)]
pub struct Supervisor {
    bridge: WorkerBridge,
    outbox: Rc<dyn PluginSender>,
    running: Rc<RefCell<HashMap<RequestId, Invocation>>>,
}

impl Supervisor {
    pub fn new(outbox: Rc<dyn PluginSender>) -> Self {
        Self {
            bridge: WorkerBridge::new(outbox.clone()),
            outbox,
            running: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn bridge(&self) -> &WorkerBridge {
        &self.bridge
    }

    pub fn send(&self, message: PluginMessage) -> Result<(), TransportError> {
        self.outbox.send(message)
    }

    pub fn outbox(&self) -> Rc<dyn PluginSender> {
        self.outbox.clone()
    }

    /// Start a script under `request_id`.
    ///
    /// The invocation is tracked until its end hook runs. Fails when a
    /// script with the same id is still running.
    pub fn invoke<B>(&self, request_id: RequestId, build: B) -> Result<(Invocation, Completion), ScriptError>
    where
        B: FnOnce(&InvocationScope) -> Result<Box<dyn ScriptProgram>, ScriptError>,
    {
        if self.running.borrow().contains_key(&request_id) {
            return Err(ScriptError::thrown(format!("request {request_id} is already running")));
        }

        let scope = InvocationScope::new(request_id.clone(), self.bridge.scope(request_id.clone()));
        let running = self.running.clone();
        let id = request_id.clone();
        scope.end_listeners.add(Box::new(move || {
            running.borrow_mut().remove(&id);
            Ok(())
        }));

        let (invocation, completion) = Invocation::start(scope, build);
        // Already settled means the end listener has run.
        if !invocation.is_settled() {
            self.running.borrow_mut().insert(request_id, invocation.clone());
        }
        Ok((invocation, completion))
    }

    pub fn get(&self, request_id: &RequestId) -> Option<Invocation> {
        self.running.borrow().get(request_id).cloned()
    }

    /// Cancel one running script; false when nothing runs under that id
    pub fn cancel(&self, request_id: &RequestId, reason: Option<ScriptError>) -> bool {
        let invocation = self.get(request_id);
        match invocation {
            Some(invocation) => {
                invocation.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> Vec<RequestId> {
        self.running.borrow().keys().cloned().collect()
    }

    /// Cancel every running script and close every worker
    pub fn shutdown(&self) {
        let invocations: Vec<Invocation> = self.running.borrow().values().cloned().collect();
        if !invocations.is_empty() {
            tracing::info!(count = invocations.len(), "stopping running scripts");
        }
        for invocation in invocations {
            invocation.cancel(Some(ScriptError::ScriptStopped));
        }
        self.bridge.terminate_all(&ScriptError::ScriptStopped);
    }
}
