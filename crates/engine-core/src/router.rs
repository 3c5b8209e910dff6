//! Message router - dispatches UI messages to the worker bridge or the
//! script dispatcher

use std::rc::Rc;

use figpad_protocol::{HostMessage, RequestId};

use crate::{PluginTransport, Supervisor};

/// Runs scripts on behalf of the router
pub trait ScriptDispatcher {
    /// Start `js` under `id`; the outcome is reported back asynchronously
    fn eval(&self, id: RequestId, js: String);
}

/// Routes messages arriving from the UI
pub struct Router {
    supervisor: Supervisor,
    scripts: Option<Rc<dyn ScriptDispatcher>>,
}

impl Router {
    /// Router that only serves worker traffic
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            scripts: None,
        }
    }

    pub fn with_scripts(supervisor: Supervisor, scripts: Rc<dyn ScriptDispatcher>) -> Self {
        Self {
            supervisor,
            scripts: Some(scripts),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Process a single message
    pub fn handle_message(&self, message: HostMessage) {
        match message {
            HostMessage::Eval { id, js } => match &self.scripts {
                Some(scripts) => scripts.eval(id, js),
                None => tracing::warn!(request_id = %id, "eval received but no script host is attached"),
            },
            HostMessage::StopScript { id } => {
                if !self.supervisor.cancel(&id, None) {
                    tracing::debug!(request_id = %id, "stop-script for a script that is not running");
                }
            }
            worker_message => self.supervisor.bridge().dispatch(worker_message),
        }
    }

    /// Process a raw JSON message; unrecognized shapes are logged and dropped
    pub fn handle_json(&self, value: serde_json::Value) {
        match HostMessage::from_json(value) {
            Ok(message) => self.handle_message(message),
            Err(error) => tracing::warn!(%error, "plugin received unexpected message"),
        }
    }

    /// Serve messages until the UI side disconnects
    pub async fn run(&self, transport: &mut PluginTransport) {
        while let Some(message) = transport.recv().await {
            self.handle_message(message);
        }
        tracing::debug!("UI transport closed");
        self.supervisor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EndCallback, InMemoryTransport, ScriptError, ScriptFuture, ScriptProgram, WorkerOptions, WorkerPhase};
    use figpad_protocol::{PluginMessage, WorkerId};
    use serde_json::json;
    use std::cell::RefCell;
    use tokio::task::LocalSet;

    #[derive(Default)]
    struct Captured(RefCell<Vec<(RequestId, String)>>);

    impl ScriptDispatcher for Captured {
        fn eval(&self, id: RequestId, js: String) {
            self.0.borrow_mut().push((id, js));
        }
    }

    struct Forever;

    impl ScriptProgram for Forever {
        fn start(&mut self) -> Result<ScriptFuture, ScriptError> {
            Ok(Box::pin(std::future::pending()))
        }

        fn cancel_inner(&mut self) {}

        fn take_on_end(&mut self) -> Option<EndCallback> {
            None
        }
    }

    #[tokio::test]
    async fn eval_goes_to_dispatcher() {
        let (_ui, plugin) = InMemoryTransport::new();
        let captured = Rc::new(Captured::default());
        let router = Router::with_scripts(Supervisor::new(Rc::new(plugin.outbox())), captured.clone());

        router.handle_json(json!({"type": "eval", "id": "r1", "js": "return 1"}));
        router.handle_json(json!({"type": "nonsense"}));

        assert_eq!(
            *captured.0.borrow(),
            vec![(RequestId::new("r1"), "return 1".to_string())]
        );
    }

    #[tokio::test]
    async fn stop_script_cancels_invocation() {
        LocalSet::new()
            .run_until(async {
                let (_ui, plugin) = InMemoryTransport::new();
                let router = Router::new(Supervisor::new(Rc::new(plugin.outbox())));
                let (_, done) = router
                    .supervisor()
                    .invoke(RequestId::new("r1"), |_| Ok(Box::new(Forever)))
                    .unwrap();

                router.handle_message(HostMessage::StopScript {
                    id: RequestId::new("r1"),
                });
                assert_eq!(done.await, Ok(None));
            })
            .await;
    }

    #[tokio::test]
    async fn worker_messages_reach_bridge() {
        LocalSet::new()
            .run_until(async {
                let (mut ui, plugin) = InMemoryTransport::new();
                let router = Router::new(Supervisor::new(Rc::new(plugin.outbox())));
                let scope = router.supervisor().bridge().scope(RequestId::new("r1"));
                let worker = scope
                    .create_worker("self.postMessage(1)".into(), WorkerOptions::default())
                    .unwrap();

                match ui.recv().await {
                    Some(PluginMessage::WorkerCreateReq { worker_id, .. }) => {
                        assert_eq!(worker_id, worker.id())
                    }
                    other => panic!("unexpected {other:?}"),
                }

                router.handle_json(json!({"type": "worker-create-res", "workerId": worker.id().as_str()}));
                assert_eq!(worker.phase(), WorkerPhase::Active);

                let unknown = WorkerId("nobody.0".into());
                router.handle_json(json!({"type": "worker-message", "workerId": unknown.as_str(), "evtype": "message", "data": 1}));
                assert_eq!(router.supervisor().bridge().len(), 1);
            })
            .await;
    }
}
