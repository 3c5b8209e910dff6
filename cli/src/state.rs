//! Simulated UI state: the document behind `host` and the UI end of the
//! transport

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use serde_json::{json, Map, Value};

use figpad_engine::HostSender;
use figpad_protocol::{HostMessage, PluginMessage, RequestId, ScriptFailure, WorkerId};
use figpad_script_host::{HostApi, HostRequest, HostResponse};

use crate::fetch::{self, FETCH_MEMBERS};
use crate::helpers::format_print;

/// Host members the CLI implements
pub const HOST_MEMBERS: &[&str] = &["currentPage", "root", "notify"];

/// Flat in-memory page that created nodes are appended to
#[derive(Debug, Default)]
pub struct Document {
    children: Vec<Value>,
    next_id: u64,
    notifications: Vec<String>,
    /// Ids of the selected nodes, in selection order
    selection: Vec<String>,
}

impl Document {
    pub fn page(&self) -> Value {
        json!({
            "id": "0:1",
            "type": "PAGE",
            "name": "Page 1",
            "children": self.children,
        })
    }

    pub fn notifications(&self) -> &[String] {
        &self.notifications
    }

    pub fn handle(&mut self, request: HostRequest) -> HostResponse {
        match request {
            HostRequest::Call { member, args } => match member.as_str() {
                "currentPage" => HostResponse::Value(self.page()),
                "root" => HostResponse::Value(json!({
                    "id": "0:0",
                    "type": "DOCUMENT",
                    "children": [self.page()],
                })),
                "notify" => {
                    let text = match args.first() {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    tracing::info!(target: "figpad::notify", "{}", text);
                    self.notifications.push(text);
                    HostResponse::Ok
                }
                "selection" => HostResponse::Value(Value::Array(
                    self.selection.iter().filter_map(|id| find_node(&self.children, id)).collect(),
                )),
                "setSelection" => {
                    let nodes = args.first().and_then(Value::as_array).cloned().unwrap_or_default();
                    self.selection = nodes
                        .iter()
                        .filter_map(|n| n.get("id")?.as_str())
                        .filter(|id| find_node(&self.children, id).is_some())
                        .map(str::to_string)
                        .collect();
                    HostResponse::Ok
                }
                "addToPage" => match args.into_iter().next() {
                    Some(Value::Object(node)) => HostResponse::Value(self.append(node)),
                    _ => HostResponse::Error("addToPage expects a node".to_string()),
                },
                name if FETCH_MEMBERS.contains(&name) => fetch::respond(name, &args),
                other => HostResponse::Error(format!("{} is not implemented by the figpad cli", other)),
            },
            HostRequest::CreateNode { node } => match node {
                Value::Object(node) => HostResponse::Value(self.insert(node)),
                other => HostResponse::Error(format!("cannot create node from {}", other)),
            },
        }
    }

    /// Give the node an id and put it on the page. Children of the new node
    /// leave the top level.
    fn insert(&mut self, mut node: Map<String, Value>) -> Value {
        self.next_id += 1;
        node.insert("id".into(), json!(format!("1:{}", self.next_id)));

        let adopted: HashSet<&str> = node
            .get("children")
            .and_then(Value::as_array)
            .map(|children| children.iter().filter_map(|c| c.get("id")?.as_str()).collect())
            .unwrap_or_default();
        if !adopted.is_empty() {
            self.children
                .retain(|c| !c.get("id").and_then(Value::as_str).is_some_and(|id| adopted.contains(id)));
        }

        let node = Value::Object(node);
        self.children.push(node.clone());
        node
    }

    /// Move `node` to the end of the page, taking it out of wherever it was.
    /// Nodes without an id are inserted as new.
    fn append(&mut self, node: Map<String, Value>) -> Value {
        let Some(id) = node.get("id").and_then(Value::as_str).map(str::to_string) else {
            return self.insert(node);
        };
        detach(&mut self.children, &id);
        let node = Value::Object(node);
        self.children.push(node.clone());
        node
    }
}

fn find_node(nodes: &[Value], id: &str) -> Option<Value> {
    nodes.iter().find_map(|n| {
        if n.get("id").and_then(Value::as_str) == Some(id) {
            return Some(n.clone());
        }
        find_node(n.get("children")?.as_array()?, id)
    })
}

fn detach(nodes: &mut Vec<Value>, id: &str) {
    nodes.retain(|n| n.get("id").and_then(Value::as_str) != Some(id));
    for node in nodes.iter_mut() {
        if let Some(children) = node.get_mut("children").and_then(Value::as_array_mut) {
            detach(children, id);
        }
    }
}

/// `host` object backed by `document`
pub fn host_api(document: Rc<RefCell<Document>>) -> HostApi {
    HostApi::new(HOST_MEMBERS.iter().copied(), move |request| {
        document.borrow_mut().handle(request)
    })
}

/// Settlement of an `eval` request
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub id: RequestId,
    pub result: Option<Value>,
    pub error: Option<ScriptFailure>,
}

/// What the UI did with a plugin message
#[derive(Debug, PartialEq)]
pub enum UiEvent {
    /// Line to show in the output
    Print(String),
    Finished(EvalOutcome),
    Handled,
}

/// UI end of the transport.
///
/// Acknowledges every worker and echoes whatever a worker is sent back to
/// the script, which also answers `request` calls.
pub struct SimulatedUi<S: HostSender> {
    sender: S,
    workers: HashSet<WorkerId>,
}

impl<S: HostSender> SimulatedUi<S> {
    pub fn new(sender: S) -> Self {
        Self {
            sender,
            workers: HashSet::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn send(&self, message: HostMessage) -> Result<(), String> {
        self.sender
            .send(message)
            .map_err(|e| format!("Failed to reach the plugin runtime: {}", e))
    }

    pub fn eval(&self, id: RequestId, js: String) -> Result<(), String> {
        self.send(HostMessage::Eval { id, js })
    }

    pub fn stop(&self, id: RequestId) -> Result<(), String> {
        self.send(HostMessage::StopScript { id })
    }

    pub fn handle(&mut self, message: PluginMessage) -> Result<UiEvent, String> {
        match message {
            PluginMessage::Print(print) => return Ok(UiEvent::Print(format_print(&print))),
            PluginMessage::EvalResponse { id, result, error } => {
                return Ok(UiEvent::Finished(EvalOutcome { id, result, error }));
            }
            PluginMessage::WorkerCreateReq {
                worker_id, iframe, ..
            } => {
                tracing::info!(%worker_id, window = iframe.is_some_and(|f| f.visible), "starting worker");
                self.workers.insert(worker_id.clone());
                self.send(HostMessage::WorkerCreateRes {
                    worker_id,
                    error: None,
                })?;
            }
            PluginMessage::WorkerMessage {
                worker_id, data, ..
            } => {
                if self.workers.contains(&worker_id) {
                    self.send(HostMessage::WorkerMessage {
                        worker_id,
                        evtype: "message".into(),
                        data,
                    })?;
                } else {
                    tracing::debug!(%worker_id, "message for a worker that is gone");
                }
            }
            PluginMessage::WorkerCtrl { signal, worker_id } => {
                tracing::info!(%worker_id, ?signal, "worker stopped");
                self.workers.remove(&worker_id);
            }
            PluginMessage::WorkerSetFrame {
                worker_id,
                x,
                y,
                width,
                height,
            } => {
                tracing::info!(%worker_id, x, y, width, height, "window moved");
            }
        }
        Ok(UiEvent::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figpad_engine::TransportError;

    #[derive(Default, Clone)]
    struct Recorder(Rc<RefCell<Vec<HostMessage>>>);

    impl HostSender for Recorder {
        fn send(&self, message: HostMessage) -> Result<(), TransportError> {
            self.0.borrow_mut().push(message);
            Ok(())
        }
    }

    #[test]
    fn created_nodes_land_on_the_page() {
        let mut doc = Document::default();
        let rect = match doc.handle(HostRequest::CreateNode {
            node: json!({"type": "RECTANGLE"}),
        }) {
            HostResponse::Value(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(rect["id"], "1:1");

        doc.handle(HostRequest::CreateNode {
            node: json!({"type": "FRAME", "children": [rect]}),
        });
        let page = doc.page();
        let children = page["children"].as_array().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["type"], "FRAME");
        assert_eq!(children[0]["children"][0]["id"], "1:1");
    }

    #[test]
    fn notify_is_recorded_and_unknown_members_fail() {
        let mut doc = Document::default();
        let ok = doc.handle(HostRequest::Call {
            member: "notify".into(),
            args: vec![json!("saved")],
        });
        assert_eq!(ok, HostResponse::Ok);
        assert_eq!(doc.notifications(), ["saved".to_string()]);

        let err = doc.handle(HostRequest::Call {
            member: "closePlugin".into(),
            args: vec![],
        });
        assert!(matches!(err, HostResponse::Error(_)));
    }

    fn call(doc: &mut Document, member: &str, args: Vec<Value>) -> HostResponse {
        doc.handle(HostRequest::Call {
            member: member.into(),
            args,
        })
    }

    #[test]
    fn selection_only_keeps_nodes_on_the_page() {
        let mut doc = Document::default();
        let rect = match doc.handle(HostRequest::CreateNode {
            node: json!({"type": "RECTANGLE"}),
        }) {
            HostResponse::Value(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        call(&mut doc, "setSelection", vec![json!([rect, {"id": "9:9", "type": "TEXT"}])]);
        let HostResponse::Value(selected) = call(&mut doc, "selection", vec![]) else {
            panic!("selection should answer with nodes");
        };
        assert_eq!(selected, json!([rect]));
    }

    #[test]
    fn add_to_page_moves_nested_nodes_to_the_top() {
        let mut doc = Document::default();
        let text = match doc.handle(HostRequest::CreateNode {
            node: json!({"type": "TEXT"}),
        }) {
            HostResponse::Value(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        doc.handle(HostRequest::CreateNode {
            node: json!({"type": "FRAME", "children": [text.clone()]}),
        });

        call(&mut doc, "addToPage", vec![text]);
        let page = doc.page();
        let children = page["children"].as_array().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0]["children"], json!([]));
        assert_eq!(children[1]["type"], "TEXT");

        let fresh = call(&mut doc, "addToPage", vec![json!({"type": "STAR"})]);
        assert!(matches!(fresh, HostResponse::Value(v) if v["id"] == "1:3"));
        assert!(matches!(call(&mut doc, "addToPage", vec![]), HostResponse::Error(_)));
    }

    #[test]
    fn fetch_members_are_served() {
        let (url, server) = crate::fetch::tests::serve_once("application/json", r#"{"n":1}"#);
        let response = call(&mut Document::default(), "fetchJson", vec![json!(url)]);
        server.join().unwrap();
        let HostResponse::Value(record) = response else {
            panic!("unexpected {response:?}");
        };
        assert_eq!(record["status"], 200);
        assert_eq!(record["text"], r#"{"n":1}"#);
    }

    #[test]
    fn workers_are_acknowledged_and_echoed() {
        let recorder = Recorder::default();
        let mut ui = SimulatedUi::new(recorder.clone());
        let worker_id = WorkerId("r1.0".into());

        ui.handle(PluginMessage::WorkerCreateReq {
            worker_id: worker_id.clone(),
            js: String::new(),
            iframe: None,
        })
        .unwrap();
        ui.handle(PluginMessage::WorkerMessage {
            evtype: "message".into(),
            worker_id: worker_id.clone(),
            data: json!({"ping": 1}),
        })
        .unwrap();
        assert_eq!(ui.worker_count(), 1);

        let sent = recorder.0.borrow();
        assert!(matches!(&sent[0], HostMessage::WorkerCreateRes { error: None, .. }));
        assert!(matches!(
            &sent[1],
            HostMessage::WorkerMessage { data, .. } if *data == json!({"ping": 1})
        ));
    }

    #[test]
    fn eval_responses_finish() {
        let mut ui = SimulatedUi::new(Recorder::default());
        let event = ui
            .handle(PluginMessage::EvalResponse {
                id: RequestId::new("r1"),
                result: Some(json!(3)),
                error: None,
            })
            .unwrap();
        assert_eq!(
            event,
            UiEvent::Finished(EvalOutcome {
                id: RequestId::new("r1"),
                result: Some(json!(3)),
                error: None,
            })
        );
    }
}
