//! Script environment: capability table, framing and node construction

use std::cell::Cell;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use figpad_engine::clone::PASS_THROUGH_MARKERS;
use figpad_engine::stack::MAIN_FUNCTION;
use figpad_engine::ScriptError;
use figpad_policy::{CapabilityPolicy, PolicyDecision, RESERVED_HOST_MEMBERS};
use figpad_protocol::RequestId;

use crate::{HostApi, HostRequest, HostResponse, ScriptConfig};

/// Parameters every framed script receives ahead of the capabilities
pub const FRAME_PARAMS: &[&str] = &["module", "exports", "Symbol", "__env", "__print", "__reqid"];

/// Capabilities in positional order, excluding node constructors
pub const CAPABILITIES: &[&str] = &[
    "host",
    "scripter",
    "assert",
    "TimerCancellation",
    // timers
    "setTimeout",
    "setInterval",
    "clearTimeout",
    "clearInterval",
    "timer",
    "Timer",
    "animate",
    "withTimeout",
    // workers
    "createWorker",
    "createWindow",
    // colors
    "Color",
    "RGB",
    "RGBA",
    "BLACK",
    "WHITE",
    "GREY",
    "GRAY",
    "RED",
    "GREEN",
    "BLUE",
    "CYAN",
    "MAGENTA",
    "YELLOW",
    "ORANGE",
    // predicates
    "isBooleanOperation",
    "isComponent",
    "isDocument",
    "isEllipse",
    "isFrame",
    "isGroup",
    "isInstance",
    "isLine",
    "isPage",
    "isPolygon",
    "isRectangle",
    "isRect",
    "isSlice",
    "isStar",
    "isText",
    "isVector",
    "isSceneNode",
    "isShape",
    "isContainerNode",
    "isSolidPaint",
    "isGradient",
    "isImage",
    "isPaintStyle",
    "isTextStyle",
    "isEffectStyle",
    "isGridStyle",
    // traversal and utilities
    "range",
    "visit",
    "find",
    "findOne",
    // selection and page
    "selection",
    "setSelection",
    "addToPage",
    // network
    "fetch",
    "fetchText",
    "fetchJson",
    "fetchData",
    "fetchImg",
];

/// Node constructor kinds and the `type` of the nodes they create
pub const NODE_KINDS: &[(&str, &str)] = &[
    ("BooleanOperation", "BOOLEAN_OPERATION"),
    ("Component", "COMPONENT"),
    ("Ellipse", "ELLIPSE"),
    ("Frame", "FRAME"),
    ("Line", "LINE"),
    ("Page", "PAGE"),
    ("Polygon", "POLYGON"),
    ("Rectangle", "RECTANGLE"),
    ("Slice", "SLICE"),
    ("Star", "STAR"),
    ("Text", "TEXT"),
    ("Vector", "VECTOR"),
    ("PaintStyle", "PAINT"),
    ("TextStyle", "TEXT"),
    ("EffectStyle", "EFFECT"),
    ("GridStyle", "GRID"),
    ("Group", "GROUP"),
];

/// Node types that hold children
const CONTAINER_TYPES: &[&str] = &[
    "DOCUMENT",
    "PAGE",
    "BOOLEAN_OPERATION",
    "COMPONENT",
    "FRAME",
    "GROUP",
    "INSTANCE",
];

/// Ordered names passed to a framed script, plus the cached frame text.
///
/// The order is a contract between the frame header and the code that
/// calls the entry function: parameter `i` of the header receives the
/// capability at position `i`.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    names: Vec<String>,
    header: String,
    footer: String,
    line_offset: u32,
}

impl CapabilityTable {
    pub fn new() -> Self {
        let mut names: Vec<String> = CAPABILITIES.iter().map(|s| s.to_string()).collect();
        for (kind, _) in NODE_KINDS {
            names.push(kind.to_string());
            names.push(format!("create{kind}"));
        }

        let params = FRAME_PARAMS
            .iter()
            .copied()
            .chain(names.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",");
        let header = format!(
            "(function(){{var canceled=false, __onend;\n\
             return [function({params}){{\n\
             Object.defineProperty(scripter,\"onend\",{{set:function(f){{__onend=f}},get:function(){{return __onend}},configurable:true}});\n\
             function print(){{__print(__env,__reqid,Array.prototype.slice.call(arguments),new Error().stack)}}\n\
             return (async function {MAIN_FUNCTION}(){{\n"
        );
        let footer = "\n})()\n}, function(){canceled=true}, function(){return __onend}]})()".to_string();
        let line_offset = header.matches('\n').count() as u32;

        Self {
            names,
            header,
            footer,
            line_offset,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn footer(&self) -> &str {
        &self.footer
    }

    /// Lines the header adds in front of the script
    pub fn line_offset(&self) -> u32 {
        self.line_offset
    }

    /// Wrap script text so that it evaluates to `[entry, cancel, onend]`
    pub fn frame(&self, source: &str) -> String {
        let mut framed = String::with_capacity(self.header.len() + source.len() + self.footer.len());
        framed.push_str(&self.header);
        framed.push_str(source);
        framed.push_str(&self.footer);
        framed
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `type` of nodes created by the constructor for `kind`
pub fn node_type(kind: &str) -> Option<&'static str> {
    NODE_KINDS.iter().find(|(k, _)| *k == kind).map(|(_, t)| *t)
}

pub fn is_container_type(node_type: &str) -> bool {
    CONTAINER_TYPES.contains(&node_type)
}

/// Arguments of a node constructor call
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub props: Map<String, Value>,
    pub children: Vec<Value>,
}

/// Builds nodes for the node constructors of one invocation.
///
/// With an attached host the node is created by the embedder; otherwise it
/// stays a plain value with a local id.
pub struct DomBuilder {
    host: HostApi,
    owner: RequestId,
    next_local: Cell<u64>,
}

impl DomBuilder {
    pub fn new(host: HostApi, owner: RequestId) -> Self {
        Self {
            host,
            owner,
            next_local: Cell::new(0),
        }
    }

    pub fn create(&self, kind: &str, spec: NodeSpec) -> Result<Value, ScriptError> {
        let Some(node_type) = node_type(kind) else {
            return Err(ScriptError::Thrown(figpad_engine::ThrownError::new(
                "TypeError",
                format!("unknown node kind {kind:?}"),
            )));
        };
        if node_type == "GROUP" && spec.children.is_empty() {
            return Err(ScriptError::thrown("Group needs at least one child"));
        }

        let mut node = spec.props;
        node.insert("type".into(), json!(node_type));
        if is_container_type(node_type) {
            node.insert("children".into(), Value::Array(spec.children));
        } else if !spec.children.is_empty() {
            return Err(ScriptError::thrown(format!("{kind} cannot have children")));
        }

        if !self.host.is_attached() {
            let n = self.next_local.get() + 1;
            self.next_local.set(n);
            node.insert("id".into(), json!(format!("local:{}.{}", self.owner, n)));
            return Ok(Value::Object(node));
        }

        let node = Value::Object(node);
        match self.host.handle(HostRequest::CreateNode { node: node.clone() }) {
            HostResponse::Value(created) => Ok(created),
            HostResponse::Ok => Ok(node),
            HostResponse::Error(message) => Err(ScriptError::thrown(message)),
        }
    }
}

/// Settings the script-side prelude is initialized with
pub fn prelude_config(
    table: &CapabilityTable,
    policy: &CapabilityPolicy,
    host: &HostApi,
    config: &ScriptConfig,
) -> Value {
    let unavailable: Vec<Value> = table
        .names()
        .iter()
        .filter_map(|name| match policy.check_capability(name) {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny(reason) => Some(json!({"name": name, "message": reason.message})),
        })
        .collect();

    let mut host_members: Vec<Value> = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    for path in host
        .members()
        .iter()
        .map(String::as_str)
        .chain(RESERVED_HOST_MEMBERS.iter().copied())
    {
        if seen.contains(&path) {
            continue;
        }
        seen.push(path);
        host_members.push(match policy.check_host_member(path) {
            PolicyDecision::Allow => json!({"path": path, "allowed": true}),
            PolicyDecision::Deny(reason) => {
                json!({"path": path, "allowed": false, "message": reason.message})
            }
        });
    }

    let node_kinds: Vec<Value> = NODE_KINDS
        .iter()
        .map(|(kind, node_type)| json!({"kind": kind, "type": node_type}))
        .collect();

    json!({
        "names": table.names(),
        "unavailable": unavailable,
        "hostMembers": host_members,
        "markers": PASS_THROUGH_MARKERS,
        "bytesCap": config.print_bytes_cap,
        "budgetMs": config.traversal_budget_ms,
        "visualizePrint": config.visualize_print,
        "nodeKinds": node_kinds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_order_starts_with_core_capabilities() {
        let table = CapabilityTable::new();
        assert_eq!(table.names()[0], "host");
        assert_eq!(table.position("setTimeout"), Some(4));
        assert!(table.position("Frame").unwrap() > table.position("fetchImg").unwrap());
        assert_eq!(
            table.position("createFrame"),
            table.position("Frame").map(|i| i + 1)
        );
        assert!(table.position("print").is_none());
    }

    #[test]
    fn header_lists_params_in_table_order() {
        let table = CapabilityTable::new();
        let params = format!(
            "function({},{}){{",
            FRAME_PARAMS.join(","),
            table.names().join(",")
        );
        assert!(table.header().contains(&params));
        assert!(table.header().contains("async function __script_main"));
    }

    #[test]
    fn line_offset_counts_header_lines() {
        let table = CapabilityTable::new();
        assert_eq!(table.line_offset(), 5);
        let framed = table.frame("return 1 // trailing comment");
        let user_line = framed.lines().nth(table.line_offset() as usize).unwrap();
        assert_eq!(user_line, "return 1 // trailing comment");
        assert!(framed.ends_with("]})()"));
    }

    #[test]
    fn local_nodes_get_ids_and_children() {
        let dom = DomBuilder::new(HostApi::detached(), RequestId::new("r1"));
        let rect = dom
            .create("Rectangle", NodeSpec { props: Map::new(), children: vec![] })
            .unwrap();
        assert_eq!(rect["type"], "RECTANGLE");
        assert_eq!(rect["id"], "local:r1.1");
        assert!(rect.get("children").is_none());

        let spec: NodeSpec =
            serde_json::from_value(json!({"props": {"name": "f"}, "children": [rect]})).unwrap();
        let frame = dom.create("Frame", spec).unwrap();
        assert_eq!(frame["name"], "f");
        assert_eq!(frame["children"][0]["type"], "RECTANGLE");
        assert_eq!(frame["id"], "local:r1.2");
    }

    #[test]
    fn bad_node_requests_fail() {
        let dom = DomBuilder::new(HostApi::detached(), RequestId::new("r1"));
        let err = dom.create("Blob", NodeSpec::default()).unwrap_err();
        assert_eq!(err.name(), "TypeError");
        assert!(dom.create("Group", NodeSpec::default()).is_err());
        let leaf = NodeSpec {
            props: Map::new(),
            children: vec![json!({"type": "LINE"})],
        };
        assert!(dom.create("Line", leaf).is_err());
    }

    #[test]
    fn attached_host_creates_nodes() {
        let host = HostApi::new(Vec::<String>::new(), |req| match req {
            HostRequest::CreateNode { mut node } => {
                node["id"] = json!("1:2");
                HostResponse::Value(node)
            }
            _ => HostResponse::Error("unexpected".into()),
        });
        let dom = DomBuilder::new(host, RequestId::new("r1"));
        let star = dom.create("Star", NodeSpec::default()).unwrap();
        assert_eq!(star, json!({"type": "STAR", "id": "1:2"}));
    }

    #[test]
    fn config_marks_denied_capabilities() {
        let table = CapabilityTable::new();
        let host = HostApi::new(["currentPage", "notify", "ui.show"], |_| HostResponse::Ok);
        let config = prelude_config(
            &table,
            &CapabilityPolicy::default(),
            &host,
            &ScriptConfig::default(),
        );

        let unavailable: Vec<&str> = config["unavailable"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["name"].as_str().unwrap())
            .collect();
        assert_eq!(unavailable, vec!["fetch", "fetchText", "fetchJson", "fetchData", "fetchImg"]);

        let members = config["hostMembers"].as_array().unwrap();
        let show: Vec<&Value> = members.iter().filter(|m| m["path"] == "ui.show").collect();
        assert_eq!(show.len(), 1);
        assert_eq!(show[0]["allowed"], false);
        assert_eq!(show[0]["message"], "ui.show is unavailable in figpad");
        assert!(members
            .iter()
            .any(|m| m["path"] == "notify" && m["allowed"] == true));
        assert_eq!(config["bytesCap"], 50);
    }
}
