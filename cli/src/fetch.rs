//! Network helpers behind `fetch`, `fetchText`, `fetchJson`, `fetchData`
//! and `fetchImg`.
//!
//! Requests are made with a blocking client on the UI side, the way a
//! plugin UI would perform them for the sandbox. Every helper gets the same
//! response record; the script side turns it into what the helper returns.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use ureq::{Agent, RequestBuilder};

use figpad_script_host::HostResponse;

/// Host members served by [`respond`]
pub const FETCH_MEMBERS: &[&str] = &["fetch", "fetchText", "fetchJson", "fetchData", "fetchImg"];

/// Second argument of `fetch(input, init)`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FetchInit {
    method: Option<String>,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
}

/// What came back from the server
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Map<String, Value>,
    pub data: Vec<u8>,
}

impl Fetched {
    /// Response record handed to the script
    pub fn to_json(&self) -> Value {
        json!({
            "url": self.url,
            "status": self.status,
            "statusText": self.status_text,
            "ok": (200..300).contains(&self.status),
            "headers": self.headers,
            "text": String::from_utf8_lossy(&self.data),
            "data": self.data,
        })
    }
}

/// Answer a call to one of [`FETCH_MEMBERS`]
pub fn respond(member: &str, args: &[Value]) -> HostResponse {
    match fetch(args) {
        Ok(fetched) => {
            tracing::debug!(member, url = %fetched.url, status = fetched.status, "fetched");
            HostResponse::Value(fetched.to_json())
        }
        Err(message) => {
            tracing::warn!(member, %message, "fetch failed");
            HostResponse::Error(message)
        }
    }
}

fn fetch(args: &[Value]) -> Result<Fetched, String> {
    let url = match args.first() {
        Some(Value::String(url)) => url.clone(),
        Some(Value::Object(request)) => match request.get("url") {
            Some(Value::String(url)) => url.clone(),
            _ => return Err("fetch: request has no url".to_string()),
        },
        _ => return Err("fetch: expected a url".to_string()),
    };
    let init: FetchInit = match args.get(1) {
        None | Some(Value::Null) => FetchInit::default(),
        Some(init) => serde_json::from_value(init.clone()).map_err(|e| format!("fetch: invalid options: {}", e))?,
    };
    let body = match init.body {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    };

    let config = Agent::config_builder().http_status_as_error(false).build();
    let agent = Agent::new_with_config(config);
    let method = init.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let headers = &init.headers;
    let result = match method.as_str() {
        "GET" => with_headers(agent.get(&url), headers).call(),
        "HEAD" => with_headers(agent.head(&url), headers).call(),
        "DELETE" => with_headers(agent.delete(&url), headers).call(),
        "OPTIONS" => with_headers(agent.options(&url), headers).call(),
        "POST" => with_headers(agent.post(&url), headers).send(body),
        "PUT" => with_headers(agent.put(&url), headers).send(body),
        "PATCH" => with_headers(agent.patch(&url), headers).send(body),
        other => return Err(format!("fetch: unsupported method {}", other)),
    };
    let mut response = result.map_err(|e| format!("fetch {}: {}", url, e))?;

    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), json!(value.to_str().ok()?))))
        .collect();
    let data = response
        .body_mut()
        .read_to_vec()
        .map_err(|e| format!("fetch {}: {}", url, e))?;
    Ok(Fetched {
        url,
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        data,
    })
}

fn with_headers<B>(mut request: RequestBuilder<B>, headers: &BTreeMap<String, String>) -> RequestBuilder<B> {
    for (name, value) in headers {
        request = request.header(name, value);
    }
    request
}
