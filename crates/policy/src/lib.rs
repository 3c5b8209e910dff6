//! figpad Policy Engine
//!
//! Decides which parts of the host capability surface a script sees.
//!
//! Default posture: the plugin UI belongs to the runtime, so the host's UI
//! members are never exposed; network helpers are off unless the policy is
//! permissive. Denied capabilities are still present in the environment as
//! stubs that fail with an "unavailable" error naming the capability.

use serde::{Deserialize, Serialize};

/// Host members that are never exposed to scripts
pub const RESERVED_HOST_MEMBERS: &[&str] = &[
    "showUI",
    "ui.show",
    "ui.hide",
    "ui.resize",
    "ui.close",
    "ui.postMessage",
];

/// Capabilities that reach the network
pub const NETWORK_CAPABILITIES: &[&str] = &["fetch", "fetchText", "fetchJson", "fetchData", "fetchImg"];

/// Product name used in "unavailable" messages
const PRODUCT: &str = "figpad";

/// Why a capability or script was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDenialReason {
    pub code: String,
    pub message: String,
    /// Actionable suggestion for the user
    pub suggestion: Option<String>,
}

/// Policy decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(PolicyDenialReason),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Message of the error raised when a script touches a denied capability
#[must_use]
pub fn unavailable_message(name: &str) -> String {
    format!("{name} is unavailable in {PRODUCT}")
}

/// Capability policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPolicy {
    /// Extra capability names or host members to stub out
    deny: Vec<String>,
    /// Expose the fetch helpers
    allow_network: bool,
    /// Reject scripts longer than this many bytes (0 = unlimited)
    max_script_length: usize,
}

impl CapabilityPolicy {
    pub fn new() -> Self {
        Self {
            deny: Vec::new(),
            // Scripts run with host privileges; keep the network opt-in
            allow_network: false,
            max_script_length: 1024 * 1024,
        }
    }

    /// Policy with network helpers enabled
    pub fn permissive() -> Self {
        Self {
            allow_network: true,
            ..Self::new()
        }
    }

    pub fn set_allow_network(&mut self, allow: bool) {
        self.allow_network = allow;
    }

    pub fn allows_network(&self) -> bool {
        self.allow_network
    }

    /// Check whether a top-level capability is exposed
    pub fn check_capability(&self, name: &str) -> PolicyDecision {
        if NETWORK_CAPABILITIES.contains(&name) && !self.allow_network {
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "network_disabled".into(),
                message: unavailable_message(name),
                suggestion: Some("Enable network access in the policy settings".into()),
            });
        }
        self.check_denied(name)
    }

    /// Check whether a member of the host API object is exposed.
    ///
    /// `path` is dotted, relative to the host object (`"ui.show"`).
    pub fn check_host_member(&self, path: &str) -> PolicyDecision {
        if RESERVED_HOST_MEMBERS.contains(&path) {
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "reserved".into(),
                message: unavailable_message(path),
                suggestion: None,
            });
        }
        self.check_denied(path)
    }

    fn check_denied(&self, name: &str) -> PolicyDecision {
        if self.deny.iter().any(|d| d == name) {
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "denied".into(),
                message: unavailable_message(name),
                suggestion: Some("Remove it from the deny list in settings".into()),
            });
        }
        PolicyDecision::Allow
    }

    /// Check if running a script is allowed
    pub fn check_script(&self, source: &str) -> PolicyDecision {
        if self.max_script_length > 0 && source.len() > self.max_script_length {
            return PolicyDecision::Deny(PolicyDenialReason {
                code: "script_too_large".into(),
                message: format!(
                    "Script is {} bytes, the limit is {}",
                    source.len(),
                    self.max_script_length
                ),
                suggestion: Some("Split the script or raise max_script_length".into()),
            });
        }
        PolicyDecision::Allow
    }

    /// Stub out an additional capability or host member
    pub fn deny(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.deny.contains(&name) {
            self.deny.push(name);
        }
    }

    /// Undo a previous `deny`
    pub fn allow(&mut self, name: &str) {
        self.deny.retain(|n| n != name);
    }
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::new()
    }
}
