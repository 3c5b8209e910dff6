//! Command-line arguments and settings

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use figpad_policy::CapabilityPolicy;
use figpad_script_host::ScriptConfig;

use crate::helpers::error_io;

/// Run a figpad script against a simulated UI
#[derive(Debug, Parser)]
#[command(name = "figpad", version, about)]
pub struct Args {
    /// Script file to run; `-` reads standard input
    pub script: PathBuf,

    /// JSON settings file with `script` and `policy` sections
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Expose fetch, fetchText, fetchJson, fetchData and fetchImg
    #[arg(long)]
    pub allow_network: bool,

    /// Stub out a capability or host member (repeatable)
    #[arg(long = "deny", value_name = "NAME")]
    pub deny: Vec<String>,

    /// Stop the script after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Only log printed values instead of showing them
    #[arg(long)]
    pub quiet_print: bool,
}

/// Settings file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub script: ScriptConfig,
    pub policy: CapabilityPolicy,
}

impl Settings {
    /// Read settings from `path`, or use the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| error_io(path, &e))?;
        serde_json::from_str(&text).map_err(|e| format!("Invalid settings in {}: {}", path.display(), e))
    }

    /// Apply command-line overrides
    pub fn with_args(mut self, args: &Args) -> Self {
        if args.allow_network {
            self.policy.set_allow_network(true);
        }
        for name in &args.deny {
            self.policy.deny(name.clone());
        }
        if args.quiet_print {
            self.script.visualize_print = false;
        }
        self
    }
}
