//! figpad Protocol
//!
//! Messages exchanged between the plugin-side script runtime and the UI.
//! This crate is the source of truth for the wire shapes.

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;
