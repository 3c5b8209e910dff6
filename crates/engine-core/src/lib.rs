//! figpad Engine Core
//!
//! Engine-agnostic half of the script runtime:
//! - Invocation lifecycle (start, settle, cancel, end hooks)
//! - Per-invocation timers, including promise-style timers and animations
//! - Worker bridge to the UI side
//! - Structured cloning of printed values
//! - Message routing and in-memory transport
//!
//! Everything here is single-threaded and expects to run inside a
//! `tokio::task::LocalSet`.

pub mod clone;
mod error;
mod invocation;
mod router;
pub mod stack;
mod supervisor;
mod timers;
mod transport;
mod worker;

pub use error::*;
pub use invocation::*;
pub use router::*;
pub use supervisor::*;
pub use timers::*;
pub use transport::*;
pub use worker::*;
