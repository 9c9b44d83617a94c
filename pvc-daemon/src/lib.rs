//! Node daemon internals.
//!
//! The binary lives in `main.rs`; everything else is a library so the
//! end-to-end cluster scenarios can drive daemons against the in-memory
//! store engine.

pub mod keepalive;
pub mod node;
pub mod state;
pub mod sysinfo;

pub use node::{Event, NodeInstance};
