//! Shared plumbing for the PVC node daemon.
//!
//! Everything in here is used by at least two subsystem crates: external
//! command execution (one-shot and supervised children), CIDR math for the
//! underlay and managed networks, and the cluster-wide state string enums.

mod cidr;
pub mod command;
mod state;

pub use cidr::{CidrError, Ipv4Cidr};
pub use state::{DaemonState, DomainState, RouterState, VmState};
