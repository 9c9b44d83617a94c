//! Per-VM state machine and hypervisor access.
//!
//! Every node instantiates a [`VmInstance`] for every VM UUID it sees in
//! the store; the instance works out from `(state, node)` whether it owns
//! the VM (and drives libvirt) or is a peer (and only cleans up leftovers).
//! RBD snapshot and lock handling for VM volumes lives in [`storage`].

mod hypervisor;
mod instance;
mod libvirt;
pub mod mock;
pub mod storage;

pub use hypervisor::{migration_uri, DomainHandle, DomainStats, Hypervisor, NodeMemory};
pub use instance::{define_vm, request_migration, RunningDomains, VmInstance};
pub use libvirt::LibvirtHypervisor;
