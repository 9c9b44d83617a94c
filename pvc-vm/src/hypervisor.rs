//! The hypervisor seam.
//!
//! The state machine only ever talks to these traits; the libvirt backend
//! lives in [`crate::libvirt`] and tests substitute [`crate::mock`].

use anyhow::Error;

/// Node-wide memory figures, in MiB.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Resource figures of one running domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainStats {
    /// Configured maximum memory in MiB.
    pub memory: u64,
    pub vcpus: u32,
}

/// A handle onto one defined-or-running domain.
pub trait DomainHandle: Send {
    fn uuid(&self) -> &str;

    fn is_running(&self) -> Result<bool, Error>;

    /// Request an ACPI shutdown.
    fn shutdown(&self) -> Result<(), Error>;

    /// Hard-stop the domain.
    fn destroy(&self) -> Result<(), Error>;

    fn stats(&self) -> Result<DomainStats, Error>;
}

/// Access to the local hypervisor.
pub trait Hypervisor: Send + Sync {
    fn node_memory(&self) -> Result<NodeMemory, Error>;

    /// UUIDs of all domains currently running on this node.
    fn running_domains(&self) -> Result<Vec<String>, Error>;

    /// Look up a local domain by UUID.
    fn lookup(&self, uuid: &str) -> Result<Option<Box<dyn DomainHandle>>, Error>;

    /// Create (start) a transient domain from its XML definition.
    fn create_from_xml(&self, xml: &str) -> Result<Box<dyn DomainHandle>, Error>;

    /// Live-migrate a running local domain to the peer at `dest_uri`.
    fn migrate_live(&self, uuid: &str, dest_uri: &str) -> Result<(), Error>;
}

/// The libvirt URI peers use to receive live migrations.
pub fn migration_uri(target_node: &str) -> String {
    format!("qemu+tcp://{target_node}/system")
}
