//! The per-VM state machine.
//!
//! One instance exists per VM UUID on every node that sees the UUID in the
//! store, whether or not it owns the VM. Each watch fire re-reads
//! `(state, node)` and acts from this node's viewpoint: the owner drives
//! libvirt, everyone else only cleans up leftovers.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;
use tracing::{debug, info, warn};

use pvc_common::VmState;
use pvc_store::{DomainKey, Handle, Key};

use crate::hypervisor::{migration_uri, DomainHandle, Hypervisor};

/// The set of domains this node currently considers running locally.
///
/// Shared between all VM instances and the keepalive loop, which publishes
/// it under `node.running_domains`.
#[derive(Clone, Default)]
pub struct RunningDomains {
    inner: Arc<Mutex<BTreeSet<String>>>,
}

impl RunningDomains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, uuid: &str) {
        self.inner.lock().unwrap().insert(uuid.to_owned());
    }

    pub fn remove(&self, uuid: &str) {
        self.inner.lock().unwrap().remove(uuid);
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.inner.lock().unwrap().contains(uuid)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    /// Space-joined form as stored under `node.running_domains`.
    pub fn joined(&self) -> String {
        self.snapshot().join(" ")
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

pub struct VmInstance {
    uuid: String,
    node_name: String,
    handle: Handle,
    hypervisor: Arc<dyn Hypervisor>,
    running: RunningDomains,
    /// Seconds before a graceful shutdown escalates to destroy.
    shutdown_timeout: u64,
    /// Serializes all transitions for this VM on this node.
    transition: Mutex<()>,
}

impl VmInstance {
    pub fn new(
        handle: Handle,
        hypervisor: Arc<dyn Hypervisor>,
        running: RunningDomains,
        node_name: &str,
        uuid: &str,
        shutdown_timeout: u64,
    ) -> Arc<Self> {
        Arc::new(VmInstance {
            uuid: uuid.to_owned(),
            node_name: node_name.to_owned(),
            handle,
            hypervisor,
            running,
            shutdown_timeout,
            transition: Mutex::new(()),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// React to the current `(state, node)` pair. Invoked from the worker
    /// pool on every state watch fire and once at instantiation.
    pub fn manage_state(&self) {
        let _guard = self.transition.lock().unwrap();
        if let Err(err) = self.manage_state_inner() {
            warn!(uuid = %self.uuid, "state management failed: {err:#}");
        }
    }

    fn manage_state_inner(&self) -> Result<(), Error> {
        let state = self.handle.read(Key::Domain(&self.uuid, DomainKey::State))?;
        let node = self.handle.read(Key::Domain(&self.uuid, DomainKey::Node))?;
        let (state, node) = match (state, node) {
            (Some(state), Some(node)) => (state, node),
            // the subtree is gone; clean up whatever is left locally
            _ => {
                self.terminate_leftover();
                return Ok(());
            }
        };
        let state: VmState = match state.parse() {
            Ok(state) => state,
            Err(err) => {
                warn!(uuid = %self.uuid, "{err}");
                return Ok(());
            }
        };

        let dom = self.hypervisor.lookup(&self.uuid)?;
        let running = match &dom {
            Some(dom) => dom.is_running().unwrap_or(false),
            None => false,
        };

        debug!(
            uuid = %self.uuid,
            state = state.as_str(),
            node = %node,
            running,
            "VM state change"
        );

        if node == self.node_name {
            self.manage_as_owner(state, dom, running)
        } else {
            self.manage_as_peer(state, &node, dom, running)
        }
    }

    fn manage_as_owner(
        &self,
        state: VmState,
        dom: Option<Box<dyn DomainHandle>>,
        running: bool,
    ) -> Result<(), Error> {
        if running {
            let Some(dom) = dom else { return Ok(()) };
            match state {
                VmState::Start | VmState::Mirror => self.running.add(&self.uuid),
                // stuck migrate pointing at ourselves; self-heal
                VmState::Migrate => {
                    self.write_state(VmState::Start)?;
                    self.running.add(&self.uuid);
                }
                VmState::Restart => self.restart_vm(&*dom)?,
                VmState::Shutdown => self.shutdown_vm(&*dom, true)?,
                VmState::Stop => self.stop_vm(&*dom, true)?,
                // disable keeps its state; the VM just must not run
                VmState::Disable => self.shutdown_vm(&*dom, false)?,
                VmState::Unmigrate => self.unmigrate_vm(true)?,
                VmState::Delete => self.delete_vm(Some(dom))?,
                VmState::Fail
                | VmState::Provision
                | VmState::Import
                | VmState::Restore => {}
            }
        } else {
            match state {
                VmState::Start | VmState::Mirror => {
                    self.start_vm()?;
                }
                VmState::Migrate => self.receive_migrate()?,
                // not running, so a restart is just a start
                VmState::Restart => self.write_state(VmState::Start)?,
                VmState::Shutdown | VmState::Stop | VmState::Disable | VmState::Fail => {
                    self.running.remove(&self.uuid)
                }
                VmState::Unmigrate => self.unmigrate_vm(false)?,
                VmState::Delete => self.delete_vm(dom)?,
                VmState::Provision | VmState::Import | VmState::Restore => {}
            }
        }
        Ok(())
    }

    fn manage_as_peer(
        &self,
        state: VmState,
        target_node: &str,
        dom: Option<Box<dyn DomainHandle>>,
        running: bool,
    ) -> Result<(), Error> {
        if running {
            let Some(dom) = dom else { return Ok(()) };
            if state == VmState::Migrate {
                self.migrate_out(&*dom, target_node)?;
            } else {
                // split start: the store says another node owns this VM
                info!(
                    uuid = %self.uuid,
                    owner = %target_node,
                    "terminating domain owned elsewhere"
                );
                self.terminate_vm(&*dom);
            }
        } else {
            self.running.remove(&self.uuid);
        }
        Ok(())
    }

    fn write_state(&self, state: VmState) -> Result<(), Error> {
        self.handle.write(&[(
            Key::Domain(&self.uuid, DomainKey::State),
            state.as_str().to_owned(),
        )])?;
        Ok(())
    }

    fn mark_failed(&self, reason: &str) -> Result<(), Error> {
        self.handle.write(&[
            (
                Key::Domain(&self.uuid, DomainKey::State),
                VmState::Fail.as_str().to_owned(),
            ),
            (
                Key::Domain(&self.uuid, DomainKey::FailedReason),
                reason.to_owned(),
            ),
        ])?;
        Ok(())
    }

    /// Create the domain from its stored XML. Returns whether it started.
    fn start_vm(&self) -> Result<bool, Error> {
        let xml = match self.handle.read(Key::Domain(&self.uuid, DomainKey::Xml))? {
            Some(xml) if !xml.is_empty() => xml,
            _ => {
                self.mark_failed("no XML definition in store")?;
                return Ok(false);
            }
        };

        info!(uuid = %self.uuid, "starting VM");
        match self.hypervisor.create_from_xml(&xml) {
            Ok(_dom) => {
                self.running.add(&self.uuid);
                info!(uuid = %self.uuid, "successfully started VM");
                Ok(true)
            }
            Err(err) => {
                warn!(uuid = %self.uuid, "failed to create VM: {err:#}");
                self.mark_failed(&format!("libvirt create failed: {err:#}"))?;
                Ok(false)
            }
        }
    }

    /// ACPI shutdown with escalation to destroy after the timeout.
    fn shutdown_vm(&self, dom: &dyn DomainHandle, write_stop: bool) -> Result<(), Error> {
        info!(uuid = %self.uuid, "gracefully stopping VM");
        dom.shutdown()?;

        let ticks = self.shutdown_timeout.max(1) * 2;
        let mut stopped = false;
        for _ in 0..ticks {
            if !dom.is_running().unwrap_or(false) {
                stopped = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(500));
        }

        if !stopped {
            warn!(uuid = %self.uuid, "shutdown timeout expired, destroying VM");
            return self.stop_vm(dom, write_stop);
        }

        self.running.remove(&self.uuid);
        if write_stop {
            self.write_state(VmState::Stop)?;
        }
        info!(uuid = %self.uuid, "successfully shut down VM");
        Ok(())
    }

    /// Immediate destroy.
    fn stop_vm(&self, dom: &dyn DomainHandle, write_stop: bool) -> Result<(), Error> {
        info!(uuid = %self.uuid, "forcibly stopping VM");
        if let Err(err) = dom.destroy() {
            warn!(uuid = %self.uuid, "failed to destroy VM: {err:#}");
        }
        self.running.remove(&self.uuid);
        if write_stop {
            self.write_state(VmState::Stop)?;
        }
        Ok(())
    }

    /// Destroy without touching the stored state.
    fn terminate_vm(&self, dom: &dyn DomainHandle) {
        if let Err(err) = dom.destroy() {
            warn!(uuid = %self.uuid, "failed to terminate VM: {err:#}");
        }
        self.running.remove(&self.uuid);
    }

    fn restart_vm(&self, dom: &dyn DomainHandle) -> Result<(), Error> {
        info!(uuid = %self.uuid, "restarting VM");
        self.shutdown_vm(dom, false)?;
        if self.start_vm()? {
            self.write_state(VmState::Start)?;
        }
        Ok(())
    }

    /// Owner side of the live-migrate protocol; falls back to a cold
    /// migration (shutdown here, fresh start on the target) on failure.
    fn migrate_out(&self, dom: &dyn DomainHandle, target_node: &str) -> Result<(), Error> {
        let uri = migration_uri(target_node);
        info!(uuid = %self.uuid, target = %target_node, "live-migrating VM");
        match self.hypervisor.migrate_live(&self.uuid, &uri) {
            Ok(()) => {
                self.running.remove(&self.uuid);
                info!(uuid = %self.uuid, "successfully migrated VM");
            }
            Err(err) => {
                warn!(
                    uuid = %self.uuid,
                    "live migration failed, shutting down for cold migration: {err:#}"
                );
                self.shutdown_vm(dom, false)?;
                self.write_state(VmState::Start)?;
            }
        }
        Ok(())
    }

    /// Target side: wait for the inbound domain to appear running, then
    /// acknowledge by writing `start`.
    fn receive_migrate(&self) -> Result<(), Error> {
        info!(uuid = %self.uuid, "receiving migration");
        loop {
            std::thread::sleep(Duration::from_millis(500));

            let state = self
                .handle
                .read(Key::Domain(&self.uuid, DomainKey::State))?
                .unwrap_or_default();
            if state != VmState::Migrate.as_str() {
                break;
            }
            if let Some(dom) = self.hypervisor.lookup(&self.uuid)? {
                if dom.is_running().unwrap_or(false) {
                    break;
                }
            }
        }

        let running = match self.hypervisor.lookup(&self.uuid)? {
            Some(dom) => dom.is_running().unwrap_or(false),
            None => false,
        };
        if running {
            self.running.add(&self.uuid);
            info!(uuid = %self.uuid, "successfully received migrated VM");
            self.write_state(VmState::Start)?;
        } else {
            let state = self
                .handle
                .read(Key::Domain(&self.uuid, DomainKey::State))?
                .unwrap_or_default();
            if state == VmState::Migrate.as_str() {
                // cold-migrate fallback: request a fresh start here
                warn!(uuid = %self.uuid, "did not receive running VM, starting cold");
                self.write_state(VmState::Start)?;
            }
        }
        Ok(())
    }

    /// Send the VM back to wherever it was migrated from.
    fn unmigrate_vm(&self, running: bool) -> Result<(), Error> {
        let last_node = self
            .handle
            .read(Key::Domain(&self.uuid, DomainKey::LastNode))?
            .unwrap_or_default();
        if last_node.is_empty() {
            self.write_state(VmState::Start)?;
            return Ok(());
        }
        info!(uuid = %self.uuid, target = %last_node, "returning VM to previous node");
        let next_state = if running {
            VmState::Migrate
        } else {
            VmState::Start
        };
        self.handle.write(&[
            (
                Key::Domain(&self.uuid, DomainKey::State),
                next_state.as_str().to_owned(),
            ),
            (Key::Domain(&self.uuid, DomainKey::Node), last_node),
            (Key::Domain(&self.uuid, DomainKey::LastNode), String::new()),
        ])?;
        Ok(())
    }

    /// Destroy any local domain, then remove the whole subtree.
    fn delete_vm(&self, dom: Option<Box<dyn DomainHandle>>) -> Result<(), Error> {
        info!(uuid = %self.uuid, "deleting VM");
        if let Some(dom) = dom {
            if dom.is_running().unwrap_or(false) {
                let _ = dom.destroy();
            }
        }
        self.running.remove(&self.uuid);
        self.handle
            .delete(Key::Domain(&self.uuid, DomainKey::Root), true)?;
        Ok(())
    }

    /// Kill any local libvirt leftover for a VM this node does not own.
    fn terminate_leftover(&self) {
        if let Ok(Some(dom)) = self.hypervisor.lookup(&self.uuid) {
            if dom.is_running().unwrap_or(false) {
                info!(uuid = %self.uuid, "terminating leftover domain");
                let _ = dom.destroy();
            }
        }
        self.running.remove(&self.uuid);
    }
}

/// Create the store subtree for a new VM with initial state `stop`.
///
/// When `target_node` is not given, the scheduler picks one; with no
/// eligible node the definition fails.
pub fn define_vm(
    handle: &Handle,
    default_selector: &str,
    uuid: &str,
    name: &str,
    xml: &str,
    target_node: Option<&str>,
) -> Result<(), Error> {
    if handle.exists(Key::Domain(uuid, DomainKey::Root))? {
        anyhow::bail!("VM {uuid} is already defined");
    }

    let node = match target_node {
        Some(node) => node.to_owned(),
        None => pvc_scheduler::find_target(handle, default_selector, uuid)?
            .ok_or_else(|| anyhow::format_err!("no eligible node for new VM {uuid}"))?,
    };

    let (memory, vcpus) = parse_resources_from_xml(xml);

    handle.write(&[
        (Key::Domain(uuid, DomainKey::Name), name.to_owned()),
        (
            Key::Domain(uuid, DomainKey::State),
            VmState::Stop.as_str().to_owned(),
        ),
        (Key::Domain(uuid, DomainKey::Memory), memory.to_string()),
        (Key::Domain(uuid, DomainKey::Vcpus), vcpus.to_string()),
        (Key::Domain(uuid, DomainKey::Node), node),
        (Key::Domain(uuid, DomainKey::LastNode), String::new()),
        (Key::Domain(uuid, DomainKey::FailedReason), String::new()),
        (Key::Domain(uuid, DomainKey::Xml), xml.to_owned()),
        (Key::Domain(uuid, DomainKey::MetaAutostart), "False".to_owned()),
        (Key::Domain(uuid, DomainKey::MetaNodeLimit), String::new()),
        (
            Key::Domain(uuid, DomainKey::MetaNodeSelector),
            default_selector.to_owned(),
        ),
        (
            Key::Domain(uuid, DomainKey::MetaMigrationMethod),
            "live".to_owned(),
        ),
        (Key::Domain(uuid, DomainKey::StorageVolumes), String::new()),
    ])?;
    Ok(())
}

/// Extract `(memory MiB, vcpus)` from a libvirt domain definition.
///
/// Good enough for the `<memory unit='KiB'>` and `<vcpu>` forms libvirt
/// itself emits; anything unparsable counts as zero.
fn parse_resources_from_xml(xml: &str) -> (u64, u32) {
    fn tag_value(xml: &str, tag: &str) -> Option<(String, u64)> {
        let open = xml.find(&format!("<{tag}"))?;
        let rest = &xml[open..];
        let start = rest.find('>')? + 1;
        let end = rest.find(&format!("</{tag}>"))?;
        let attrs = rest[..start].to_owned();
        let value = rest[start..end].trim().parse().ok()?;
        Some((attrs, value))
    }

    let memory = match tag_value(xml, "memory") {
        Some((attrs, value)) if attrs.contains("unit='KiB'") || attrs.contains("unit=\"KiB\"") => {
            value / 1024
        }
        Some((attrs, value)) if attrs.contains("unit='MiB'") || attrs.contains("unit=\"MiB\"") => {
            value
        }
        // libvirt defaults to KiB when no unit is given
        Some((_, value)) => value / 1024,
        None => 0,
    };
    let vcpus = tag_value(xml, "vcpu")
        .map(|(_, value)| value as u32)
        .unwrap_or(0);
    (memory, vcpus)
}

/// Request a migration of `uuid` to `target_node` by rewriting the store
/// triple; the owning and receiving daemons react via their watches.
pub fn request_migration(handle: &Handle, uuid: &str, target_node: &str) -> Result<(), Error> {
    let current = handle
        .read(Key::Domain(uuid, DomainKey::Node))?
        .unwrap_or_default();
    if current == target_node {
        anyhow::bail!("VM {uuid} is already on {target_node}");
    }
    handle.write(&[
        (
            Key::Domain(uuid, DomainKey::State),
            VmState::Migrate.as_str().to_owned(),
        ),
        (Key::Domain(uuid, DomainKey::Node), target_node.to_owned()),
        (Key::Domain(uuid, DomainKey::LastNode), current),
    ])?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_resources_from_xml() {
        let xml = "<domain type='kvm'>\
            <memory unit='KiB'>4194304</memory>\
            <vcpu placement='static'>4</vcpu>\
            </domain>";
        assert_eq!(parse_resources_from_xml(xml), (4096, 4));
        assert_eq!(parse_resources_from_xml("<domain/>"), (0, 0));
    }

    #[test]
    fn test_running_domains_set() {
        let running = RunningDomains::new();
        running.add("u1");
        running.add("u2");
        running.add("u1");
        assert_eq!(running.len(), 2);
        assert_eq!(running.joined(), "u1 u2");
        running.remove("u1");
        assert!(!running.contains("u1"));
    }
}
