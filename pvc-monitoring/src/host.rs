//! The monitoring instance: plugin scheduling, node health and the
//! cluster-wide fault sweep run by the primary.

use std::path::Path;

use anyhow::Error;
use threadpool::ThreadPool;
use tracing::{debug, info};

use pvc_common::{DaemonState, VmState};
use pvc_store::{BaseKey, DomainKey, Handle, Key, NodeKey, OsdKey, PluginKey};

use crate::faults::generate_fault;
use crate::plugins::{PluginHost, PluginResult};

pub struct MonitoringInstance {
    handle: Handle,
    node_name: String,
    host: PluginHost,
    pool: ThreadPool,
}

impl MonitoringInstance {
    /// Discover and set up plugins, then publish the plugin list.
    pub fn new(
        handle: Handle,
        node_name: &str,
        plugin_directory: &Path,
        pool: ThreadPool,
    ) -> Result<Self, Error> {
        let mut host = PluginHost::discover(plugin_directory)?;
        host.setup();

        handle.write(&[(
            Key::Node(node_name, NodeKey::HealthPlugins),
            host.names().join(" "),
        )])?;
        info!(
            node = node_name,
            plugins = host.names().len(),
            "monitoring instance ready"
        );

        Ok(MonitoringInstance {
            handle,
            node_name: node_name.to_owned(),
            host,
            pool,
        })
    }

    /// One monitoring tick: run the plugins, publish their results, and
    /// recompute this node's health.
    pub fn tick(&self, coordinator_state: &str) -> Result<u64, Error> {
        let results = self.host.run_all(&self.pool, coordinator_state);
        for result in &results {
            self.publish(result)?;
        }

        // health is computed over the stored per-plugin deltas, so a failed
        // plugin run keeps contributing its last-good delta
        let mut delta_sum: u64 = 0;
        for name in self.host.names() {
            let delta = self
                .handle
                .read(Key::Plugin(&self.node_name, &name, PluginKey::HealthDelta))?
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            delta_sum += delta;
        }
        let health = 100u64.saturating_sub(delta_sum);

        self.handle.write(&[(
            Key::Node(&self.node_name, NodeKey::Health),
            health.to_string(),
        )])?;
        debug!(node = %self.node_name, health, "monitoring tick complete");
        Ok(health)
    }

    fn publish(&self, result: &PluginResult) -> Result<(), Error> {
        let node = self.node_name.as_str();
        let plugin = result.plugin_name.as_str();
        self.handle.write(&[
            (
                Key::Plugin(node, plugin, PluginKey::Name),
                result.plugin_name.clone(),
            ),
            (
                Key::Plugin(node, plugin, PluginKey::LastRun),
                result.last_run.to_string(),
            ),
            (
                Key::Plugin(node, plugin, PluginKey::HealthDelta),
                result.health_delta.to_string(),
            ),
            (
                Key::Plugin(node, plugin, PluginKey::Message),
                result.message.clone(),
            ),
            (
                Key::Plugin(node, plugin, PluginKey::Data),
                result.data.to_string(),
            ),
            (
                Key::Plugin(node, plugin, PluginKey::Runtime),
                result.runtime.clone(),
            ),
        ])?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.host.cleanup();
    }

    /// Evaluate the cluster-wide fault predicates. Only the primary runs
    /// this; every predicate reads the shared store.
    pub fn evaluate_cluster_faults(&self) -> Result<(), Error> {
        self.fault_dead_nodes()?;
        self.fault_osds_out()?;
        self.fault_ceph_health()?;
        self.fault_failed_vms()?;
        self.fault_overprovisioned_memory()?;
        Ok(())
    }

    fn fault_dead_nodes(&self) -> Result<(), Error> {
        for node in self.handle.children(Key::Base(BaseKey::Node))? {
            let state = self
                .handle
                .read(Key::Node(&node, NodeKey::DaemonState))?
                .unwrap_or_default();
            if state == DaemonState::Dead.as_str() || state == DaemonState::Fenced.as_str() {
                generate_fault(
                    &self.handle,
                    &format!("DEAD_NODE_{node}"),
                    50,
                    &format!("Node {node} was dead and/or fenced"),
                    None,
                )?;
            }
        }
        Ok(())
    }

    fn fault_osds_out(&self) -> Result<(), Error> {
        for osd in self.handle.children(Key::Base(BaseKey::Osd))? {
            let stats = self
                .handle
                .read(Key::Osd(&osd, OsdKey::Stats))?
                .unwrap_or_default();
            let stats: serde_json::Value = match serde_json::from_str(&stats) {
                Ok(stats) => stats,
                Err(_) => continue,
            };
            if stats.get("in").and_then(|v| v.as_u64()) == Some(0) {
                generate_fault(
                    &self.handle,
                    &format!("CEPH_OSD_OUT_{osd}"),
                    50,
                    &format!("OSD {osd} was marked out"),
                    None,
                )?;
            }
        }
        Ok(())
    }

    fn fault_ceph_health(&self) -> Result<(), Error> {
        let Some(raw) = self.handle.read(Key::Base(BaseKey::StorageHealth))? else {
            return Ok(());
        };
        let health: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(health) => health,
            Err(_) => return Ok(()),
        };
        let Some(checks) = health.get("checks").and_then(|v| v.as_object()) else {
            return Ok(());
        };
        for (check, value) in checks {
            let severity = value.get("severity").and_then(|v| v.as_str()).unwrap_or("");
            let details = value
                .get("summary")
                .and_then(|summary| summary.get("message"))
                .and_then(|v| v.as_str());
            match severity {
                "HEALTH_WARN" => generate_fault(
                    &self.handle,
                    &format!("CEPH_WARN_{check}"),
                    10,
                    &format!("{check} reported by Ceph cluster"),
                    details,
                )?,
                "HEALTH_ERR" => generate_fault(
                    &self.handle,
                    &format!("CEPH_ERR_{check}"),
                    50,
                    &format!("{check} reported by Ceph cluster"),
                    details,
                )?,
                _ => {}
            }
        }
        Ok(())
    }

    fn fault_failed_vms(&self) -> Result<(), Error> {
        for uuid in self.handle.children(Key::Base(BaseKey::Domain))? {
            let state = self
                .handle
                .read(Key::Domain(&uuid, DomainKey::State))?
                .unwrap_or_default();
            if state != VmState::Fail.as_str() {
                continue;
            }
            let name = self
                .handle
                .read(Key::Domain(&uuid, DomainKey::Name))?
                .unwrap_or_else(|| uuid.clone());
            let reason = self
                .handle
                .read(Key::Domain(&uuid, DomainKey::FailedReason))?
                .unwrap_or_default();
            generate_fault(
                &self.handle,
                &format!("VM_FAILED_{name}"),
                10,
                &format!("VM {name} was failed"),
                Some(&reason),
            )?;
        }
        Ok(())
    }

    /// Memory is overprovisioned once the provisioned total no longer fits
    /// into the cluster minus its largest node (the N-1 capacity).
    fn fault_overprovisioned_memory(&self) -> Result<(), Error> {
        let mut provisioned_sum: u64 = 0;
        let mut totals: Vec<u64> = Vec::new();
        for node in self.handle.children(Key::Base(BaseKey::Node))? {
            let fields = self.handle.read_many(&[
                Key::Node(&node, NodeKey::MemoryProvisioned),
                Key::Node(&node, NodeKey::MemoryTotal),
            ])?;
            provisioned_sum += fields[0]
                .as_deref()
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            totals.push(
                fields[1]
                    .as_deref()
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .unwrap_or(0),
            );
        }
        let total: u64 = totals.iter().sum();
        let largest = totals.iter().max().copied().unwrap_or(0);
        let available = total.saturating_sub(largest);

        if !totals.is_empty() && provisioned_sum >= available {
            generate_fault(
                &self.handle,
                "MEMORY_OVERPROVISIONED",
                50,
                "Cluster memory was overprovisioned",
                Some(&format!("{provisioned_sum}MB > {available}MB (N-1)")),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use pvc_store::MemStore;

    fn instance() -> (Handle, MonitoringInstance) {
        let handle = Handle::new(Arc::new(MemStore::new())).unwrap();
        let instance = MonitoringInstance::new(
            handle.clone(),
            "hv1",
            Path::new("/nonexistent/pvc-plugins"),
            ThreadPool::new(2),
        )
        .unwrap();
        (handle, instance)
    }

    fn faults(handle: &Handle) -> Vec<String> {
        crate::faults::list_faults(handle).unwrap()
    }

    #[test]
    fn test_dead_node_fault() {
        let (handle, instance) = instance();
        handle
            .write(&[
                (Key::Node("hv1", NodeKey::DaemonState), "run".to_owned()),
                (Key::Node("hv2", NodeKey::DaemonState), "fenced".to_owned()),
            ])
            .unwrap();
        instance.evaluate_cluster_faults().unwrap();
        assert!(faults(&handle).contains(&"DEAD_NODE_hv2".to_owned()));
        assert!(!faults(&handle).contains(&"DEAD_NODE_hv1".to_owned()));
    }

    #[test]
    fn test_failed_vm_fault_carries_reason() {
        let (handle, instance) = instance();
        handle
            .write(&[
                (Key::Domain("u1", DomainKey::State), "fail".to_owned()),
                (Key::Domain("u1", DomainKey::Name), "web1".to_owned()),
                (
                    Key::Domain("u1", DomainKey::FailedReason),
                    "libvirt create failed".to_owned(),
                ),
            ])
            .unwrap();
        instance.evaluate_cluster_faults().unwrap();
        assert!(faults(&handle).contains(&"VM_FAILED_web1".to_owned()));
        assert_eq!(
            handle
                .read(Key::Fault("VM_FAILED_web1", pvc_store::FaultKey::Details))
                .unwrap()
                .as_deref(),
            Some("libvirt create failed")
        );
    }

    #[test]
    fn test_ceph_health_faults() {
        let (handle, instance) = instance();
        handle
            .write(&[(
                Key::Base(BaseKey::StorageHealth),
                r#"{"checks":{"OSD_NEARFULL":{"severity":"HEALTH_WARN","summary":{"message":"1 nearfull osd"}},"MON_DOWN":{"severity":"HEALTH_ERR","summary":{"message":"1 mon down"}}}}"#
                    .to_owned(),
            )])
            .unwrap();
        instance.evaluate_cluster_faults().unwrap();
        let ids = faults(&handle);
        assert!(ids.contains(&"CEPH_WARN_OSD_NEARFULL".to_owned()));
        assert!(ids.contains(&"CEPH_ERR_MON_DOWN".to_owned()));
    }

    #[test]
    fn test_osd_out_fault() {
        let (handle, instance) = instance();
        handle
            .write(&[(Key::Osd("0", OsdKey::Stats), r#"{"in":0,"up":1}"#.to_owned())])
            .unwrap();
        instance.evaluate_cluster_faults().unwrap();
        assert!(faults(&handle).contains(&"CEPH_OSD_OUT_0".to_owned()));
    }

    #[test]
    fn test_overprovisioned_memory_boundary() {
        let (handle, instance) = instance();
        // two 32G nodes: N-1 capacity is 32768
        for node in ["hv1", "hv2"] {
            handle
                .write(&[
                    (Key::Node(node, NodeKey::MemoryTotal), "32768".to_owned()),
                    (Key::Node(node, NodeKey::MemoryProvisioned), "16000".to_owned()),
                ])
                .unwrap();
        }
        instance.evaluate_cluster_faults().unwrap();
        assert!(!faults(&handle).contains(&"MEMORY_OVERPROVISIONED".to_owned()));

        handle
            .write(&[(Key::Node("hv2", NodeKey::MemoryProvisioned), "16768".to_owned())])
            .unwrap();
        instance.evaluate_cluster_faults().unwrap();
        assert!(faults(&handle).contains(&"MEMORY_OVERPROVISIONED".to_owned()));
    }

    #[test]
    fn test_tick_without_plugins_reports_full_health() {
        let (handle, instance) = instance();
        let health = instance.tick("secondary").unwrap();
        assert_eq!(health, 100);
        assert_eq!(
            handle.read(Key::Node("hv1", NodeKey::Health)).unwrap().as_deref(),
            Some("100")
        );
    }
}
