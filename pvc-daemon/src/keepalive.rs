//! The keepalive/health loop.
//!
//! One tick per `keepalive_interval`: publish this node's liveness
//! timestamp and resource counters, evaluate every peer's liveness, and
//! trip the fence or suicide paths when thresholds are crossed. This loop
//! is the only source of liveness truth; store sessions deliberately play
//! no part in it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tracing::{debug, info, warn};

use pvc_common::{DaemonState, RouterState};
use pvc_fencing::IpmiBmc;
use pvc_store::{BaseKey, DomainKey, Key, NodeKey};

use crate::node::{now_secs, NodeInstance};
use crate::sysinfo;

/// Run the keepalive loop until shutdown. Spawned on its own thread.
pub fn keepalive_loop(node: Arc<NodeInstance>) {
    let interval = Duration::from_secs(node.config.file.timer.keepalive_interval.max(1));
    while !node.stop.load(Ordering::Acquire) {
        match node_keepalive(&node) {
            Ok(()) => {
                node.last_keepalive.store(now_secs(), Ordering::Release);
            }
            Err(err) => warn!("keepalive failed: {err:#}"),
        }
        check_suicide(&node);
        std::thread::sleep(interval);
    }
}

/// Run the monitoring loop until shutdown. Spawned on its own thread.
pub fn monitoring_loop(node: Arc<NodeInstance>) {
    let interval = Duration::from_secs(node.config.file.timer.monitoring_interval.max(1));
    while !node.stop.load(Ordering::Acquire) {
        if let Some(monitoring) = node.monitoring() {
            let state = node.router_state();
            if let Err(err) = monitoring.tick(state.as_str()) {
                warn!("monitoring tick failed: {err:#}");
            }
            if state == RouterState::Primary {
                if let Err(err) = monitoring.evaluate_cluster_faults() {
                    warn!("fault evaluation failed: {err:#}");
                }
            }
        }
        std::thread::sleep(interval);
    }
}

/// One keepalive tick.
pub fn node_keepalive(node: &Arc<NodeInstance>) -> Result<(), Error> {
    let handle = &node.handle;
    let name = node.name();

    let daemon_state = handle
        .read(Key::Node(name, NodeKey::DaemonState))?
        .unwrap_or_default();

    // a fenced node must not resurrect itself; only admin action clears it
    if daemon_state == DaemonState::Fenced.as_str() {
        warn!("this node is marked fenced; suspending keepalives");
        return Ok(());
    }

    // re-assert the run state; a previous transient failure must not leave
    // the node looking dead forever
    if daemon_state == DaemonState::Dead.as_str() {
        info!("recovering from dead state after missed keepalives");
        handle.write(&[(
            Key::Node(name, NodeKey::DaemonState),
            DaemonState::Run.as_str().to_owned(),
        )])?;
    }

    // a running primary re-claims a cleared pointer
    if node.config.is_coordinator() && node.router_state() == RouterState::Primary {
        let pointer = handle.read(Key::Base(BaseKey::PrimaryNode))?;
        if pointer.as_deref() == Some("none") {
            let _ = handle.check_and_set(Key::Base(BaseKey::PrimaryNode), Some("none"), name);
        }
    }

    publish_resources(node)?;
    evaluate_peers(node)?;
    Ok(())
}

/// Gather local hypervisor figures and write them with the timestamp.
fn publish_resources(node: &Arc<NodeInstance>) -> Result<(), Error> {
    let handle = &node.handle;
    let name = node.name();

    let memory = node.hypervisor.node_memory()?;
    let load = sysinfo::load_average()?;
    let running_uuids = node.hypervisor.running_domains()?;

    // resync the shared running set with what libvirt actually reports
    for uuid in &running_uuids {
        node.running.add(uuid);
    }
    for uuid in node.running.snapshot() {
        if !running_uuids.contains(&uuid) {
            node.running.remove(&uuid);
        }
    }

    // provisioned counts every VM placed here; allocated only the running
    let mut memory_provisioned: u64 = 0;
    let mut memory_allocated: u64 = 0;
    let mut vcpu_allocated: u64 = 0;
    let mut domains_count: u64 = 0;
    for uuid in handle.children(Key::Base(BaseKey::Domain))? {
        let fields = handle.read_many(&[
            Key::Domain(&uuid, DomainKey::Node),
            Key::Domain(&uuid, DomainKey::Memory),
            Key::Domain(&uuid, DomainKey::Vcpus),
        ])?;
        if fields[0].as_deref() != Some(name) {
            continue;
        }
        domains_count += 1;
        let domain_memory: u64 = fields[1]
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let domain_vcpus: u64 = fields[2]
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        memory_provisioned += domain_memory;
        if running_uuids.contains(&uuid) {
            memory_allocated += domain_memory;
            vcpu_allocated += domain_vcpus;
        }
    }

    let network_stats = sysinfo::network_stats()?;

    handle.write(&[
        (Key::Node(name, NodeKey::MemoryTotal), memory.total.to_string()),
        (Key::Node(name, NodeKey::MemoryUsed), memory.used.to_string()),
        (Key::Node(name, NodeKey::MemoryFree), memory.free.to_string()),
        (
            Key::Node(name, NodeKey::MemoryAllocated),
            memory_allocated.to_string(),
        ),
        (
            Key::Node(name, NodeKey::MemoryProvisioned),
            memory_provisioned.to_string(),
        ),
        (
            Key::Node(name, NodeKey::VcpuAllocated),
            vcpu_allocated.to_string(),
        ),
        (Key::Node(name, NodeKey::CpuLoad), format!("{load:.2}")),
        (
            Key::Node(name, NodeKey::RunningDomains),
            running_uuids.join(" "),
        ),
        (
            Key::Node(name, NodeKey::DomainsCount),
            domains_count.to_string(),
        ),
        (
            Key::Node(name, NodeKey::NetworkStats),
            network_stats.to_string(),
        ),
        (Key::Node(name, NodeKey::Keepalive), now_secs().to_string()),
    ])?;

    if node.config.file.logging.log_keepalives {
        debug!(
            node = name,
            load = %format!("{load:.2}"),
            running = running_uuids.len(),
            "keepalive"
        );
    }
    Ok(())
}

/// Declare and fence peers whose keepalive went stale.
pub fn evaluate_peers(node: &Arc<NodeInstance>) -> Result<(), Error> {
    let handle = &node.handle;
    let deadline = node.fence_params.fence_intervals * node.fence_params.keepalive_interval;
    let now = now_secs();

    for peer in handle.children(Key::Base(BaseKey::Node))? {
        if peer == node.name() {
            continue;
        }
        let fields = handle.read_many(&[
            Key::Node(&peer, NodeKey::Keepalive),
            Key::Node(&peer, NodeKey::DaemonState),
        ])?;
        let keepalive: u64 = fields[0]
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let daemon_state = fields[1].clone().unwrap_or_default();

        if daemon_state != DaemonState::Run.as_str() {
            continue;
        }
        if now.saturating_sub(keepalive) < deadline {
            continue;
        }

        warn!(peer = %peer, "node seems dead, starting fence monitor");
        handle.write(&[(
            Key::Node(&peer, NodeKey::DaemonState),
            DaemonState::Dead.as_str().to_owned(),
        )])?;

        if !node.fencing_enabled.load(Ordering::Acquire) {
            warn!(peer = %peer, "fencing disabled on this node; not spawning fence task");
            continue;
        }
        spawn_fence_task(node, &peer);
    }
    Ok(())
}

fn spawn_fence_task(node: &Arc<NodeInstance>, peer: &str) {
    {
        let mut fencing = node.fencing.lock().unwrap();
        if !fencing.insert(peer.to_owned()) {
            return;
        }
    }
    let task_node = Arc::clone(node);
    let peer = peer.to_owned();
    node.pool.execute(move || {
        let result = pvc_fencing::fence_node(
            &task_node.handle,
            &task_node.fence_params,
            &*task_node.bmc_factory,
            &peer,
        );
        match result {
            Ok(outcome) => info!(peer = %peer, "fence task finished: {outcome:?}"),
            Err(err) => warn!(peer = %peer, "fence task failed: {err:#}"),
        }
        task_node.fencing.lock().unwrap().remove(&peer);
    });
}

/// Power-cycle ourselves if our own keepalive stalled for the configured
/// number of intervals.
fn check_suicide(node: &Arc<NodeInstance>) {
    let intervals = node.fence_params.suicide_intervals;
    if intervals == 0 {
        return;
    }
    let stale = now_secs().saturating_sub(node.last_keepalive.load(Ordering::Acquire));
    if stale <= intervals * node.fence_params.keepalive_interval {
        return;
    }
    let bmc = IpmiBmc::new(
        &node.config.ipmi_hostname,
        &node.config.file.fencing.ipmi.username,
        &node.config.file.fencing.ipmi.password,
    );
    pvc_fencing::suicide(&bmc);
}
