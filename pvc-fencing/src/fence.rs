//! The fence protocol.

use std::time::Duration;

use anyhow::{Context, Error};
use tracing::{info, warn};

use pvc_common::{DaemonState, DomainState, RouterState, VmState};
use pvc_config::{Config, FenceAction};
use pvc_monitoring::faults::generate_fault;
use pvc_store::{BaseKey, DomainKey, Handle, Key, NodeKey};

use crate::bmc::{Bmc, BmcFactory, PowerOp};

/// How many times a presumed-dead node may prove itself alive.
const SAVING_THROWS: u64 = 6;

/// Settle time after `chassis power off`.
const POWER_OFF_SETTLE: Duration = Duration::from_secs(5);

/// Settle time after `chassis power on`.
const POWER_ON_SETTLE: Duration = Duration::from_secs(2);

const STATUS_ON: &str = "Chassis Power is on";
const STATUS_OFF: &str = "Chassis Power is off";

/// Fence-relevant slice of the daemon configuration.
#[derive(Debug, Clone)]
pub struct FenceParams {
    pub keepalive_interval: u64,
    pub fence_intervals: u64,
    pub suicide_intervals: u64,
    pub successful_fence: FenceAction,
    pub failed_fence: FenceAction,
    pub migration_target_selector: String,
    pub coordinators: Vec<String>,
}

impl FenceParams {
    pub fn from_config(config: &Config) -> Self {
        FenceParams {
            keepalive_interval: config.file.timer.keepalive_interval,
            fence_intervals: config.file.fencing.intervals.fence_intervals,
            suicide_intervals: config.file.fencing.intervals.suicide_interval,
            successful_fence: config.file.fencing.actions.successful_fence,
            failed_fence: config.file.fencing.actions.failed_fence,
            migration_target_selector: config.file.migration.target_selector.clone(),
            coordinators: config.file.cluster.coordinator_nodes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The node came back during its saving throws.
    Recovered,
    Success,
    Failure,
}

/// Classify the IPMI reboot sequence.
///
/// A confirmed-off chassis is a successful fence even when the power-off
/// command itself failed; any unknown power state is a failure because it
/// may hide a node that is still alive.
pub fn classify_fence(power_off_ok: bool, final_status: &str) -> bool {
    if power_off_ok {
        final_status == STATUS_ON || final_status == STATUS_OFF
    } else {
        final_status == STATUS_OFF
    }
}

/// Fence `node_name`, previously declared dead by the keepalive loop.
///
/// Runs on a worker-pool thread; every step blocks.
pub fn fence_node(
    handle: &Handle,
    params: &FenceParams,
    bmc_factory: &BmcFactory,
    node_name: &str,
) -> Result<FenceOutcome, Error> {
    // saving throws: one re-read per keepalive interval
    for throw in 1..=SAVING_THROWS {
        std::thread::sleep(Duration::from_secs(params.keepalive_interval));
        let state = handle
            .read(Key::Node(node_name, NodeKey::DaemonState))?
            .unwrap_or_default();
        if state != DaemonState::Dead.as_str() {
            info!(node = node_name, "node passed a saving throw; cancelling fence");
            return Ok(FenceOutcome::Recovered);
        }
        info!(
            node = node_name,
            "node failed {throw}/{SAVING_THROWS} saving throws"
        );
    }

    info!(node = node_name, "fencing node via IPMI reboot signal");

    let credentials = handle.read_many(&[
        Key::Node(node_name, NodeKey::IpmiHostname),
        Key::Node(node_name, NodeKey::IpmiUsername),
        Key::Node(node_name, NodeKey::IpmiPassword),
    ])?;
    let bmc = bmc_factory(
        credentials[0].as_deref().unwrap_or_default(),
        credentials[1].as_deref().unwrap_or_default(),
        credentials[2].as_deref().unwrap_or_default(),
    );

    let fenced = reboot_via_ipmi(&*bmc, node_name)?;

    // hold to let the fence take effect and the cluster stabilize
    info!(
        node = node_name,
        "waiting {}s for fence to take effect", params.keepalive_interval
    );
    std::thread::sleep(Duration::from_secs(params.keepalive_interval));

    if fenced {
        handle.write(&[(
            Key::Node(node_name, NodeKey::DaemonState),
            DaemonState::Fenced.as_str().to_owned(),
        )])?;

        if params.coordinators.iter().any(|c| c == node_name) {
            info!(node = node_name, "forcing secondary coordinator state");
            handle.write(&[(
                Key::Node(node_name, NodeKey::RouterState),
                RouterState::Secondary.as_str().to_owned(),
            )])?;
            let primary = handle.read(Key::Base(BaseKey::PrimaryNode))?;
            if primary.as_deref() == Some(node_name) {
                handle.write(&[(
                    Key::Base(BaseKey::PrimaryNode),
                    RouterState::None.as_str().to_owned(),
                )])?;
            }
        }
    }

    let outcome_word = if fenced { "successful" } else { "failed" };
    generate_fault(
        handle,
        &format!("FENCE_{node_name}"),
        50,
        &format!("Node {node_name} was fenced ({outcome_word} IPMI reboot)"),
        None,
    )?;

    if migrate_after_fence(fenced, params) {
        if !fenced {
            warn!(
                node = node_name,
                "failed fence with migrate action and suicide enabled; \
                 trusting the operator assertion that the node is down"
            );
        }
        migrate_from_fenced_node(handle, params, node_name)?;
    }

    info!(node = node_name, "resetting resource values of dead node");
    handle.write(&[
        (Key::Node(node_name, NodeKey::RunningDomains), String::new()),
        (Key::Node(node_name, NodeKey::DomainsCount), "0".to_owned()),
        (Key::Node(node_name, NodeKey::CpuLoad), "0".to_owned()),
        (Key::Node(node_name, NodeKey::VcpuAllocated), "0".to_owned()),
        (Key::Node(node_name, NodeKey::MemoryTotal), "0".to_owned()),
        (Key::Node(node_name, NodeKey::MemoryUsed), "0".to_owned()),
        (Key::Node(node_name, NodeKey::MemoryFree), "0".to_owned()),
        (Key::Node(node_name, NodeKey::MemoryAllocated), "0".to_owned()),
        (Key::Node(node_name, NodeKey::MemoryProvisioned), "0".to_owned()),
        (Key::Node(node_name, NodeKey::Health), String::new()),
    ])?;

    Ok(if fenced {
        FenceOutcome::Success
    } else {
        FenceOutcome::Failure
    })
}

/// Whether VMs move off the node after a fence attempt.
///
/// A failed fence migrates only when the operator both enabled the
/// `failed_fence` action and armed the suicide watchdog, the explicit "I
/// know this node is off" assertion.
pub fn migrate_after_fence(fenced: bool, params: &FenceParams) -> bool {
    if fenced {
        params.successful_fence == FenceAction::Migrate
    } else {
        params.failed_fence == FenceAction::Migrate && params.suicide_intervals != 0
    }
}

/// The IPMI off/status/on/status sequence.
fn reboot_via_ipmi(bmc: &dyn Bmc, node_name: &str) -> Result<bool, Error> {
    info!(node = node_name, "sending power off to dead node");
    let (off_ok, off_err) = bmc.chassis(PowerOp::Off, None)?;
    if !off_ok {
        warn!(node = node_name, "failed to power off dead node: {off_err}");
    }
    std::thread::sleep(POWER_OFF_SETTLE);

    let (status_ok, status) = bmc.chassis(PowerOp::Status, None)?;
    if status_ok {
        info!(node = node_name, "current chassis power state is: {status}");
    } else {
        warn!(node = node_name, "current chassis power state is: Unknown");
    }

    info!(node = node_name, "sending power on to dead node");
    let (on_ok, on_err) = bmc.chassis(PowerOp::On, None)?;
    if !on_ok {
        warn!(node = node_name, "failed to power on dead node: {on_err}");
    }
    std::thread::sleep(POWER_ON_SETTLE);

    let (_final_ok, final_status) = bmc.chassis(PowerOp::Status, None)?;

    let fenced = classify_fence(off_ok, &final_status);
    if fenced {
        info!(
            node = node_name,
            "fence confirmed ({final_status}); proceeding with recovery action"
        );
    } else {
        warn!(
            node = node_name,
            "chassis in unconfirmed state ({final_status}); NOT proceeding with recovery action"
        );
    }
    Ok(fenced)
}

/// Flush every VM off a fenced node onto new owners.
pub fn migrate_from_fenced_node(
    handle: &Handle,
    params: &FenceParams,
    node_name: &str,
) -> Result<(), Error> {
    info!(node = node_name, "migrating VMs from dead node to new hosts");

    let running = handle
        .read(Key::Node(node_name, NodeKey::RunningDomains))?
        .unwrap_or_default();

    handle.write(&[(
        Key::Node(node_name, NodeKey::DomainState),
        DomainState::FenceFlush.as_str().to_owned(),
    )])?;

    for uuid in running.split_whitespace() {
        if let Err(err) = fence_migrate_vm(handle, params, node_name, uuid) {
            warn!(uuid, "failed to migrate VM, continuing: {err:#}");
        }
    }

    handle.write(&[(
        Key::Node(node_name, NodeKey::DomainState),
        DomainState::Flushed.as_str().to_owned(),
    )])?;
    info!(node = node_name, "all VMs flushed from dead node");
    Ok(())
}

fn fence_migrate_vm(
    handle: &Handle,
    params: &FenceParams,
    node_name: &str,
    uuid: &str,
) -> Result<(), Error> {
    info!(uuid, "flushing RBD locks of VM after fence");
    if let Err(err) = pvc_vm::storage::flush_locks(handle, uuid) {
        warn!(uuid, "lock flush failed: {err:#}");
    }

    let target = pvc_scheduler::find_target(handle, &params.migration_target_selector, uuid)
        .context("target selection failed")?;

    match target {
        Some(target) => {
            info!(uuid, target = %target, "migrating VM off fenced node");
            handle.write(&[
                (
                    Key::Domain(uuid, DomainKey::State),
                    VmState::Start.as_str().to_owned(),
                ),
                (Key::Domain(uuid, DomainKey::Node), target),
                (
                    Key::Domain(uuid, DomainKey::LastNode),
                    node_name.to_owned(),
                ),
            ])?;
        }
        None => {
            info!(uuid, "no target node found; marking autostart on current node");
            handle.write(&[
                (
                    Key::Domain(uuid, DomainKey::State),
                    VmState::Stop.as_str().to_owned(),
                ),
                (
                    Key::Domain(uuid, DomainKey::MetaAutostart),
                    "True".to_owned(),
                ),
            ])?;
            generate_fault(
                handle,
                &format!("FENCE_NO_TARGET_{uuid}"),
                10,
                &format!("No migration target for VM {uuid} after fence of {node_name}"),
                None,
            )?;
        }
    }
    Ok(())
}

/// Verify IPMI connectivity to this host; run once during startup.
pub fn verify_ipmi(bmc: &dyn Bmc) -> bool {
    match bmc.chassis(PowerOp::Status, Some(Duration::from_secs(2))) {
        Ok((true, status)) => status == STATUS_ON,
        _ => false,
    }
}

/// Best-effort self power-cycle when this node's own keepalive stalled.
pub fn suicide(bmc: &dyn Bmc) {
    warn!("keepalive stalled beyond the suicide threshold; power-cycling this node");
    let _ = bmc.chassis(PowerOp::Off, None);
    let _ = bmc.chassis(PowerOp::On, None);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classification_table() {
        // power off ok, final on: rebooted successfully
        assert!(classify_fence(true, STATUS_ON));
        // power off ok, confirmed dark
        assert!(classify_fence(true, STATUS_OFF));
        // power off failed but chassis confirmed dark
        assert!(classify_fence(false, STATUS_OFF));
        // anything else is a failure
        assert!(!classify_fence(true, "Chassis Power is unknown"));
        assert!(!classify_fence(false, STATUS_ON));
        assert!(!classify_fence(false, ""));
    }

    fn params(successful: FenceAction, failed: FenceAction, suicide: u64) -> FenceParams {
        FenceParams {
            keepalive_interval: 5,
            fence_intervals: 6,
            suicide_intervals: suicide,
            successful_fence: successful,
            failed_fence: failed,
            migration_target_selector: "mem".to_owned(),
            coordinators: vec!["hv1".to_owned()],
        }
    }

    #[test]
    fn test_migration_policy_table() {
        use FenceAction::{Migrate, None as NoAction};

        // successful fence follows successful_fence directly
        assert!(migrate_after_fence(true, &params(Migrate, NoAction, 0)));
        assert!(!migrate_after_fence(true, &params(NoAction, Migrate, 3)));

        // failed fence needs both the migrate action and the suicide opt-in
        assert!(migrate_after_fence(false, &params(NoAction, Migrate, 3)));
        assert!(!migrate_after_fence(false, &params(NoAction, Migrate, 0)));
        assert!(!migrate_after_fence(false, &params(Migrate, NoAction, 3)));
    }
}
