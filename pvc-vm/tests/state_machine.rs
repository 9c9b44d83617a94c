//! End-to-end state machine scenarios against the in-memory store and the
//! mock hypervisor, simulating two nodes sharing one cluster store.

use std::sync::Arc;

use pvc_store::{BaseKey, DomainKey, Handle, Key, MemStore};
use pvc_vm::mock::MockHypervisor;
use pvc_vm::{define_vm, request_migration, RunningDomains, VmInstance};

const UUID: &str = "f5c6b4a3-0000-4000-8000-000000000001";

struct SimNode {
    hypervisor: MockHypervisor,
    running: RunningDomains,
    instance: Arc<VmInstance>,
}

fn sim_node(handle: &Handle, name: &str) -> SimNode {
    let hypervisor = MockHypervisor::new();
    let running = RunningDomains::new();
    let instance = VmInstance::new(
        handle.clone(),
        Arc::new(hypervisor.clone()),
        running.clone(),
        name,
        UUID,
        2,
    );
    SimNode {
        hypervisor,
        running,
        instance,
    }
}

fn cluster() -> (Handle, SimNode, SimNode) {
    let handle = Handle::new(Arc::new(MemStore::new())).unwrap();
    let hv1 = sim_node(&handle, "hv1");
    let hv2 = sim_node(&handle, "hv2");
    (handle, hv1, hv2)
}

fn vm_state(handle: &Handle) -> String {
    handle
        .read(Key::Domain(UUID, DomainKey::State))
        .unwrap()
        .unwrap_or_default()
}

fn write_state(handle: &Handle, state: &str) {
    handle
        .write(&[(Key::Domain(UUID, DomainKey::State), state.to_owned())])
        .unwrap();
}

#[test]
fn test_define_and_start() {
    let (handle, hv1, _hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    assert_eq!(vm_state(&handle), "stop");

    write_state(&handle, "start");
    hv1.instance.manage_state();

    assert!(hv1.hypervisor.is_running(UUID));
    assert!(hv1.running.contains(UUID));
    assert_eq!(vm_state(&handle), "start");
}

#[test]
fn test_start_failure_marks_failed() {
    let (handle, hv1, _hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    hv1.hypervisor.fail_next_create();

    write_state(&handle, "start");
    hv1.instance.manage_state();

    assert_eq!(vm_state(&handle), "fail");
    let reason = handle
        .read(Key::Domain(UUID, DomainKey::FailedReason))
        .unwrap()
        .unwrap();
    assert!(reason.contains("create failed"));
}

#[test]
fn test_shutdown_writes_stop() {
    let (handle, hv1, _hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    write_state(&handle, "shutdown");
    hv1.instance.manage_state();

    assert!(!hv1.hypervisor.is_running(UUID));
    assert!(!hv1.running.contains(UUID));
    assert_eq!(vm_state(&handle), "stop");
}

#[test]
fn test_repeated_state_write_is_idempotent() {
    let (handle, hv1, _hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    write_state(&handle, "start");
    hv1.instance.manage_state();

    assert!(hv1.hypervisor.is_running(UUID));
    assert!(hv1.running.contains(UUID));
    assert_eq!(vm_state(&handle), "start");
}

#[test]
fn test_split_start_peer_terminates() {
    let (handle, hv1, hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    // a fence race left a second copy running on hv2
    hv2.hypervisor.add_domain(UUID, true);
    hv2.running.add(UUID);
    hv2.instance.manage_state();

    assert!(!hv2.hypervisor.is_running(UUID));
    assert!(!hv2.running.contains(UUID));
    // the rightful owner is untouched
    assert!(hv1.hypervisor.is_running(UUID));
}

#[test]
fn test_stuck_migrate_self_heals() {
    let (handle, hv1, _hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    // migrate state pointing at the node already running the VM
    write_state(&handle, "migrate");
    hv1.instance.manage_state();

    assert_eq!(vm_state(&handle), "start");
    assert!(hv1.running.contains(UUID));
}

#[test]
fn test_live_migrate_roundtrip() {
    let (handle, hv1, hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    // admin requests a migration to hv2
    request_migration(&handle, UUID, "hv2").unwrap();
    assert_eq!(vm_state(&handle), "migrate");
    assert_eq!(
        handle.read(Key::Domain(UUID, DomainKey::LastNode)).unwrap().as_deref(),
        Some("hv1")
    );

    // old owner pushes the domain out
    hv1.instance.manage_state();
    let migrations = hv1.hypervisor.migrations();
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].1, "qemu+tcp://hv2/system");
    assert!(!hv1.running.contains(UUID));

    // the libvirt stream materializes the domain on hv2
    hv2.hypervisor.add_domain(UUID, true);
    hv2.instance.manage_state();

    assert_eq!(vm_state(&handle), "start");
    assert!(hv2.running.contains(UUID));

    // unmigrate returns it to hv1 and clears last_node
    write_state(&handle, "unmigrate");
    hv2.instance.manage_state();
    assert_eq!(vm_state(&handle), "migrate");
    assert_eq!(
        handle.read(Key::Domain(UUID, DomainKey::Node)).unwrap().as_deref(),
        Some("hv1")
    );
    assert_eq!(
        handle.read(Key::Domain(UUID, DomainKey::LastNode)).unwrap().as_deref(),
        Some("")
    );

    // hv2 is now the sender
    hv2.instance.manage_state();
    assert!(!hv2.running.contains(UUID));
    hv1.hypervisor.set_running(UUID, true);
    hv1.instance.manage_state();
    assert_eq!(vm_state(&handle), "start");
    assert!(hv1.running.contains(UUID));
}

#[test]
fn test_failed_live_migration_falls_back_cold() {
    let (handle, hv1, hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    hv1.hypervisor.fail_migrations(true);
    request_migration(&handle, UUID, "hv2").unwrap();
    hv1.instance.manage_state();

    // sender shut the VM down and requested a fresh start on the target
    assert!(!hv1.hypervisor.is_running(UUID));
    assert_eq!(vm_state(&handle), "start");

    hv2.instance.manage_state();
    assert!(hv2.hypervisor.is_running(UUID));
    assert!(hv2.running.contains(UUID));
}

#[test]
fn test_delete_removes_subtree() {
    let (handle, hv1, _hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    write_state(&handle, "delete");
    hv1.instance.manage_state();

    assert!(!hv1.hypervisor.is_running(UUID));
    assert!(!handle.exists(Key::Domain(UUID, DomainKey::Root)).unwrap());
    assert!(handle.children(Key::Base(BaseKey::Domain)).unwrap().is_empty());
}

#[test]
fn test_disable_keeps_state_but_stops_vm() {
    let (handle, hv1, _hv2) = cluster();
    define_vm(&handle, "mem", UUID, "testvm", UUID, Some("hv1")).unwrap();
    write_state(&handle, "start");
    hv1.instance.manage_state();

    write_state(&handle, "disable");
    hv1.instance.manage_state();

    assert!(!hv1.hypervisor.is_running(UUID));
    assert_eq!(vm_state(&handle), "disable");
}
