//! Cluster scenarios: cold start, planned failover, fenced-coordinator
//! recovery. Three simulated daemons share one in-memory store; libvirt is
//! mocked and IPMI scripted.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pvc_common::RouterState;
use pvc_config::Config;
use pvc_daemon::node::{Event, NodeInstance};
use pvc_daemon::keepalive;
use pvc_fencing::{Bmc, BmcFactory, PowerOp};
use pvc_store::{BaseKey, DomainKey, Handle, Key, MemStore, NodeKey, Store};
use pvc_vm::mock::MockHypervisor;

const UUID: &str = "f5c6b4a3-0000-4000-8000-000000000042";

fn config_yaml(keepalive_interval: u64) -> String {
    format!(
        r#"
path:
  plugin_directory: /nonexistent/pvc/plugins
  dynamic_directory: /tmp/pvc-test/run
  log_directory: /tmp/pvc-test/log
  system_configuration_directory: /tmp/pvc-test/etc
subsystem: {{}}
cluster:
  name: testcluster
  all_nodes: [hv1, hv2, hv3]
  coordinator_nodes: [hv1, hv2, hv3]
  networks:
    cluster:
      device: vlan100
      mtu: 9000
      ipv4: {{ network_address: 10.0.100.0, netmask: 24, floating_address: 10.0.100.254 }}
      node_ip_selection: by-id
    storage:
      device: vlan101
      mtu: 9000
      ipv4: {{ network_address: 10.0.101.0, netmask: 24, floating_address: 10.0.101.254 }}
      node_ip_selection: by-id
    upstream:
      domain: example.tld
      device: vlan102
      mtu: 1500
      ipv4: {{ network_address: 192.168.1.0, netmask: 24, floating_address: 192.168.1.10 }}
      node_ip_selection: by-id
database:
  zookeeper: {{ port: 2181 }}
  keydb: {{ port: 6379, hostname: 127.0.0.1, path: /2 }}
  postgres:
    port: 5432
    hostname: 127.0.0.1
    credentials:
      dns: {{ database: pvcdns, username: pvcdns, password: secret }}
timer:
  keepalive_interval: {keepalive_interval}
  vm_shutdown_timeout: 2
fencing:
  intervals: {{ fence_intervals: 6, suicide_interval: 0 }}
  actions: {{ successful_fence: migrate, failed_fence: none }}
  ipmi: {{ hostname: "hv{{node_id}}-lom.example.tld", username: admin, password: admin }}
migration:
  target_selector: mem
guest_networking:
  bridge_device: bondU
  bridge_mtu: 1500
ceph:
  ceph_config_file: /etc/ceph/ceph.conf
  ceph_keyring_file: /etc/ceph/ceph.client.admin.keyring
  monitor_port: 6789
  secret_uuid: 91e867a5-63f4-4a54-b47d-f6d082271a8f
"#
    )
}

struct ScriptedBmc {
    off_ok: bool,
    status: &'static str,
}

impl Bmc for ScriptedBmc {
    fn chassis(
        &self,
        op: PowerOp,
        _timeout: Option<Duration>,
    ) -> Result<(bool, String), anyhow::Error> {
        Ok(match op {
            PowerOp::Off => (self.off_ok, String::new()),
            PowerOp::On => (false, "Unable to establish IPMI session".to_owned()),
            PowerOp::Status => (true, self.status.to_owned()),
        })
    }
}

fn dark_host_factory() -> Arc<BmcFactory> {
    Arc::new(|_hostname, _username, _password| {
        Box::new(ScriptedBmc {
            off_ok: false,
            status: "Chassis Power is off",
        }) as Box<dyn Bmc>
    })
}

fn sim_daemon(
    handle: &Handle,
    name: &str,
    keepalive_interval: u64,
) -> (Arc<NodeInstance>, MockHypervisor) {
    let config = Arc::new(Config::parse(&config_yaml(keepalive_interval), name).unwrap());
    let hypervisor = MockHypervisor::new();
    let (node, _events) = NodeInstance::new(
        config,
        handle.clone(),
        Arc::new(hypervisor.clone()),
        dark_host_factory(),
    );
    node.register().unwrap();
    (node, hypervisor)
}

fn handle() -> Handle {
    Handle::new(Arc::new(MemStore::new()) as Arc<dyn Store>).unwrap()
}

fn read(handle: &Handle, key: Key) -> String {
    handle.read(key).unwrap().unwrap_or_default()
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[test]
fn test_cold_start_elects_single_primary() {
    let handle = handle();
    let (hv1, _) = sim_daemon(&handle, "hv1", 5);
    let (hv2, _) = sim_daemon(&handle, "hv2", 5);
    let (hv3, _) = sim_daemon(&handle, "hv3", 5);

    hv1.initial_sync().unwrap();
    hv2.initial_sync().unwrap();
    hv3.initial_sync().unwrap();

    // exactly one winner: the first to contend
    assert_eq!(read(&handle, Key::Base(BaseKey::PrimaryNode)), "hv1");

    // the winner transitions toward primary, the others stay secondary
    hv1.on_primary_changed(Some("hv1")).unwrap();
    hv2.on_primary_changed(Some("hv1")).unwrap();
    hv3.on_primary_changed(Some("hv1")).unwrap();
    assert_eq!(
        read(&handle, Key::Node("hv1", NodeKey::RouterState)),
        "takeover"
    );
    assert_eq!(
        read(&handle, Key::Node("hv2", NodeKey::RouterState)),
        "secondary"
    );
    assert_eq!(
        read(&handle, Key::Node("hv3", NodeKey::RouterState)),
        "secondary"
    );
}

#[test]
fn test_planned_failover_sequence() {
    let handle = handle();
    let (hv1, _) = sim_daemon(&handle, "hv1", 5);
    let (hv2, _) = sim_daemon(&handle, "hv2", 5);
    hv1.initial_sync().unwrap();
    hv2.initial_sync().unwrap();

    // hv1 is fully primary
    handle
        .write(&[
            (Key::Base(BaseKey::PrimaryNode), "hv1".to_owned()),
            (Key::Node("hv1", NodeKey::RouterState), "primary".to_owned()),
        ])
        .unwrap();
    hv1.dispatch(Event::OwnRouterState(Some("primary".to_owned())));
    assert_eq!(hv1.router_state(), RouterState::Primary);

    // the admin points the cluster at hv2
    handle
        .write(&[(Key::Base(BaseKey::PrimaryNode), "hv2".to_owned())])
        .unwrap();

    // old primary starts relinquishing
    hv1.on_primary_changed(Some("hv2")).unwrap();
    assert_eq!(
        read(&handle, Key::Node("hv1", NodeKey::RouterState)),
        "relinquish"
    );

    // the new primary must not begin bring-up while hv1 still holds on
    assert!(!hv2.previous_primary_released());

    // once hv1 finishes its ordered teardown, hv2 may proceed
    handle
        .write(&[(Key::Node("hv1", NodeKey::RouterState), "secondary".to_owned())])
        .unwrap();
    assert!(hv2.previous_primary_released());

    hv2.on_primary_changed(Some("hv2")).unwrap();
    assert_eq!(
        read(&handle, Key::Node("hv2", NodeKey::RouterState)),
        "takeover"
    );
}

#[test]
fn test_fenced_coordinator_recovery() {
    let handle = handle();
    // keepalive interval 0 keeps the fence saving throws instant
    let (hv2, _) = sim_daemon(&handle, "hv2", 0);
    hv2.initial_sync().unwrap();

    // hv1 was primary, owns a running VM, and has gone dark
    handle
        .write(&[
            (Key::Base(BaseKey::PrimaryNode), "hv1".to_owned()),
            (Key::Node("hv1", NodeKey::Mode), "coordinator".to_owned()),
            (Key::Node("hv1", NodeKey::DaemonState), "run".to_owned()),
            (Key::Node("hv1", NodeKey::RouterState), "primary".to_owned()),
            (Key::Node("hv1", NodeKey::DomainState), "ready".to_owned()),
            (
                Key::Node("hv1", NodeKey::Keepalive),
                (now() - 100).to_string(),
            ),
            (Key::Node("hv1", NodeKey::RunningDomains), UUID.to_owned()),
            (
                Key::Node("hv1", NodeKey::IpmiHostname),
                "hv1-lom.example.tld".to_owned(),
            ),
            (Key::Node("hv1", NodeKey::IpmiUsername), "admin".to_owned()),
            (Key::Node("hv1", NodeKey::IpmiPassword), "admin".to_owned()),
            (Key::Domain(UUID, DomainKey::Node), "hv1".to_owned()),
            (Key::Domain(UUID, DomainKey::State), "start".to_owned()),
            (Key::Domain(UUID, DomainKey::StorageVolumes), String::new()),
        ])
        .unwrap();

    // hv2's keepalive declares hv1 dead and spawns the fence task
    keepalive::evaluate_peers(&hv2).unwrap();
    assert_eq!(read(&handle, Key::Node("hv1", NodeKey::DaemonState)), "dead");

    // the fence runs on the worker pool: saving throws, IPMI sequence
    // (confirmed dark), recovery migration
    let deadline = Instant::now() + Duration::from_secs(30);
    while read(&handle, Key::Node("hv1", NodeKey::DaemonState)) != "fenced" {
        assert!(Instant::now() < deadline, "fence did not complete in time");
        std::thread::sleep(Duration::from_millis(250));
    }

    // coordinator demotion and pointer clear
    assert_eq!(
        read(&handle, Key::Node("hv1", NodeKey::RouterState)),
        "secondary"
    );
    assert_eq!(read(&handle, Key::Base(BaseKey::PrimaryNode)), "none");

    // wait for the recovery migration to land
    let deadline = Instant::now() + Duration::from_secs(10);
    while read(&handle, Key::Node("hv1", NodeKey::DomainState)) != "flushed" {
        assert!(Instant::now() < deadline, "fence flush did not complete");
        std::thread::sleep(Duration::from_millis(100));
    }

    // the VM moved to the surviving node
    assert_eq!(read(&handle, Key::Domain(UUID, DomainKey::Node)), "hv2");
    assert_eq!(read(&handle, Key::Domain(UUID, DomainKey::State)), "start");
    assert_eq!(read(&handle, Key::Domain(UUID, DomainKey::LastNode)), "hv1");

    // resource counters were reset
    let deadline = Instant::now() + Duration::from_secs(10);
    while read(&handle, Key::Node("hv1", NodeKey::CpuLoad)) != "0" {
        assert!(Instant::now() < deadline, "counters were not reset");
        std::thread::sleep(Duration::from_millis(100));
    }

    // the remaining coordinator claims the primary role
    hv2.on_primary_changed(Some("none")).unwrap();
    assert_eq!(read(&handle, Key::Base(BaseKey::PrimaryNode)), "hv2");
}

#[test]
fn test_missed_keepalives_below_threshold_do_not_fence() {
    let handle = handle();
    let (hv2, _) = sim_daemon(&handle, "hv2", 5);
    hv2.initial_sync().unwrap();

    // 29 seconds stale: one second short of 6 x 5s
    handle
        .write(&[
            (Key::Node("hv1", NodeKey::DaemonState), "run".to_owned()),
            (
                Key::Node("hv1", NodeKey::Keepalive),
                (now() - 29).to_string(),
            ),
        ])
        .unwrap();
    keepalive::evaluate_peers(&hv2).unwrap();
    assert_eq!(read(&handle, Key::Node("hv1", NodeKey::DaemonState)), "run");

    // exactly at the threshold: fence
    handle
        .write(&[(
            Key::Node("hv1", NodeKey::Keepalive),
            (now() - 30).to_string(),
        )])
        .unwrap();
    keepalive::evaluate_peers(&hv2).unwrap();
    assert_eq!(read(&handle, Key::Node("hv1", NodeKey::DaemonState)), "dead");
}

#[test]
fn test_fenced_node_does_not_refresh_keepalive() {
    let handle = handle();
    let (hv1, _) = sim_daemon(&handle, "hv1", 5);
    hv1.initial_sync().unwrap();

    handle
        .write(&[
            (Key::Node("hv1", NodeKey::DaemonState), "fenced".to_owned()),
            (Key::Node("hv1", NodeKey::Keepalive), "12345".to_owned()),
        ])
        .unwrap();
    keepalive::node_keepalive(&hv1).unwrap();

    // neither the timestamp nor the state moved
    assert_eq!(read(&handle, Key::Node("hv1", NodeKey::Keepalive)), "12345");
    assert_eq!(
        read(&handle, Key::Node("hv1", NodeKey::DaemonState)),
        "fenced"
    );
}

#[test]
fn test_keepalive_publishes_counters() {
    let handle = handle();
    let (hv1, hypervisor) = sim_daemon(&handle, "hv1", 5);
    hv1.initial_sync().unwrap();

    hypervisor.add_domain(UUID, true);
    handle
        .write(&[
            (Key::Domain(UUID, DomainKey::Node), "hv1".to_owned()),
            (Key::Domain(UUID, DomainKey::State), "start".to_owned()),
            (Key::Domain(UUID, DomainKey::Memory), "2048".to_owned()),
            (Key::Domain(UUID, DomainKey::Vcpus), "2".to_owned()),
        ])
        .unwrap();

    keepalive::node_keepalive(&hv1).unwrap();

    assert_eq!(
        read(&handle, Key::Node("hv1", NodeKey::MemoryProvisioned)),
        "2048"
    );
    assert_eq!(
        read(&handle, Key::Node("hv1", NodeKey::MemoryAllocated)),
        "2048"
    );
    assert_eq!(read(&handle, Key::Node("hv1", NodeKey::VcpuAllocated)), "2");
    assert_eq!(read(&handle, Key::Node("hv1", NodeKey::RunningDomains)), UUID);
    assert_eq!(read(&handle, Key::Node("hv1", NodeKey::DomainsCount)), "1");
    let keepalive: u64 = read(&handle, Key::Node("hv1", NodeKey::Keepalive))
        .parse()
        .unwrap();
    assert!(now() - keepalive < 5);
    // allocated never exceeds total on a sane placement
    let total: u64 = read(&handle, Key::Node("hv1", NodeKey::MemoryTotal))
        .parse()
        .unwrap();
    assert!(2048 <= total);
}
