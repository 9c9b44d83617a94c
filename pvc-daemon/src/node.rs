//! The node instance.
//!
//! Owns the local view of the cluster: the VM map, the network map, the
//! SR-IOV VF map and the router state machine. Watch callbacks only push
//! events into a channel; a dispatcher thread hands the actual work to the
//! bounded worker pool.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};
use crossbeam_channel::{Receiver, Sender};
use threadpool::ThreadPool;
use tracing::{info, warn};

use pvc_common::{DaemonState, DomainState, RouterState, VmState};
use pvc_config::Config;
use pvc_dns::{AggregatorParams, DnsAggregator};
use pvc_fencing::{BmcFactory, FenceParams};
use pvc_monitoring::{faults::generate_fault, MonitoringInstance};
use pvc_network::{ip, NetworkInstance, NetworkParams, SriovVfInstance};
use pvc_store::{BaseKey, DomainKey, Handle, Key, NodeKey, VfKey, WatchEvent};
use pvc_vm::{Hypervisor, RunningDomains, VmInstance};

use crate::sysinfo;

/// Size of the bounded worker pool.
const WORKER_POOL_SIZE: usize = 100;

/// Everything the dispatcher reacts to.
#[derive(Debug, Clone)]
pub enum Event {
    PrimaryPointer(Option<String>),
    OwnRouterState(Option<String>),
    OwnDomainState(Option<String>),
    NodeList(Vec<String>),
    DomainList(Vec<String>),
    NetworkList(Vec<String>),
    DomainState(String),
    VfList(Vec<String>),
    VfAttribute(String, VfKey),
}

pub struct NodeInstance {
    pub config: Arc<Config>,
    pub handle: Handle,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub pool: ThreadPool,
    pub running: RunningDomains,
    pub fence_params: FenceParams,
    pub bmc_factory: Arc<BmcFactory>,
    pub stop: Arc<AtomicBool>,

    vms: Mutex<HashMap<String, Arc<VmInstance>>>,
    networks: Mutex<HashMap<String, Arc<NetworkInstance>>>,
    vfs: Mutex<HashMap<String, Arc<SriovVfInstance>>>,
    dns: DnsAggregator,
    monitoring: Mutex<Option<Arc<MonitoringInstance>>>,
    router_state: Mutex<RouterState>,
    /// Nodes with a fence task in flight.
    pub(crate) fencing: Mutex<HashSet<String>>,
    /// Unix time of the last successful keepalive write.
    pub last_keepalive: AtomicU64,
    /// Cleared when IPMI verification fails and the operator opted out.
    pub fencing_enabled: AtomicBool,
    events: Sender<Event>,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

impl NodeInstance {
    pub fn new(
        config: Arc<Config>,
        handle: Handle,
        hypervisor: Arc<dyn Hypervisor>,
        bmc_factory: Arc<BmcFactory>,
    ) -> (Arc<Self>, Receiver<Event>) {
        let (events, receiver) = crossbeam_channel::unbounded();

        let dns_credentials = config.dns_credentials().ok();
        let dns = DnsAggregator::new(AggregatorParams {
            cluster_floating_ip: config.cluster_network.floating.addr(),
            upstream_floating_ip: config.upstream_network.floating.addr(),
            pdns_dynamic_dir: format!("{}/pdns", config.file.path.dynamic_directory).into(),
            pdns_log_dir: format!("{}/pdns", config.file.path.log_directory).into(),
            postgres_host: config.file.database.postgres.hostname.clone(),
            postgres_port: config.file.database.postgres.port,
            postgres_dbname: dns_credentials
                .map(|c| c.database.clone())
                .unwrap_or_else(|| "pvcdns".to_owned()),
            postgres_user: dns_credentials
                .map(|c| c.username.clone())
                .unwrap_or_else(|| "pvcdns".to_owned()),
            postgres_password: dns_credentials
                .map(|c| c.password.clone())
                .unwrap_or_default(),
            upstream_domain: config
                .upstream_network
                .domain
                .clone()
                .unwrap_or_else(|| "pvc.local".to_owned()),
        });

        let node = Arc::new(NodeInstance {
            fence_params: FenceParams::from_config(&config),
            handle,
            hypervisor,
            pool: ThreadPool::with_name("pvc-worker".to_owned(), WORKER_POOL_SIZE),
            running: RunningDomains::new(),
            bmc_factory,
            stop: Arc::new(AtomicBool::new(false)),
            vms: Mutex::new(HashMap::new()),
            networks: Mutex::new(HashMap::new()),
            vfs: Mutex::new(HashMap::new()),
            dns,
            monitoring: Mutex::new(None),
            router_state: Mutex::new(RouterState::Secondary),
            fencing: Mutex::new(HashSet::new()),
            last_keepalive: AtomicU64::new(now_secs()),
            fencing_enabled: AtomicBool::new(true),
            events,
            config,
        });
        (node, receiver)
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn router_state(&self) -> RouterState {
        *self.router_state.lock().unwrap()
    }

    fn set_router_state(&self, state: RouterState) {
        *self.router_state.lock().unwrap() = state;
    }

    pub fn monitoring(&self) -> Option<Arc<MonitoringInstance>> {
        self.monitoring.lock().unwrap().clone()
    }

    fn network_params(&self) -> NetworkParams {
        NetworkParams {
            cluster_device: self.config.cluster_network.device.clone(),
            bridge_device: self.config.file.guest_networking.bridge_device.clone(),
            bridge_mtu: self.config.file.guest_networking.bridge_mtu,
            dnsmasq_dynamic_dir: format!("{}/dnsmasq", self.config.file.path.dynamic_directory)
                .into(),
            dnsmasq_log_dir: format!("{}/dnsmasq", self.config.file.path.log_directory).into(),
            nft_dir: format!("{}/nft", self.config.file.path.dynamic_directory).into(),
        }
    }

    /// Register (or refresh) this node's subtree.
    pub fn register(&self) -> Result<(), Error> {
        let name = self.name();
        let mode = if self.config.is_coordinator() {
            "coordinator"
        } else {
            "hypervisor"
        };

        // a flushed node stays flushed across restarts
        let domain_state = match self
            .handle
            .read(Key::Node(name, NodeKey::DomainState))?
            .and_then(|raw| raw.parse::<DomainState>().ok())
        {
            Some(DomainState::Flushed) => DomainState::Flushed,
            _ => DomainState::Ready,
        };
        let router_state = if self.config.is_coordinator() {
            RouterState::Secondary
        } else {
            RouterState::None
        };
        self.set_router_state(router_state);

        self.handle.write(&[
            (Key::Node(name, NodeKey::Mode), mode.to_owned()),
            (
                Key::Node(name, NodeKey::DaemonState),
                DaemonState::Init.as_str().to_owned(),
            ),
            (
                Key::Node(name, NodeKey::RouterState),
                router_state.as_str().to_owned(),
            ),
            (
                Key::Node(name, NodeKey::DomainState),
                domain_state.as_str().to_owned(),
            ),
            (Key::Node(name, NodeKey::StaticData), sysinfo::static_data()?),
            (
                Key::Node(name, NodeKey::IpmiHostname),
                self.config.ipmi_hostname.clone(),
            ),
            (
                Key::Node(name, NodeKey::IpmiUsername),
                self.config.file.fencing.ipmi.username.clone(),
            ),
            (
                Key::Node(name, NodeKey::IpmiPassword),
                self.config.file.fencing.ipmi.password.clone(),
            ),
            (Key::Node(name, NodeKey::Keepalive), now_secs().to_string()),
        ])?;
        Ok(())
    }

    /// Bring up this node's own addresses on the three underlay networks.
    pub fn bind_underlay_addresses(&self) -> Result<(), Error> {
        for network in [
            &self.config.cluster_network,
            &self.config.storage_network,
            &self.config.upstream_network,
        ] {
            ip::bind_address(&network.node_address, &network.device)
                .with_context(|| format!("failed to bring up the {} underlay", network.name))?;
        }
        Ok(())
    }

    /// Install every cluster watch; callbacks only enqueue events.
    pub fn install_watches(&self) -> Result<(), Error> {
        let name = self.config.node_name.clone();

        let tx = self.events.clone();
        self.handle.watch_data(
            Key::Base(BaseKey::PrimaryNode),
            Box::new(move |event| {
                if let WatchEvent::Data { value, .. } = event {
                    let _ = tx.send(Event::PrimaryPointer(value.clone()));
                }
            }),
        )?;

        let tx = self.events.clone();
        self.handle.watch_data(
            Key::Node(&name, NodeKey::RouterState),
            Box::new(move |event| {
                if let WatchEvent::Data { value, .. } = event {
                    let _ = tx.send(Event::OwnRouterState(value.clone()));
                }
            }),
        )?;

        let tx = self.events.clone();
        self.handle.watch_data(
            Key::Node(&name, NodeKey::DomainState),
            Box::new(move |event| {
                if let WatchEvent::Data { value, .. } = event {
                    let _ = tx.send(Event::OwnDomainState(value.clone()));
                }
            }),
        )?;

        let tx = self.events.clone();
        self.handle.watch_children(
            Key::Base(BaseKey::Node),
            Box::new(move |event| {
                if let WatchEvent::Children { children, .. } = event {
                    let _ = tx.send(Event::NodeList(children.clone()));
                }
            }),
        )?;

        let tx = self.events.clone();
        self.handle.watch_children(
            Key::Base(BaseKey::Domain),
            Box::new(move |event| {
                if let WatchEvent::Children { children, .. } = event {
                    let _ = tx.send(Event::DomainList(children.clone()));
                }
            }),
        )?;

        let tx = self.events.clone();
        self.handle.watch_children(
            Key::Base(BaseKey::Network),
            Box::new(move |event| {
                if let WatchEvent::Children { children, .. } = event {
                    let _ = tx.send(Event::NetworkList(children.clone()));
                }
            }),
        )?;

        if self.config.file.guest_networking.sriov_enable {
            let tx = self.events.clone();
            self.handle.watch_children(
                Key::Node(&name, NodeKey::SriovVfs),
                Box::new(move |event| {
                    if let WatchEvent::Children { children, .. } = event {
                        let _ = tx.send(Event::VfList(children.clone()));
                    }
                }),
            )?;
        }
        Ok(())
    }

    /// Start the monitoring instance.
    pub fn start_monitoring(&self) -> Result<(), Error> {
        let instance = MonitoringInstance::new(
            self.handle.clone(),
            self.name(),
            std::path::Path::new(&self.config.file.path.plugin_directory),
            self.pool.clone(),
        )?;
        *self.monitoring.lock().unwrap() = Some(Arc::new(instance));
        Ok(())
    }

    /// Seed the maps and contend for primary once startup completes.
    pub fn initial_sync(self: &Arc<Self>) -> Result<(), Error> {
        let domains = self.handle.children(Key::Base(BaseKey::Domain))?;
        self.reconcile_domains(domains);
        let networks = self.handle.children(Key::Base(BaseKey::Network))?;
        self.reconcile_networks(networks);

        self.handle.write(&[(
            Key::Node(self.name(), NodeKey::DaemonState),
            DaemonState::Run.as_str().to_owned(),
        )])?;

        if self.config.is_coordinator() {
            let pointer = self.handle.read(Key::Base(BaseKey::PrimaryNode))?;
            self.contend_for_primary(pointer.as_deref())?;
        }
        Ok(())
    }

    /// Spawn the dispatcher thread.
    pub fn spawn_dispatcher(self: &Arc<Self>, receiver: Receiver<Event>) -> Result<(), Error> {
        let node = Arc::clone(self);
        std::thread::Builder::new()
            .name("pvc-dispatch".to_owned())
            .spawn(move || {
                for event in receiver {
                    if node.stop.load(Ordering::Acquire) {
                        break;
                    }
                    node.dispatch(event);
                }
            })
            .context("failed to spawn dispatcher thread")?;
        Ok(())
    }

    /// Apply one event, handing any real work to the pool. The dispatcher
    /// thread calls this for every received event.
    pub fn dispatch(self: &Arc<Self>, event: Event) {
        match event {
            Event::PrimaryPointer(value) => {
                let node = Arc::clone(self);
                self.pool.execute(move || {
                    if let Err(err) = node.on_primary_changed(value.as_deref()) {
                        warn!("primary pointer handling failed: {err:#}");
                    }
                });
            }
            Event::OwnRouterState(value) => {
                let Some(value) = value else { return };
                match value.parse::<RouterState>() {
                    Ok(RouterState::Takeover) => {
                        let node = Arc::clone(self);
                        self.pool.execute(move || node.become_primary());
                    }
                    Ok(RouterState::Relinquish) => {
                        let node = Arc::clone(self);
                        self.pool.execute(move || node.become_secondary());
                    }
                    Ok(state) => self.set_router_state(state),
                    Err(err) => warn!("{err}"),
                }
            }
            Event::OwnDomainState(value) => {
                let Some(value) = value else { return };
                match value.parse::<DomainState>() {
                    Ok(DomainState::Flush) => {
                        let node = Arc::clone(self);
                        self.pool.execute(move || {
                            if let Err(err) = node.flush_node() {
                                warn!("node flush failed: {err:#}");
                            }
                        });
                    }
                    Ok(DomainState::Unflush) => {
                        let node = Arc::clone(self);
                        self.pool.execute(move || {
                            if let Err(err) = node.unflush_node() {
                                warn!("node unflush failed: {err:#}");
                            }
                        });
                    }
                    _ => {}
                }
            }
            Event::NodeList(nodes) => {
                info!(count = nodes.len(), "node list updated");
            }
            Event::DomainList(uuids) => self.reconcile_domains(uuids),
            Event::NetworkList(vnis) => self.reconcile_networks(vnis),
            Event::DomainState(uuid) => {
                let instance = self.vms.lock().unwrap().get(&uuid).cloned();
                if let Some(instance) = instance {
                    self.pool.execute(move || instance.manage_state());
                }
            }
            Event::VfList(vfs) => self.reconcile_vfs(vfs),
            Event::VfAttribute(vf, field) => {
                let instance = self.vfs.lock().unwrap().get(&vf).cloned();
                if let Some(instance) = instance {
                    self.pool.execute(move || {
                        if let Err(err) = instance.apply_attribute(field) {
                            warn!("VF attribute apply failed: {err:#}");
                        }
                    });
                }
            }
        }
    }

    /// Instantiate VM objects for new UUIDs, drop the ones that vanished.
    fn reconcile_domains(self: &Arc<Self>, uuids: Vec<String>) {
        let mut vms = self.vms.lock().unwrap();

        for uuid in &uuids {
            if vms.contains_key(uuid) {
                continue;
            }
            let instance = VmInstance::new(
                self.handle.clone(),
                Arc::clone(&self.hypervisor),
                self.running.clone(),
                self.name(),
                uuid,
                self.config.file.timer.vm_shutdown_timeout,
            );
            let tx = self.events.clone();
            let watch_uuid = uuid.clone();
            if let Err(err) = self.handle.watch_data(
                Key::Domain(uuid, DomainKey::State),
                Box::new(move |_event| {
                    let _ = tx.send(Event::DomainState(watch_uuid.clone()));
                }),
            ) {
                warn!(%uuid, "failed to watch domain state: {err}");
            }
            let initial = Arc::clone(&instance);
            self.pool.execute(move || initial.manage_state());
            vms.insert(uuid.clone(), instance);
        }

        let gone: Vec<String> = vms
            .keys()
            .filter(|uuid| !uuids.contains(uuid))
            .cloned()
            .collect();
        for uuid in gone {
            if let Some(instance) = vms.remove(&uuid) {
                // one last pass cleans up any local leftover
                self.pool.execute(move || instance.manage_state());
            }
        }
    }

    fn reconcile_networks(self: &Arc<Self>, vnis: Vec<String>) {
        let mut networks = self.networks.lock().unwrap();

        for vni in &vnis {
            if networks.contains_key(vni) {
                continue;
            }
            let instance = match NetworkInstance::new(self.handle.clone(), self.network_params(), vni)
            {
                Ok(instance) => Arc::new(instance),
                Err(err) => {
                    warn!(%vni, "failed to load network definition: {err:#}");
                    continue;
                }
            };
            networks.insert(vni.clone(), Arc::clone(&instance));

            let node = Arc::clone(self);
            self.pool.execute(move || {
                if let Err(err) = instance.create_network() {
                    warn!(vni = instance.vni(), "network creation failed: {err:#}");
                    return;
                }
                if node.router_state() == RouterState::Primary {
                    if let Err(err) = instance.become_primary() {
                        warn!(vni = instance.vni(), "network primary bring-up failed: {err:#}");
                    }
                    if let Some((domain, gateway)) = instance.aggregated_domain() {
                        if let Err(err) = node.dns.add_network(&domain, gateway) {
                            warn!(%domain, "DNS aggregator registration failed: {err:#}");
                        }
                    }
                }
            });
        }

        let gone: Vec<String> = networks
            .keys()
            .filter(|vni| !vnis.contains(vni))
            .cloned()
            .collect();
        for vni in gone {
            if let Some(instance) = networks.remove(&vni) {
                let node = Arc::clone(self);
                self.pool.execute(move || {
                    if let Some((domain, _)) = instance.aggregated_domain() {
                        let _ = node.dns.remove_network(&domain);
                    }
                    let _ = instance.become_secondary();
                    if let Err(err) = instance.remove_network() {
                        warn!(vni = instance.vni(), "network removal failed: {err:#}");
                    }
                });
            }
        }
    }

    fn reconcile_vfs(self: &Arc<Self>, vfs: Vec<String>) {
        let mut map = self.vfs.lock().unwrap();
        for vf in &vfs {
            if map.contains_key(vf) {
                continue;
            }
            let instance = Arc::new(SriovVfInstance::new(
                self.handle.clone(),
                self.name(),
                vf,
            ));
            // one watch per attribute
            for field in SriovVfInstance::watched_attributes() {
                let tx = self.events.clone();
                let vf_name = vf.clone();
                let field = *field;
                if let Err(err) = self.handle.watch_data(
                    Key::SriovVf(self.name(), vf, field),
                    Box::new(move |_event| {
                        let _ = tx.send(Event::VfAttribute(vf_name.clone(), field));
                    }),
                ) {
                    warn!(%vf, "failed to watch VF attribute: {err}");
                }
            }
            map.insert(vf.clone(), instance);
        }
        map.retain(|vf, _| vfs.contains(vf));
    }

    /// Contend for the primary pointer when it reads "none".
    fn contend_for_primary(&self, pointer: Option<&str>) -> Result<(), Error> {
        let daemon_state = self
            .handle
            .read(Key::Node(self.name(), NodeKey::DaemonState))?
            .unwrap_or_default();
        if daemon_state != DaemonState::Run.as_str() {
            return Ok(());
        }
        let won = match pointer {
            None => self
                .handle
                .check_and_set(Key::Base(BaseKey::PrimaryNode), None, self.name())?,
            Some("none") => {
                self.handle
                    .check_and_set(Key::Base(BaseKey::PrimaryNode), Some("none"), self.name())?
            }
            Some(_) => false,
        };
        if won {
            info!("contending for primary: won the pointer");
        }
        Ok(())
    }

    /// React to a primary pointer change: contend, take over, or
    /// relinquish. Runs on the worker pool in production; exposed for the
    /// cluster scenario tests.
    pub fn on_primary_changed(self: &Arc<Self>, value: Option<&str>) -> Result<(), Error> {
        if !self.config.is_coordinator() {
            return Ok(());
        }
        let current = self.router_state();
        match value {
            None | Some("none") => {
                if current != RouterState::Primary && current != RouterState::Takeover {
                    self.contend_for_primary(value)?;
                }
            }
            Some(name) if name == self.name() => {
                if current != RouterState::Primary && current != RouterState::Takeover {
                    self.handle.write(&[(
                        Key::Node(self.name(), NodeKey::RouterState),
                        RouterState::Takeover.as_str().to_owned(),
                    )])?;
                }
            }
            Some(_) => {
                if current == RouterState::Primary || current == RouterState::Takeover {
                    self.handle.write(&[(
                        Key::Node(self.name(), NodeKey::RouterState),
                        RouterState::Relinquish.as_str().to_owned(),
                    )])?;
                }
            }
        }
        Ok(())
    }

    /// Whether no other live coordinator still holds (or is releasing)
    /// the primary role. Bring-up must not start before this is true.
    pub fn previous_primary_released(&self) -> bool {
        for coordinator in &self.fence_params.coordinators {
            if coordinator == self.name() {
                continue;
            }
            let router = self
                .handle
                .read(Key::Node(coordinator, NodeKey::RouterState))
                .ok()
                .flatten()
                .unwrap_or_default();
            let daemon = self
                .handle
                .read(Key::Node(coordinator, NodeKey::DaemonState))
                .ok()
                .flatten()
                .unwrap_or_default();
            let holding = router == RouterState::Primary.as_str()
                || router == RouterState::Relinquish.as_str();
            let alive = daemon == DaemonState::Run.as_str();
            if holding && alive {
                return false;
            }
        }
        true
    }

    /// Block until the previous primary has let go (or died).
    fn wait_for_previous_primary(&self) {
        for _ in 0..120 {
            if self.previous_primary_released() {
                return;
            }
            std::thread::sleep(Duration::from_millis(500));
        }
        warn!("previous primary did not release in time; proceeding with takeover");
    }

    /// Ordered primary bring-up; floating IPs come up last.
    fn become_primary(self: &Arc<Self>) {
        info!("setting node to primary state");
        self.set_router_state(RouterState::Takeover);
        self.wait_for_previous_primary();

        let result = (|| -> Result<(), Error> {
            self.dns.start()?;

            let networks: Vec<Arc<NetworkInstance>> =
                self.networks.lock().unwrap().values().cloned().collect();
            for network in &networks {
                network.become_primary()?;
                if let Some((domain, gateway)) = network.aggregated_domain() {
                    self.dns.add_network(&domain, gateway)?;
                }
            }

            // the floating addresses are the user-visible signal that the
            // primary is live, so they come up only once everything else is
            for network in [
                &self.config.cluster_network,
                &self.config.storage_network,
                &self.config.upstream_network,
            ] {
                ip::bind_address(&network.floating, &network.device)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                if let Err(err) = self.handle.write(&[(
                    Key::Node(self.name(), NodeKey::RouterState),
                    RouterState::Primary.as_str().to_owned(),
                )]) {
                    warn!("failed to record primary state: {err}");
                }
                self.set_router_state(RouterState::Primary);
                info!("node is now primary");
            }
            Err(err) => {
                warn!("primary bring-up failed, retrying: {err:#}");
                let _ = generate_fault(
                    &self.handle,
                    &format!("PRIMARY_TAKEOVER_{}", self.name()),
                    10,
                    &format!("Primary takeover failed on {}", self.name()),
                    Some(&format!("{err:#}")),
                );
                self.become_secondary();
                // retry through the pointer watch
                std::thread::sleep(Duration::from_secs(1));
                let _ = self.handle.write(&[(
                    Key::Base(BaseKey::PrimaryNode),
                    RouterState::None.as_str().to_owned(),
                )]);
            }
        }
    }

    /// Ordered primary teardown; floating IPs go first.
    fn become_secondary(self: &Arc<Self>) {
        info!("setting node to secondary state");
        self.set_router_state(RouterState::Relinquish);

        for network in [
            &self.config.cluster_network,
            &self.config.storage_network,
            &self.config.upstream_network,
        ] {
            let _ = ip::unbind_address(&network.floating, &network.device);
        }

        let networks: Vec<Arc<NetworkInstance>> =
            self.networks.lock().unwrap().values().cloned().collect();
        for network in &networks {
            if let Err(err) = network.become_secondary() {
                warn!(vni = network.vni(), "network secondary teardown failed: {err:#}");
            }
        }

        self.dns.stop();

        if let Err(err) = self.handle.write(&[(
            Key::Node(self.name(), NodeKey::RouterState),
            RouterState::Secondary.as_str().to_owned(),
        )]) {
            warn!("failed to record secondary state: {err}");
        }
        self.set_router_state(RouterState::Secondary);
        info!("node is now secondary");
    }

    /// UUIDs of domains whose `node` key names this node.
    fn owned_domains(&self) -> Result<Vec<String>, Error> {
        let mut owned = Vec::new();
        for uuid in self.handle.children(Key::Base(BaseKey::Domain))? {
            let node = self
                .handle
                .read(Key::Domain(&uuid, DomainKey::Node))?
                .unwrap_or_default();
            if node == self.name() {
                owned.push(uuid);
            }
        }
        Ok(owned)
    }

    /// Migrate every running VM away, then mark this node flushed.
    fn flush_node(&self) -> Result<(), Error> {
        info!("flushing all VMs from this node");
        for uuid in self.owned_domains()? {
            let state = self
                .handle
                .read(Key::Domain(&uuid, DomainKey::State))?
                .unwrap_or_default();
            if state != VmState::Start.as_str() {
                continue;
            }
            let target = pvc_scheduler::find_target(
                &self.handle,
                &self.fence_params.migration_target_selector,
                &uuid,
            )?;
            match target {
                Some(target) => {
                    info!(%uuid, target = %target, "flushing VM");
                    self.handle.write(&[
                        (
                            Key::Domain(&uuid, DomainKey::State),
                            VmState::Migrate.as_str().to_owned(),
                        ),
                        (Key::Domain(&uuid, DomainKey::Node), target),
                        (
                            Key::Domain(&uuid, DomainKey::LastNode),
                            self.name().to_owned(),
                        ),
                    ])?;
                }
                None => {
                    warn!(%uuid, "no target node for VM during flush");
                    generate_fault(
                        &self.handle,
                        &format!("FLUSH_NO_TARGET_{uuid}"),
                        10,
                        &format!("No migration target for VM {uuid} during flush of {}", self.name()),
                        None,
                    )?;
                }
            }
        }
        self.handle.write(&[(
            Key::Node(self.name(), NodeKey::DomainState),
            DomainState::Flushed.as_str().to_owned(),
        )])?;
        Ok(())
    }

    /// Pull previously flushed VMs back and mark this node ready.
    fn unflush_node(&self) -> Result<(), Error> {
        info!("returning flushed VMs to this node");
        for uuid in self.handle.children(Key::Base(BaseKey::Domain))? {
            let last_node = self
                .handle
                .read(Key::Domain(&uuid, DomainKey::LastNode))?
                .unwrap_or_default();
            if last_node != self.name() {
                continue;
            }
            self.handle.write(&[(
                Key::Domain(&uuid, DomainKey::State),
                VmState::Unmigrate.as_str().to_owned(),
            )])?;
        }

        self.handle.write(&[(
            Key::Node(self.name(), NodeKey::DomainState),
            DomainState::Ready.as_str().to_owned(),
        )])?;

        // honor autostart for VMs parked here while the node was flushed
        for uuid in self.owned_domains()? {
            let fields = self.handle.read_many(&[
                Key::Domain(&uuid, DomainKey::MetaAutostart),
                Key::Domain(&uuid, DomainKey::State),
            ])?;
            if fields[0].as_deref() == Some("True")
                && fields[1].as_deref() == Some(VmState::Stop.as_str())
            {
                info!(%uuid, "autostarting VM");
                self.handle.write(&[
                    (
                        Key::Domain(&uuid, DomainKey::State),
                        VmState::Start.as_str().to_owned(),
                    ),
                    (
                        Key::Domain(&uuid, DomainKey::MetaAutostart),
                        "False".to_owned(),
                    ),
                ])?;
            }
        }
        Ok(())
    }

    /// Ordered daemon shutdown.
    pub fn shutdown(self: &Arc<Self>) {
        info!("shutting down node daemon");
        let _ = self.handle.write(&[(
            Key::Node(self.name(), NodeKey::DaemonState),
            DaemonState::Shutdown.as_str().to_owned(),
        )]);

        if self.router_state() == RouterState::Primary {
            self.become_secondary();
            let _ = self.handle.check_and_set(
                Key::Base(BaseKey::PrimaryNode),
                Some(self.name()),
                RouterState::None.as_str(),
            );
        }

        self.stop.store(true, Ordering::Release);
        if let Some(monitoring) = self.monitoring() {
            monitoring.shutdown();
        }
        self.pool.join();

        let _ = self.handle.write(&[(
            Key::Node(self.name(), NodeKey::DaemonState),
            DaemonState::Stop.as_str().to_owned(),
        )]);
        info!("node daemon stopped");
    }
}
