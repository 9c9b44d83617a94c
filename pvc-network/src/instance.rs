//! Per-network resource management.
//!
//! Every node materializes the bridge (and VXLAN for managed networks)
//! locally; the primary additionally binds the gateway and runs the DHCP
//! instance. Device mutations on one node serialize through the instance
//! mutex.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Error};
use tracing::{info, warn};

use pvc_common::command::run_command;
use pvc_common::Ipv4Cidr;
use pvc_store::Handle;

use crate::definition::{NetworkDefinition, NetworkType};
use crate::dnsmasq::DnsmasqInstance;
use crate::ip::{bind_address, unbind_address};
use crate::nftables;

/// Node-local parameters shared by all network instances.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    /// Underlay device carrying VXLAN traffic (the cluster network device).
    pub cluster_device: String,
    /// Device carrying bridged (VLAN) networks.
    pub bridge_device: String,
    pub bridge_mtu: u32,
    pub dnsmasq_dynamic_dir: PathBuf,
    pub dnsmasq_log_dir: PathBuf,
    pub nft_dir: PathBuf,
}

struct NetworkState {
    definition: NetworkDefinition,
    dnsmasq: Option<DnsmasqInstance>,
}

pub struct NetworkInstance {
    handle: Handle,
    params: NetworkParams,
    vni: String,
    state: Mutex<NetworkState>,
}

impl NetworkInstance {
    pub fn new(handle: Handle, params: NetworkParams, vni: &str) -> Result<Self, Error> {
        let definition = NetworkDefinition::read(&handle, vni)?;
        Ok(NetworkInstance {
            handle,
            params,
            vni: vni.to_owned(),
            state: Mutex::new(NetworkState {
                definition,
                dnsmasq: None,
            }),
        })
    }

    pub fn vni(&self) -> &str {
        &self.vni
    }

    fn vxlan_device(&self) -> String {
        format!("vxlan{}", self.vni)
    }

    fn vlan_device(&self) -> String {
        format!("vlan{}", self.vni)
    }

    pub fn bridge_device(&self) -> String {
        format!("vmbr{}", self.vni)
    }

    /// Re-read the definition and re-apply the firewall; called when any
    /// of the network's keys change.
    pub fn refresh(&self) -> Result<(), Error> {
        let definition = NetworkDefinition::read(&self.handle, &self.vni)?;
        let mut state = self.state.lock().unwrap();
        state.definition = definition;
        if state.definition.net_type == NetworkType::Managed {
            nftables::write_network_rules(&self.handle, &state.definition, &self.params.nft_dir)?;
            nftables::reload_firewall(&self.params.nft_dir)?;
        }
        Ok(())
    }

    /// Create the local devices for this network.
    pub fn create_network(&self) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        let bridge = self.bridge_device();
        let mtu = self.params.bridge_mtu;

        match state.definition.net_type {
            NetworkType::Managed => {
                info!(vni = %self.vni, "creating VXLAN managed network");
                let vxlan = self.vxlan_device();
                checked(&format!(
                    "ip link add {vxlan} type vxlan id {} dstport 4789 dev {} nolearning",
                    self.vni, self.params.cluster_device
                ))?;
                checked(&format!("brctl addbr {bridge}"))?;
                checked(&format!("ip link set {vxlan} mtu {mtu} up"))?;
                checked(&format!("ip link set {bridge} mtu {mtu} up"))?;
                checked(&format!("brctl addif {bridge} {vxlan}"))?;

                nftables::write_network_rules(&self.handle, &state.definition, &self.params.nft_dir)?;
                nftables::reload_firewall(&self.params.nft_dir)?;
            }
            NetworkType::Bridged => {
                info!(vni = %self.vni, "creating bridged network");
                let vlan = self.vlan_device();
                checked(&format!(
                    "ip link add link {} name {vlan} type vlan id {}",
                    self.params.bridge_device, self.vni
                ))?;
                checked(&format!("brctl addbr {bridge}"))?;
                checked(&format!("ip link set {vlan} mtu {mtu} up"))?;
                checked(&format!("ip link set {bridge} mtu {mtu} up"))?;
                checked(&format!("brctl addif {bridge} {vlan}"))?;
            }
            // VF passthrough needs no node-level devices
            NetworkType::Direct => {}
        }
        Ok(())
    }

    /// Tear the local devices down.
    pub fn remove_network(&self) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        let bridge = self.bridge_device();

        match state.definition.net_type {
            NetworkType::Managed => {
                info!(vni = %self.vni, "removing VXLAN managed network");
                let vxlan = self.vxlan_device();
                best_effort(&format!("ip link set {bridge} down"));
                best_effort(&format!("ip link set {vxlan} down"));
                best_effort(&format!("brctl delif {bridge} {vxlan}"));
                best_effort(&format!("brctl delbr {bridge}"));
                best_effort(&format!("ip link delete {vxlan}"));

                nftables::remove_network_rules(&self.vni, &self.params.nft_dir);
                if let Err(err) = nftables::reload_firewall(&self.params.nft_dir) {
                    warn!(vni = %self.vni, "firewall reload after removal failed: {err:#}");
                }
            }
            NetworkType::Bridged => {
                info!(vni = %self.vni, "removing bridged network");
                let vlan = self.vlan_device();
                best_effort(&format!("ip link set {bridge} down"));
                best_effort(&format!("ip link set {vlan} down"));
                best_effort(&format!("brctl delif {bridge} {vlan}"));
                best_effort(&format!("brctl delbr {bridge}"));
                best_effort(&format!("ip link delete {vlan}"));
            }
            NetworkType::Direct => {}
        }
        Ok(())
    }

    /// Primary-side bring-up: gateway address, then the DHCP/DNS instance.
    pub fn become_primary(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.definition.net_type != NetworkType::Managed {
            return Ok(());
        }

        if let (Some(gateway), Some(network)) =
            (state.definition.ip4_gateway, state.definition.ip4_network)
        {
            let address = Ipv4Cidr::new(gateway, network.prefix())?;
            bind_address(&address, &self.bridge_device())?;
        }

        let reservations = state.definition.reservations(&self.handle)?;
        let dnsmasq = DnsmasqInstance::start(
            &state.definition,
            &reservations,
            &self.bridge_device(),
            &self.params.dnsmasq_dynamic_dir,
            &self.params.dnsmasq_log_dir,
        )?;
        state.dnsmasq = Some(dnsmasq);
        Ok(())
    }

    /// Primary-side teardown, in reverse order of bring-up.
    pub fn become_secondary(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.definition.net_type != NetworkType::Managed {
            return Ok(());
        }

        if let Some(dnsmasq) = state.dnsmasq.take() {
            dnsmasq.stop();
        }
        if let (Some(gateway), Some(network)) =
            (state.definition.ip4_gateway, state.definition.ip4_network)
        {
            let address = Ipv4Cidr::new(gateway, network.prefix())?;
            unbind_address(&address, &self.bridge_device())?;
        }
        Ok(())
    }

    /// Whether this network participates in the DNS aggregator.
    pub fn aggregated_domain(&self) -> Option<(String, std::net::Ipv4Addr)> {
        let state = self.state.lock().unwrap();
        if state.definition.net_type != NetworkType::Managed {
            return None;
        }
        match (&state.definition.domain, state.definition.ip4_gateway) {
            (Some(domain), Some(gateway)) => Some((domain.clone(), gateway)),
            _ => None,
        }
    }
}

fn checked(command: &str) -> Result<(), Error> {
    let output = run_command(command, None)?;
    if !output.success() && !output.stderr.contains("File exists") {
        bail!("'{command}' failed: {}", output.stderr.trim());
    }
    Ok(())
}

fn best_effort(command: &str) {
    match run_command(command, None) {
        Ok(output) if !output.success() => {
            warn!("'{command}' failed: {}", output.stderr.trim());
        }
        Err(err) => warn!("'{command}' failed: {err:#}"),
        _ => {}
    }
}
