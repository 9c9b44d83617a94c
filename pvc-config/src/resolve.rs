//! Loading, validation and per-node resolution.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, format_err, Context, Error};

use pvc_common::Ipv4Cidr;

use crate::model::{ClusterNetwork, ConfigFile, NodeIpMethod, NodeIpSelection, PostgresCredentials};
use crate::CONFIG_FILE_ENV;

/// A fully resolved underlay network for this node.
#[derive(Debug, Clone)]
pub struct ResolvedNetwork {
    pub name: String,
    pub device: String,
    pub mtu: u32,
    pub domain: Option<String>,
    /// The network itself.
    pub network: Ipv4Cidr,
    /// The cluster-wide floating address (host form, with prefix).
    pub floating: Ipv4Cidr,
    /// This node's own address (host form, with prefix).
    pub node_address: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
}

/// The loaded configuration, resolved for one node.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub node_id: u32,
    pub file: ConfigFile,
    pub cluster_network: ResolvedNetwork,
    pub storage_network: ResolvedNetwork,
    pub upstream_network: ResolvedNetwork,
    /// IPMI BMC hostname with `{node_id}` substituted.
    pub ipmi_hostname: String,
}

impl Config {
    /// Load the file named by `$PVC_CONFIG_FILE` and resolve it for the
    /// local hostname.
    pub fn load() -> Result<Config, Error> {
        let path = std::env::var(CONFIG_FILE_ENV)
            .map_err(|_| format_err!("{CONFIG_FILE_ENV} is not set"))?;
        let node_name = local_node_name()?;
        Self::load_from(Path::new(&path), &node_name)
    }

    pub fn load_from(path: &Path, node_name: &str) -> Result<Config, Error> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::parse(&raw, node_name)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }

    /// Parse and validate a configuration document for `node_name`.
    pub fn parse(yaml: &str, node_name: &str) -> Result<Config, Error> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(yaml).context("configuration is not valid YAML")?;
        if value.get("pvc").is_some() {
            bail!(
                "legacy 'pvc'-rooted configuration layout is not supported; \
                 convert to the current single-document layout"
            );
        }
        let file: ConfigFile =
            serde_yaml::from_value(value).context("configuration does not match the schema")?;

        if !file.cluster.all_nodes.iter().any(|n| n == node_name) {
            bail!("node '{node_name}' is not listed in cluster.all_nodes");
        }
        for coordinator in &file.cluster.coordinator_nodes {
            if !file.cluster.all_nodes.iter().any(|n| n == coordinator) {
                bail!("coordinator '{coordinator}' is not listed in cluster.all_nodes");
            }
        }

        let node_id = node_id_from_name(node_name)?;

        let cluster_network = resolve_network(&file, "cluster", node_id)?;
        let storage_network = resolve_network(&file, "storage", node_id)?;
        let upstream_network = resolve_network(&file, "upstream", node_id)?;

        let ipmi_hostname = file
            .fencing
            .ipmi
            .hostname
            .replace("{node_id}", &node_id.to_string());

        Ok(Config {
            node_name: node_name.to_owned(),
            node_id,
            file,
            cluster_network,
            storage_network,
            upstream_network,
            ipmi_hostname,
        })
    }

    pub fn is_coordinator(&self) -> bool {
        self.file
            .cluster
            .coordinator_nodes
            .iter()
            .any(|n| n == &self.node_name)
    }

    /// ZooKeeper connect string over all coordinators.
    pub fn zookeeper_connect_string(&self) -> String {
        let port = self.file.database.zookeeper.port;
        self.file
            .cluster
            .coordinator_nodes
            .iter()
            .map(|node| format!("{node}:{port}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Postgres credentials for the DNS aggregator backend.
    pub fn dns_credentials(&self) -> Result<&PostgresCredentials, Error> {
        self.file
            .database
            .postgres
            .credentials
            .get("dns")
            .ok_or_else(|| format_err!("no 'dns' credentials in database.postgres.credentials"))
    }

    /// Create the runtime directories the daemon writes into.
    pub fn prepare_directories(&self) -> Result<(), Error> {
        for dir in [
            self.file.path.dynamic_directory.clone(),
            format!("{}/dnsmasq", self.file.path.dynamic_directory),
            format!("{}/pdns", self.file.path.dynamic_directory),
            format!("{}/nft", self.file.path.dynamic_directory),
            self.file.path.log_directory.clone(),
            format!("{}/dnsmasq", self.file.path.log_directory),
            format!("{}/pdns", self.file.path.log_directory),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {dir}"))?;
        }
        Ok(())
    }
}

fn local_node_name() -> Result<String, Error> {
    let hostname = nix::unistd::gethostname().context("failed to read hostname")?;
    let hostname = hostname.to_string_lossy().into_owned();
    Ok(hostname
        .split('.')
        .next()
        .unwrap_or(hostname.as_str())
        .to_owned())
}

/// The node id is the trailing integer of the node name (`hv3` -> 3); it
/// drives `by-id` address selection and the IPMI hostname template.
fn node_id_from_name(node_name: &str) -> Result<u32, Error> {
    let digits: String = node_name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        bail!("node name '{node_name}' carries no trailing node id");
    }
    digits
        .parse()
        .map_err(|_| format_err!("node id in '{node_name}' is out of range"))
}

fn resolve_network(file: &ConfigFile, name: &str, node_id: u32) -> Result<ResolvedNetwork, Error> {
    let section: &ClusterNetwork = file
        .cluster
        .networks
        .get(name)
        .ok_or_else(|| format_err!("cluster.networks.{name} is missing"))?;

    let network = format!(
        "{}/{}",
        section.ipv4.network_address, section.ipv4.netmask
    )
    .parse::<Ipv4Cidr>()
    .map_err(|err| format_err!("cluster.networks.{name}: {err}"))?
    .network();

    let floating_addr: Ipv4Addr = section
        .ipv4
        .floating_address
        .split('/')
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| {
            format_err!(
                "cluster.networks.{name}: invalid floating address '{}'",
                section.ipv4.floating_address
            )
        })?;
    if !network.contains_host(floating_addr) {
        bail!("cluster.networks.{name}: floating address {floating_addr} is not a host address of {network}");
    }

    let node_addr = match &section.node_ip_selection {
        NodeIpSelection::Method(NodeIpMethod::ById) => {
            if node_id == 0 {
                bail!("cluster.networks.{name}: node id 0 cannot use by-id selection");
            }
            network.nth_host(node_id - 1).map_err(|err| {
                format_err!("cluster.networks.{name}: no by-id address for node {node_id}: {err}")
            })?
        }
        NodeIpSelection::Static(literal) => {
            let addr: Ipv4Addr = literal.parse().map_err(|_| {
                format_err!("cluster.networks.{name}: invalid static node address '{literal}'")
            })?;
            if !network.contains_host(addr) {
                bail!("cluster.networks.{name}: static node address {addr} is not a host address of {network}");
            }
            addr
        }
    };

    let gateway = match &section.ipv4.gateway_address {
        Some(raw) => {
            let addr: Ipv4Addr = raw.parse().map_err(|_| {
                format_err!("cluster.networks.{name}: invalid gateway address '{raw}'")
            })?;
            if !network.contains(addr) {
                bail!("cluster.networks.{name}: gateway {addr} is outside {network}");
            }
            Some(addr)
        }
        None => None,
    };

    Ok(ResolvedNetwork {
        name: name.to_owned(),
        device: section.device.clone(),
        mtu: section.mtu,
        domain: section.domain.clone(),
        network,
        floating: Ipv4Cidr::new(floating_addr, network.prefix())?,
        node_address: Ipv4Cidr::new(node_addr, network.prefix())?,
        gateway,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
path:
  plugin_directory: /usr/share/pvc/plugins
  dynamic_directory: /run/pvc
  log_directory: /var/log/pvc
  system_configuration_directory: /etc/pvc
subsystem:
  enable_hypervisor: true
  enable_networking: true
  enable_storage: true
cluster:
  name: cluster1
  all_nodes: [hv1, hv2, hv3]
  coordinator_nodes: [hv1, hv2, hv3]
  networks:
    cluster:
      device: vlan100
      mtu: 9000
      ipv4:
        network_address: 10.0.100.0
        netmask: 24
        floating_address: 10.0.100.254
      node_ip_selection: by-id
    storage:
      device: vlan101
      mtu: 9000
      ipv4:
        network_address: 10.0.101.0
        netmask: 24
        floating_address: 10.0.101.254
      node_ip_selection: by-id
    upstream:
      domain: example.tld
      device: vlan102
      mtu: 1500
      ipv4:
        network_address: 192.168.1.0
        netmask: 24
        floating_address: 192.168.1.10
        gateway_address: 192.168.1.1
      node_ip_selection: 192.168.1.21
database:
  zookeeper:
    port: 2181
  keydb:
    port: 6379
    hostname: 127.0.0.1
    path: /2
  postgres:
    port: 5432
    hostname: 127.0.0.1
    credentials:
      api:
        database: pvcapi
        username: pvcapi
        password: secret
      dns:
        database: pvcdns
        username: pvcdns
        password: secret
timer:
  vm_shutdown_timeout: 180
  keepalive_interval: 5
  monitoring_interval: 15
fencing:
  disable_on_ipmi_failure: false
  intervals:
    fence_intervals: 6
    suicide_interval: 0
  actions:
    successful_fence: migrate
    failed_fence: none
  ipmi:
    hostname: "hv{node_id}-lom.example.tld"
    username: admin
    password: admin
migration:
  target_selector: mem
logging:
  debug_logging: false
guest_networking:
  bridge_device: bondU
  bridge_mtu: 1500
  sriov_enable: false
ceph:
  ceph_config_file: /etc/ceph/ceph.conf
  ceph_keyring_file: /etc/ceph/ceph.client.admin.keyring
  monitor_port: 6789
  secret_uuid: 91e867a5-63f4-4a54-b47d-f6d082271a8f
"#;

    #[test]
    fn test_parse_and_resolve() {
        let config = Config::parse(SAMPLE, "hv2").unwrap();
        assert_eq!(config.node_id, 2);
        assert!(config.is_coordinator());
        // by-id: node 2 takes host 1 (10.0.100.2)
        assert_eq!(
            config.cluster_network.node_address.addr(),
            Ipv4Addr::new(10, 0, 100, 2)
        );
        // static selection
        assert_eq!(
            config.upstream_network.node_address.addr(),
            Ipv4Addr::new(192, 168, 1, 21)
        );
        assert_eq!(config.ipmi_hostname, "hv2-lom.example.tld");
        assert_eq!(
            config.zookeeper_connect_string(),
            "hv1:2181,hv2:2181,hv3:2181"
        );
        assert_eq!(config.file.timer.keepalive_interval, 5);
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        assert!(Config::parse(SAMPLE, "hv9").is_err());
    }

    #[test]
    fn test_node_without_id_is_rejected() {
        let yaml = SAMPLE.replace("hv1, hv2, hv3", "hva, hv2, hv3");
        assert!(Config::parse(&yaml, "hva").is_err());
    }

    #[test]
    fn test_legacy_layout_is_refused() {
        let err = Config::parse("pvc:\n  cluster: {}\n", "hv1").unwrap_err();
        assert!(err.to_string().contains("legacy"));
    }

    #[test]
    fn test_floating_address_must_be_host() {
        let yaml = SAMPLE.replace("floating_address: 10.0.100.254", "floating_address: 10.0.200.254");
        assert!(Config::parse(&yaml, "hv1").is_err());
    }
}
