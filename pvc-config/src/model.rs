//! Serde model of the configuration file.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub path: PathSection,
    pub subsystem: SubsystemSection,
    pub cluster: ClusterSection,
    pub database: DatabaseSection,
    #[serde(default)]
    pub timer: TimerSection,
    pub fencing: FencingSection,
    pub migration: MigrationSection,
    #[serde(default)]
    pub logging: LoggingSection,
    pub guest_networking: GuestNetworkingSection,
    pub ceph: CephSection,
    // consumed by the API layer; carried so the file stays one document
    #[serde(default)]
    pub api: Option<serde_yaml::Value>,
    #[serde(default)]
    pub autobackup: Option<serde_yaml::Value>,
    #[serde(default)]
    pub automirror: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathSection {
    pub plugin_directory: String,
    pub dynamic_directory: String,
    pub log_directory: String,
    pub system_configuration_directory: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubsystemSection {
    #[serde(default = "default_true")]
    pub enable_hypervisor: bool,
    #[serde(default = "default_true")]
    pub enable_networking: bool,
    #[serde(default = "default_true")]
    pub enable_storage: bool,
    #[serde(default = "default_true")]
    pub enable_worker: bool,
    #[serde(default = "default_true")]
    pub enable_api: bool,
    #[serde(default)]
    pub enable_prometheus: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    pub name: String,
    pub all_nodes: Vec<String>,
    pub coordinator_nodes: Vec<String>,
    pub networks: HashMap<String, ClusterNetwork>,
}

/// One of the three underlay networks (cluster, storage, upstream).
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterNetwork {
    pub domain: Option<String>,
    pub device: String,
    pub mtu: u32,
    pub ipv4: ClusterNetworkIpv4,
    pub node_ip_selection: NodeIpSelection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterNetworkIpv4 {
    pub network_address: String,
    pub netmask: u8,
    pub floating_address: String,
    #[serde(default)]
    pub gateway_address: Option<String>,
}

/// How a node derives its own address in an underlay network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NodeIpSelection {
    Method(NodeIpMethod),
    /// A literal host address which must lie inside the network.
    Static(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum NodeIpMethod {
    #[serde(rename = "by-id")]
    ById,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    pub zookeeper: ZookeeperSection,
    pub keydb: KeydbSection,
    pub postgres: PostgresSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZookeeperSection {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeydbSection {
    pub port: u16,
    pub hostname: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSection {
    pub port: u16,
    pub hostname: String,
    pub credentials: HashMap<String, PostgresCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresCredentials {
    pub database: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerSection {
    #[serde(default = "default_vm_shutdown_timeout")]
    pub vm_shutdown_timeout: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,
}

impl Default for TimerSection {
    fn default() -> Self {
        TimerSection {
            vm_shutdown_timeout: default_vm_shutdown_timeout(),
            keepalive_interval: default_keepalive_interval(),
            monitoring_interval: default_monitoring_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FencingSection {
    #[serde(default)]
    pub disable_on_ipmi_failure: bool,
    pub intervals: FenceIntervals,
    pub actions: FenceActions,
    pub ipmi: IpmiSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FenceIntervals {
    #[serde(default = "default_fence_intervals")]
    pub fence_intervals: u64,
    #[serde(default)]
    pub suicide_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FenceActions {
    pub successful_fence: FenceAction,
    pub failed_fence: FenceAction,
}

/// Recovery action after a fence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceAction {
    Migrate,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpmiSection {
    /// Template; `{node_id}` is substituted with this node's id.
    pub hostname: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationSection {
    pub target_selector: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub debug_logging: bool,
    #[serde(default = "default_true")]
    pub log_keepalives: bool,
    #[serde(default)]
    pub log_keepalive_cluster_details: bool,
    #[serde(default)]
    pub log_monitoring_details: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            debug_logging: false,
            log_keepalives: true,
            log_keepalive_cluster_details: false,
            log_monitoring_details: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuestNetworkingSection {
    pub bridge_device: String,
    pub bridge_mtu: u32,
    #[serde(default)]
    pub sriov_enable: bool,
    #[serde(default)]
    pub sriov_device: Vec<SriovDevice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SriovDevice {
    pub phy: String,
    pub mtu: u32,
    pub vfcount: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CephSection {
    pub ceph_config_file: String,
    pub ceph_keyring_file: String,
    pub monitor_port: u16,
    pub secret_uuid: String,
    #[serde(default)]
    pub monitor_hosts: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

fn default_vm_shutdown_timeout() -> u64 {
    180
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_monitoring_interval() -> u64 {
    15
}

fn default_fence_intervals() -> u64 {
    6
}
