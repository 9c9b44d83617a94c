//! Logical key to literal path translation.
//!
//! The schema is versioned; the active version is itself stored under
//! [`BaseKey::SchemaVersion`]. This module is the only place literal store
//! paths may appear.

use std::fmt;

/// Cluster-level keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKey {
    /// Root of the schema subtree.
    Schema,
    /// The active schema version.
    SchemaVersion,
    /// Root of the cluster configuration subtree.
    Config,
    /// Name of the current primary coordinator, or "none".
    PrimaryNode,
    /// Cluster-wide default migration target selector.
    MigrationTargetSelector,
    /// Parent of all node subtrees.
    Node,
    /// Parent of all domain (VM) subtrees.
    Domain,
    /// Parent of all network subtrees.
    Network,
    /// Parent of all OSD subtrees.
    Osd,
    /// Parent of all storage pool subtrees.
    Pool,
    /// Aggregate Ceph health JSON.
    StorageHealth,
    /// Parent of all fault records.
    Faults,
    /// Ceph command queue (single writer, write-locked).
    CephCommand,
}

/// Per-node keys (`base.node/<name>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKey {
    /// The node subtree itself.
    Root,
    Mode,
    DaemonState,
    RouterState,
    DomainState,
    StaticData,
    Keepalive,
    MemoryTotal,
    MemoryUsed,
    MemoryFree,
    MemoryAllocated,
    MemoryProvisioned,
    VcpuAllocated,
    CpuLoad,
    RunningDomains,
    DomainsCount,
    IpmiHostname,
    IpmiUsername,
    IpmiPassword,
    Health,
    HealthPlugins,
    /// Parent of the per-plugin monitoring data.
    MonitoringData,
    /// Parent of this node's SR-IOV VF subtrees.
    SriovVfs,
    NetworkStats,
}

/// Per-domain keys (`base.domain/<uuid>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKey {
    /// The domain subtree itself.
    Root,
    Name,
    State,
    Node,
    LastNode,
    FailedReason,
    Xml,
    /// Configured RAM in MiB, extracted from the XML at definition time.
    Memory,
    /// Configured vCPU count, extracted from the XML at definition time.
    Vcpus,
    MetaAutostart,
    MetaNodeLimit,
    MetaNodeSelector,
    MetaMigrationMethod,
    MetaProfile,
    StorageVolumes,
    /// Parent of the snapshot records.
    Snapshots,
    /// Parent of the tag records.
    Tags,
}

/// Per-snapshot keys (`base.domain/<uuid>/snapshots/<name>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKey {
    Root,
    Name,
    Timestamp,
    Xml,
    RbdSnapshots,
}

/// Per-tag keys (`base.domain/<uuid>/tags/<tag>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKey {
    Root,
    Name,
    Protected,
}

/// Per-network keys (`base.network/<vni>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKey {
    /// The network subtree itself.
    Root,
    Type,
    Domain,
    NameServers,
    Ip4Network,
    Ip4Gateway,
    Ip4DhcpFlag,
    Ip4DhcpStart,
    Ip4DhcpEnd,
    /// Parent of the static DHCP reservations.
    Ip4Reservations,
    Ip6Network,
    Ip6Gateway,
    Ip6DhcpFlag,
    /// Parent of the inbound firewall rules.
    RulesIn,
    /// Parent of the outbound firewall rules.
    RulesOut,
}

/// Per-reservation keys
/// (`base.network/<vni>/dhcp4_reservations/<id>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationKey {
    Root,
    Mac,
    Ip,
    Hostname,
}

/// Direction of a per-network firewall rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    In,
    Out,
}

/// Per-rule keys (`base.network/<vni>/firewall_rules/<dir>/<id>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKey {
    Root,
    Rule,
    Order,
}

/// Per-VF keys (`base.node/<name>/sriov/vf/<vf>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfKey {
    Root,
    Phy,
    Mac,
    Vlan,
    Qos,
    TxRateMin,
    TxRateMax,
    SpoofCheck,
    LinkState,
    Trust,
    QueryRss,
}

/// Per-OSD keys (`base.osd/<id>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsdKey {
    Root,
    Node,
    Stats,
}

/// Per-fault keys (`base.faults/<id>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKey {
    Root,
    FirstTime,
    LastTime,
    Delta,
    Message,
    Details,
    Acknowledged,
}

/// Per-plugin monitoring keys
/// (`base.node/<name>/monitoring/data/<plugin>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKey {
    Root,
    Name,
    LastRun,
    HealthDelta,
    Message,
    Data,
    Runtime,
}

/// A logical key, resolved to a literal path by [`Schema::path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key<'a> {
    Base(BaseKey),
    Node(&'a str, NodeKey),
    Domain(&'a str, DomainKey),
    Snapshot(&'a str, &'a str, SnapshotKey),
    Tag(&'a str, &'a str, TagKey),
    Network(&'a str, NetworkKey),
    Reservation(&'a str, &'a str, ReservationKey),
    FirewallRule(&'a str, RuleDirection, &'a str, RuleKey),
    SriovVf(&'a str, &'a str, VfKey),
    Osd(&'a str, OsdKey),
    Fault(&'a str, FaultKey),
    Plugin(&'a str, &'a str, PluginKey),
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A versioned path translation table.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    version: u32,
}

impl Schema {
    pub const CURRENT_VERSION: u32 = 0;

    pub fn current() -> Self {
        Schema {
            version: Self::CURRENT_VERSION,
        }
    }

    /// Load a specific schema version. Only version 0 exists today.
    pub fn version(version: u32) -> Option<Self> {
        (version == 0).then_some(Schema { version })
    }

    pub fn version_number(&self) -> u32 {
        self.version
    }

    /// Resolve a logical key to its literal path.
    pub fn path(&self, key: &Key) -> String {
        debug_assert_eq!(self.version, 0);
        v0::path(key)
    }

    /// The base paths that must exist before the daemon can operate.
    pub fn base_paths(&self) -> Vec<String> {
        use BaseKey::*;
        [
            Schema, Config, Node, Domain, Network, Osd, Pool, Faults,
        ]
        .iter()
        .map(|base| self.path(&Key::Base(*base)))
        .collect()
    }
}

mod v0 {
    use super::*;

    fn base(key: BaseKey) -> &'static str {
        match key {
            BaseKey::Schema => "/schema",
            BaseKey::SchemaVersion => "/schema/version",
            BaseKey::Config => "/config",
            BaseKey::PrimaryNode => "/config/primary_node",
            BaseKey::MigrationTargetSelector => "/config/migration_target_selector",
            BaseKey::Node => "/nodes",
            BaseKey::Domain => "/domains",
            BaseKey::Network => "/networks",
            BaseKey::Osd => "/ceph/osds",
            BaseKey::Pool => "/ceph/pools",
            BaseKey::StorageHealth => "/ceph/health",
            BaseKey::Faults => "/faults",
            BaseKey::CephCommand => "/cmd/ceph",
        }
    }

    fn node(field: NodeKey) -> &'static str {
        match field {
            NodeKey::Root => "",
            NodeKey::Mode => "/mode",
            NodeKey::DaemonState => "/daemonstate",
            NodeKey::RouterState => "/routerstate",
            NodeKey::DomainState => "/domainstate",
            NodeKey::StaticData => "/staticdata",
            NodeKey::Keepalive => "/keepalive",
            NodeKey::MemoryTotal => "/memtotal",
            NodeKey::MemoryUsed => "/memused",
            NodeKey::MemoryFree => "/memfree",
            NodeKey::MemoryAllocated => "/memalloc",
            NodeKey::MemoryProvisioned => "/memprov",
            NodeKey::VcpuAllocated => "/vcpualloc",
            NodeKey::CpuLoad => "/cpuload",
            NodeKey::RunningDomains => "/runningdomains",
            NodeKey::DomainsCount => "/domainscount",
            NodeKey::IpmiHostname => "/ipmihostname",
            NodeKey::IpmiUsername => "/ipmiusername",
            NodeKey::IpmiPassword => "/ipmipassword",
            NodeKey::Health => "/monitoring/health",
            NodeKey::HealthPlugins => "/monitoring/plugins",
            NodeKey::MonitoringData => "/monitoring/data",
            NodeKey::SriovVfs => "/sriov/vf",
            NodeKey::NetworkStats => "/networkstats",
        }
    }

    fn domain(field: DomainKey) -> &'static str {
        match field {
            DomainKey::Root => "",
            DomainKey::Name => "/name",
            DomainKey::State => "/state",
            DomainKey::Node => "/node",
            DomainKey::LastNode => "/lastnode",
            DomainKey::FailedReason => "/failedreason",
            DomainKey::Xml => "/xml",
            DomainKey::Memory => "/memory",
            DomainKey::Vcpus => "/vcpus",
            DomainKey::MetaAutostart => "/node_autostart",
            DomainKey::MetaNodeLimit => "/node_limit",
            DomainKey::MetaNodeSelector => "/node_selector",
            DomainKey::MetaMigrationMethod => "/migration_method",
            DomainKey::MetaProfile => "/profile",
            DomainKey::StorageVolumes => "/rbdlist",
            DomainKey::Snapshots => "/snapshots",
            DomainKey::Tags => "/tags",
        }
    }

    fn snapshot(field: SnapshotKey) -> &'static str {
        match field {
            SnapshotKey::Root => "",
            SnapshotKey::Name => "/name",
            SnapshotKey::Timestamp => "/timestamp",
            SnapshotKey::Xml => "/xml",
            SnapshotKey::RbdSnapshots => "/rbdsnapshots",
        }
    }

    fn tag(field: TagKey) -> &'static str {
        match field {
            TagKey::Root => "",
            TagKey::Name => "/name",
            TagKey::Protected => "/protected",
        }
    }

    fn network(field: NetworkKey) -> &'static str {
        match field {
            NetworkKey::Root => "",
            NetworkKey::Type => "/nettype",
            NetworkKey::Domain => "/domain",
            NetworkKey::NameServers => "/name_servers",
            NetworkKey::Ip4Network => "/ip4_network",
            NetworkKey::Ip4Gateway => "/ip4_gateway",
            NetworkKey::Ip4DhcpFlag => "/dhcp4_flag",
            NetworkKey::Ip4DhcpStart => "/dhcp4_start",
            NetworkKey::Ip4DhcpEnd => "/dhcp4_end",
            NetworkKey::Ip4Reservations => "/dhcp4_reservations",
            NetworkKey::Ip6Network => "/ip6_network",
            NetworkKey::Ip6Gateway => "/ip6_gateway",
            NetworkKey::Ip6DhcpFlag => "/dhcp6_flag",
            NetworkKey::RulesIn => "/firewall_rules/in",
            NetworkKey::RulesOut => "/firewall_rules/out",
        }
    }

    fn reservation(field: ReservationKey) -> &'static str {
        match field {
            ReservationKey::Root => "",
            ReservationKey::Mac => "/macaddr",
            ReservationKey::Ip => "/ipaddr",
            ReservationKey::Hostname => "/hostname",
        }
    }

    fn rule(field: RuleKey) -> &'static str {
        match field {
            RuleKey::Root => "",
            RuleKey::Rule => "/rule",
            RuleKey::Order => "/order",
        }
    }

    fn vf(field: VfKey) -> &'static str {
        match field {
            VfKey::Root => "",
            VfKey::Phy => "/phy",
            VfKey::Mac => "/config/mac",
            VfKey::Vlan => "/config/vlan_id",
            VfKey::Qos => "/config/vlan_qos",
            VfKey::TxRateMin => "/config/tx_rate_min",
            VfKey::TxRateMax => "/config/tx_rate_max",
            VfKey::SpoofCheck => "/config/spoof_check",
            VfKey::LinkState => "/config/link_state",
            VfKey::Trust => "/config/trust",
            VfKey::QueryRss => "/config/query_rss",
        }
    }

    fn osd(field: OsdKey) -> &'static str {
        match field {
            OsdKey::Root => "",
            OsdKey::Node => "/node",
            OsdKey::Stats => "/stats",
        }
    }

    fn fault(field: FaultKey) -> &'static str {
        match field {
            FaultKey::Root => "",
            FaultKey::FirstTime => "/first_reported",
            FaultKey::LastTime => "/last_reported",
            FaultKey::Delta => "/health_delta",
            FaultKey::Message => "/message",
            FaultKey::Details => "/details",
            FaultKey::Acknowledged => "/ack",
        }
    }

    fn plugin(field: PluginKey) -> &'static str {
        match field {
            PluginKey::Root => "",
            PluginKey::Name => "/name",
            PluginKey::LastRun => "/last_run",
            PluginKey::HealthDelta => "/health_delta",
            PluginKey::Message => "/message",
            PluginKey::Data => "/data",
            PluginKey::Runtime => "/runtime",
        }
    }

    pub(super) fn path(key: &Key) -> String {
        match key {
            Key::Base(b) => base(*b).to_owned(),
            Key::Node(name, field) => {
                format!("{}/{}{}", base(BaseKey::Node), name, node(*field))
            }
            Key::Domain(uuid, field) => {
                format!("{}/{}{}", base(BaseKey::Domain), uuid, domain(*field))
            }
            Key::Snapshot(uuid, snap, field) => format!(
                "{}/{}{}/{}{}",
                base(BaseKey::Domain),
                uuid,
                domain(DomainKey::Snapshots),
                snap,
                snapshot(*field)
            ),
            Key::Tag(uuid, name, field) => format!(
                "{}/{}{}/{}{}",
                base(BaseKey::Domain),
                uuid,
                domain(DomainKey::Tags),
                name,
                tag(*field)
            ),
            Key::Network(vni, field) => {
                format!("{}/{}{}", base(BaseKey::Network), vni, network(*field))
            }
            Key::Reservation(vni, id, field) => format!(
                "{}/{}{}/{}{}",
                base(BaseKey::Network),
                vni,
                network(NetworkKey::Ip4Reservations),
                id,
                reservation(*field)
            ),
            Key::FirewallRule(vni, direction, id, field) => {
                let chain = match direction {
                    RuleDirection::In => network(NetworkKey::RulesIn),
                    RuleDirection::Out => network(NetworkKey::RulesOut),
                };
                format!(
                    "{}/{}{}/{}{}",
                    base(BaseKey::Network),
                    vni,
                    chain,
                    id,
                    rule(*field)
                )
            }
            Key::SriovVf(node_name, vf_name, field) => format!(
                "{}/{}/sriov/vf/{}{}",
                base(BaseKey::Node),
                node_name,
                vf_name,
                vf(*field)
            ),
            Key::Osd(id, field) => {
                format!("{}/{}{}", base(BaseKey::Osd), id, osd(*field))
            }
            Key::Fault(id, field) => {
                format!("{}/{}{}", base(BaseKey::Faults), id, fault(*field))
            }
            Key::Plugin(node_name, plugin_name, field) => format!(
                "{}/{}{}/{}{}",
                base(BaseKey::Node),
                node_name,
                node(NodeKey::MonitoringData),
                plugin_name,
                plugin(*field)
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_v0_paths() {
        let schema = Schema::current();
        assert_eq!(schema.path(&Key::Base(BaseKey::PrimaryNode)), "/config/primary_node");
        assert_eq!(
            schema.path(&Key::Node("hv1", NodeKey::DaemonState)),
            "/nodes/hv1/daemonstate"
        );
        assert_eq!(
            schema.path(&Key::Domain("uuid-1", DomainKey::State)),
            "/domains/uuid-1/state"
        );
        assert_eq!(
            schema.path(&Key::Snapshot("uuid-1", "snap1", SnapshotKey::RbdSnapshots)),
            "/domains/uuid-1/snapshots/snap1/rbdsnapshots"
        );
        assert_eq!(
            schema.path(&Key::Plugin("hv1", "disk", PluginKey::HealthDelta)),
            "/nodes/hv1/monitoring/data/disk/health_delta"
        );
        assert_eq!(
            schema.path(&Key::Network("100", NetworkKey::RulesIn)),
            "/networks/100/firewall_rules/in"
        );
    }

    #[test]
    fn test_only_version_zero_exists() {
        assert!(Schema::version(0).is_some());
        assert!(Schema::version(1).is_none());
    }

    #[test]
    fn test_node_root_is_subtree() {
        let schema = Schema::current();
        assert_eq!(schema.path(&Key::Node("hv1", NodeKey::Root)), "/nodes/hv1");
    }
}
