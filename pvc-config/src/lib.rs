//! Daemon configuration.
//!
//! A single YAML file, named by `$PVC_CONFIG_FILE`, configures every daemon
//! in the cluster; each node resolves its own identity (node id, underlay
//! addresses, IPMI hostname) from it at startup. Configuration errors are
//! fatal: the daemon reports them and exits with status 1.

mod model;
mod resolve;

pub use model::{
    CephSection, ClusterNetwork, ClusterSection, ConfigFile, DatabaseSection, FenceAction,
    FencingSection, GuestNetworkingSection, LoggingSection, MigrationSection, NodeIpMethod,
    NodeIpSelection, PathSection, PostgresCredentials, SriovDevice, SubsystemSection,
    TimerSection,
};
pub use resolve::{Config, ResolvedNetwork};

/// Environment variable naming the configuration file.
pub const CONFIG_FILE_ENV: &str = "PVC_CONFIG_FILE";

/// Environment variable overriding the log level.
pub const LOG_ENV: &str = "PVC_LOG";
