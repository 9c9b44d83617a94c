//! Monitoring plugin host and cluster fault records.
//!
//! Every node runs its plugins each monitoring tick and publishes a health
//! score; the primary additionally sweeps the cluster-wide fault
//! predicates. Fault records themselves live in [`faults`] and are shared
//! with the fencing path.

pub mod faults;
mod host;
mod plugins;

pub use host::MonitoringInstance;
pub use plugins::{PluginHost, PluginResult};
