//! Primary-side DNS aggregation.
//!
//! PowerDNS serves every managed network's zone from a shared SQL backend;
//! an AXFR loop keeps those zones in sync with the per-network dnsmasq
//! instances.

mod aggregator;
mod axfr;
mod backend;

pub use aggregator::{reconcile_zone, AggregatorParams, DnsAggregator};
pub use axfr::{diff_zone, fetch_axfr, parse_axfr_answer, AxfrRecord, ZoneDiff};
pub use backend::{MemBackend, PostgresBackend, StoredRecord, ZoneBackend};
