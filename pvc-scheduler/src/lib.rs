//! Migration target selection.
//!
//! Given a VM and a policy, pick the live node best suited to receive it.
//! Candidates are nodes in daemon state `run` and domain state `ready`,
//! excluding the VM's current node and anything outside its node limit.
//! Ties break to the lexicographically first node name.

use std::str::FromStr;

use anyhow::Error;
use tracing::debug;

use pvc_common::{DaemonState, DomainState};
use pvc_store::{BaseKey, DomainKey, Handle, Key, NodeKey};

/// Scoring policy for target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorPolicy {
    /// Most free provisioned memory headroom (total - provisioned).
    Mem,
    /// Lowest 1-minute load average.
    Load,
    /// Fewest allocated vCPUs.
    Vcpus,
    /// Fewest provisioned domains.
    Vms,
}

impl SelectorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorPolicy::Mem => "mem",
            SelectorPolicy::Load => "load",
            SelectorPolicy::Vcpus => "vcpus",
            SelectorPolicy::Vms => "vms",
        }
    }
}

impl FromStr for SelectorPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mem" => Ok(SelectorPolicy::Mem),
            "load" => Ok(SelectorPolicy::Load),
            "vcpus" => Ok(SelectorPolicy::Vcpus),
            "vms" => Ok(SelectorPolicy::Vms),
            other => Err(format!("invalid target selector '{other}'")),
        }
    }
}

/// Resource snapshot of one candidate node.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub memory_total: u64,
    pub memory_provisioned: u64,
    pub cpu_load: f64,
    pub vcpu_allocated: u64,
    pub domains_count: u64,
}

/// Pick the best candidate under `policy`.
///
/// Candidates are evaluated in name order and only a strictly better score
/// replaces the incumbent, which yields the lexicographic tie-break.
pub fn select<'a>(policy: SelectorPolicy, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut best: Option<(&Candidate, f64)> = None;
    for candidate in sorted {
        // higher score is better for every policy
        let score = match policy {
            SelectorPolicy::Mem => {
                candidate.memory_total as f64 - candidate.memory_provisioned as f64
            }
            SelectorPolicy::Load => -candidate.cpu_load,
            SelectorPolicy::Vcpus => -(candidate.vcpu_allocated as f64),
            SelectorPolicy::Vms => -(candidate.domains_count as f64),
        };
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// Find a destination node for `uuid`, or `None` if no node qualifies.
///
/// Reads the VM's node limit and selector from the store, writing defaults
/// back when absent so the next lookup is cheap.
pub fn find_target(
    handle: &Handle,
    default_selector: &str,
    uuid: &str,
) -> Result<Option<String>, Error> {
    let node_limit: Vec<String> = match handle.read(Key::Domain(uuid, DomainKey::MetaNodeLimit))? {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_owned)
            .collect(),
        None => {
            handle.write(&[(Key::Domain(uuid, DomainKey::MetaNodeLimit), String::new())])?;
            Vec::new()
        }
    };

    let selector_raw = handle.read(Key::Domain(uuid, DomainKey::MetaNodeSelector))?;
    let selector_raw = match selector_raw.as_deref() {
        Some("") | Some("None") | None => {
            handle.write(&[(
                Key::Domain(uuid, DomainKey::MetaNodeSelector),
                default_selector.to_owned(),
            )])?;
            default_selector.to_owned()
        }
        Some(raw) => raw.to_owned(),
    };
    let policy: SelectorPolicy = selector_raw
        .parse()
        .or_else(|_| default_selector.parse())
        .map_err(Error::msg)?;

    let current_node = handle
        .read(Key::Domain(uuid, DomainKey::Node))?
        .unwrap_or_default();

    let candidates = gather_candidates(handle, &node_limit, &current_node)?;
    debug!(
        uuid,
        policy = policy.as_str(),
        candidates = candidates.len(),
        "selecting migration target"
    );

    Ok(select(policy, &candidates).map(|candidate| candidate.name.clone()))
}

fn gather_candidates(
    handle: &Handle,
    node_limit: &[String],
    current_node: &str,
) -> Result<Vec<Candidate>, Error> {
    let mut candidates = Vec::new();
    for node in handle.children(Key::Base(BaseKey::Node))? {
        if node == current_node {
            continue;
        }
        if !node_limit.is_empty() && !node_limit.iter().any(|n| n == &node) {
            continue;
        }

        let fields = handle.read_many(&[
            Key::Node(&node, NodeKey::DaemonState),
            Key::Node(&node, NodeKey::DomainState),
            Key::Node(&node, NodeKey::MemoryTotal),
            Key::Node(&node, NodeKey::MemoryProvisioned),
            Key::Node(&node, NodeKey::CpuLoad),
            Key::Node(&node, NodeKey::VcpuAllocated),
            Key::Node(&node, NodeKey::DomainsCount),
        ])?;

        let daemon_state = fields[0]
            .as_deref()
            .and_then(|raw| raw.parse::<DaemonState>().ok());
        let domain_state = fields[1]
            .as_deref()
            .and_then(|raw| raw.parse::<DomainState>().ok());
        if daemon_state != Some(DaemonState::Run) || domain_state != Some(DomainState::Ready) {
            continue;
        }

        candidates.push(Candidate {
            name: node,
            memory_total: parse_or_zero(&fields[2]),
            memory_provisioned: parse_or_zero(&fields[3]),
            cpu_load: fields[4]
                .as_deref()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0.0),
            vcpu_allocated: parse_or_zero(&fields[5]),
            domains_count: parse_or_zero(&fields[6]),
        });
    }
    Ok(candidates)
}

fn parse_or_zero(field: &Option<String>) -> u64 {
    field
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use pvc_store::MemStore;

    fn candidate(name: &str) -> Candidate {
        Candidate {
            name: name.to_owned(),
            memory_total: 32768,
            memory_provisioned: 8192,
            cpu_load: 1.0,
            vcpu_allocated: 8,
            domains_count: 4,
        }
    }

    #[test]
    fn test_load_policy_picks_least_loaded() {
        let mut a = candidate("hv1");
        a.cpu_load = 0.5;
        let mut b = candidate("hv2");
        b.cpu_load = 1.2;
        let mut c = candidate("hv3");
        c.cpu_load = 0.3;
        let candidates = [a, b, c];
        let picked = select(SelectorPolicy::Load, &candidates).unwrap();
        assert_eq!(picked.name, "hv3");
    }

    #[test]
    fn test_mem_policy_maximizes_provisioned_headroom() {
        let mut a = candidate("hv1");
        a.memory_provisioned = 16384;
        let mut b = candidate("hv2");
        b.memory_provisioned = 4096;
        let candidates = [a, b];
        let picked = select(SelectorPolicy::Mem, &candidates).unwrap();
        assert_eq!(picked.name, "hv2");
    }

    #[test]
    fn test_tie_breaks_lexicographically() {
        let candidates = vec![candidate("hv3"), candidate("hv1"), candidate("hv2")];
        let picked = select(SelectorPolicy::Vms, &candidates).unwrap();
        assert_eq!(picked.name, "hv1");
    }

    #[test]
    fn test_empty_candidate_set() {
        assert!(select(SelectorPolicy::Mem, &[]).is_none());
    }

    fn seeded_handle() -> Handle {
        let handle = Handle::new(Arc::new(MemStore::new())).unwrap();
        for (node, load) in [("hv1", "0.5"), ("hv2", "1.2"), ("hv3", "0.3")] {
            handle
                .write(&[
                    (Key::Node(node, NodeKey::DaemonState), "run".to_owned()),
                    (Key::Node(node, NodeKey::DomainState), "ready".to_owned()),
                    (Key::Node(node, NodeKey::CpuLoad), load.to_owned()),
                    (Key::Node(node, NodeKey::MemoryTotal), "32768".to_owned()),
                    (Key::Node(node, NodeKey::MemoryProvisioned), "8192".to_owned()),
                    (Key::Node(node, NodeKey::VcpuAllocated), "8".to_owned()),
                    (Key::Node(node, NodeKey::DomainsCount), "4".to_owned()),
                ])
                .unwrap();
        }
        handle
            .write(&[
                (Key::Domain("u1", DomainKey::Node), "hv9".to_owned()),
                (Key::Domain("u1", DomainKey::MetaNodeSelector), "load".to_owned()),
                (Key::Domain("u1", DomainKey::MetaNodeLimit), String::new()),
            ])
            .unwrap();
        handle
    }

    #[test]
    fn test_find_target_load_policy() {
        let handle = seeded_handle();
        let target = find_target(&handle, "mem", "u1").unwrap();
        assert_eq!(target.as_deref(), Some("hv3"));
    }

    #[test]
    fn test_find_target_respects_node_limit() {
        let handle = seeded_handle();
        handle
            .write(&[(Key::Domain("u1", DomainKey::MetaNodeLimit), "hv1,hv2".to_owned())])
            .unwrap();
        let target = find_target(&handle, "mem", "u1").unwrap();
        assert_eq!(target.as_deref(), Some("hv1"));
    }

    #[test]
    fn test_find_target_excludes_not_ready_nodes() {
        let handle = seeded_handle();
        handle
            .write(&[(Key::Node("hv3", NodeKey::DomainState), "flushed".to_owned())])
            .unwrap();
        let target = find_target(&handle, "mem", "u1").unwrap();
        assert_eq!(target.as_deref(), Some("hv1"));
    }

    #[test]
    fn test_find_target_none_when_no_candidates() {
        let handle = seeded_handle();
        for node in ["hv1", "hv2", "hv3"] {
            handle
                .write(&[(Key::Node(node, NodeKey::DaemonState), "stop".to_owned())])
                .unwrap();
        }
        assert!(find_target(&handle, "mem", "u1").unwrap().is_none());
    }

    #[test]
    fn test_find_target_writes_back_default_selector() {
        let handle = seeded_handle();
        handle.delete(Key::Domain("u1", DomainKey::MetaNodeSelector), false).unwrap();
        find_target(&handle, "vms", "u1").unwrap();
        assert_eq!(
            handle
                .read(Key::Domain("u1", DomainKey::MetaNodeSelector))
                .unwrap()
                .as_deref(),
            Some("vms")
        );
    }
}
