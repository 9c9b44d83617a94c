//! AXFR transfer and zone diffing.
//!
//! Each managed network's dnsmasq instance holds its leases in memory; a
//! full zone transfer against the network gateway pulls them out. Only
//! A and AAAA records matter; dnsmasq's synthetic SOA/NS are ignored.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Error};

use pvc_common::command::run_command;

use crate::backend::StoredRecord;

const AXFR_TIMEOUT: Duration = Duration::from_secs(5);

/// One host record pulled from a zone transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AxfrRecord {
    pub name: String,
    pub ttl: u32,
    pub rtype: String,
    pub content: String,
}

impl AxfrRecord {
    fn key(&self) -> (String, String, String) {
        (self.name.clone(), self.rtype.clone(), self.content.clone())
    }
}

/// Transfer `domain` from the dnsmasq instance at `gateway`.
pub fn fetch_axfr(gateway: Ipv4Addr, domain: &str) -> Result<Vec<AxfrRecord>, Error> {
    let output = run_command(
        &format!("/usr/bin/dig +noall +answer +time=3 @{gateway} {domain} AXFR"),
        Some(AXFR_TIMEOUT),
    )?;
    if !output.success() {
        bail!(
            "AXFR of {domain} from {gateway} failed: {}",
            output.stderr.trim()
        );
    }
    Ok(parse_axfr_answer(&output.stdout))
}

/// Parse `dig +noall +answer` output lines into A/AAAA records.
pub fn parse_axfr_answer(answer: &str) -> Vec<AxfrRecord> {
    let mut records = Vec::new();
    for line in answer.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // NAME TTL IN TYPE DATA...
        if fields.len() < 5 || fields[2] != "IN" {
            continue;
        }
        let rtype = fields[3];
        if rtype != "A" && rtype != "AAAA" {
            continue;
        }
        let Ok(ttl) = fields[1].parse::<u32>() else {
            continue;
        };
        records.push(AxfrRecord {
            name: fields[0].trim_end_matches('.').to_owned(),
            ttl,
            rtype: rtype.to_owned(),
            content: fields[4..].join(" "),
        });
    }
    records
}

/// What must change to make the backend match the transfer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ZoneDiff {
    pub add: Vec<AxfrRecord>,
    pub remove_ids: Vec<i32>,
}

impl ZoneDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove_ids.is_empty()
    }
}

/// Diff the transferred records against the backend's A/AAAA rows.
///
/// A record changing its content shows up as one removal plus one add,
/// which is exactly the replace the backend needs.
pub fn diff_zone(transferred: &[AxfrRecord], stored: &[StoredRecord]) -> ZoneDiff {
    use std::collections::HashSet;

    let stored: Vec<&StoredRecord> = stored
        .iter()
        .filter(|record| record.rtype == "A" || record.rtype == "AAAA")
        .collect();

    let transferred_keys: HashSet<(String, String, String)> =
        transferred.iter().map(AxfrRecord::key).collect();
    let stored_keys: HashSet<(String, String, String)> = stored
        .iter()
        .map(|record| (record.name.clone(), record.rtype.clone(), record.content.clone()))
        .collect();

    let add = transferred
        .iter()
        .filter(|record| !stored_keys.contains(&record.key()))
        .cloned()
        .collect();
    let remove_ids = stored
        .iter()
        .filter(|record| {
            !transferred_keys.contains(&(
                record.name.clone(),
                record.rtype.clone(),
                record.content.clone(),
            ))
        })
        .map(|record| record.id)
        .collect();

    ZoneDiff { add, remove_ids }
}

#[cfg(test)]
mod test {
    use super::*;

    fn axfr(name: &str, rtype: &str, content: &str) -> AxfrRecord {
        AxfrRecord {
            name: name.to_owned(),
            ttl: 600,
            rtype: rtype.to_owned(),
            content: content.to_owned(),
        }
    }

    fn stored(id: i32, name: &str, rtype: &str, content: &str) -> StoredRecord {
        StoredRecord {
            id,
            name: name.to_owned(),
            rtype: rtype.to_owned(),
            ttl: 600,
            content: content.to_owned(),
        }
    }

    #[test]
    fn test_parse_axfr_answer_filters_types() {
        let answer = "\
n.example.\t600\tIN\tSOA\t. . 4 1200 180 1209600 600
n.example.\t600\tIN\tNS\t.
a.n.example.\t600\tIN\tA\t10.0.0.1
b.n.example.\t600\tIN\tAAAA\t2001:db8::2
";
        let records = parse_axfr_answer(answer);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "a.n.example");
        assert_eq!(records[0].content, "10.0.0.1");
        assert_eq!(records[1].rtype, "AAAA");
    }

    #[test]
    fn test_diff_add_replace_delete() {
        let transferred = vec![
            axfr("a.n.example", "A", "10.0.0.1"),
            axfr("c.n.example", "A", "10.0.0.9"),
        ];
        let in_backend = vec![
            // unchanged content for a different name: delete
            stored(1, "b.n.example", "A", "10.0.0.2"),
            // same name, changed content: replace (delete + add)
            stored(2, "c.n.example", "A", "10.0.0.3"),
            // SOA rows are never touched
            stored(3, "n.example", "SOA", "ns root 1 2 3 4 5"),
        ];
        let diff = diff_zone(&transferred, &in_backend);
        assert_eq!(diff.add, vec![
            axfr("a.n.example", "A", "10.0.0.1"),
            axfr("c.n.example", "A", "10.0.0.9"),
        ]);
        let mut removed = diff.remove_ids.clone();
        removed.sort();
        assert_eq!(removed, vec![1, 2]);
    }

    #[test]
    fn test_diff_identical_zones_is_empty() {
        let transferred = vec![axfr("a.n.example", "A", "10.0.0.1")];
        let in_backend = vec![stored(1, "a.n.example", "A", "10.0.0.1")];
        assert!(diff_zone(&transferred, &in_backend).is_empty());
    }
}
