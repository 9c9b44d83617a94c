//! Local system information for keepalives and node registration.

use std::collections::BTreeMap;

use anyhow::{Context, Error};

/// 1-minute load average.
pub fn load_average() -> Result<f64, Error> {
    let mut loads = [0f64; 3];
    let written = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if written < 1 {
        anyhow::bail!("getloadavg failed");
    }
    Ok(loads[0])
}

/// Online CPU count.
pub fn cpu_count() -> u32 {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count > 0 {
        count as u32
    } else {
        1
    }
}

/// Static node data in its stored form: `cpu_count kernel os arch`.
pub fn static_data() -> Result<String, Error> {
    let uts = nix::sys::utsname::uname().context("uname failed")?;
    Ok(format!(
        "{} {} {} {}",
        cpu_count(),
        uts.release().to_string_lossy(),
        uts.sysname().to_string_lossy(),
        uts.machine().to_string_lossy(),
    ))
}

const IFACE_COUNTERS: &[&str] = &[
    "rx_bytes",
    "rx_packets",
    "rx_errors",
    "rx_dropped",
    "tx_bytes",
    "tx_packets",
    "tx_errors",
    "tx_dropped",
];

/// Per-interface traffic counters from sysfs, as the JSON published under
/// `node.network.stats`.
pub fn network_stats() -> Result<serde_json::Value, Error> {
    let mut interfaces: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    let entries = match std::fs::read_dir("/sys/class/net") {
        Ok(entries) => entries,
        // containers and tests may not expose sysfs
        Err(_) => return Ok(serde_json::json!({})),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let mut counters = BTreeMap::new();
        for counter in IFACE_COUNTERS {
            let path = entry.path().join("statistics").join(counter);
            let value = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(0);
            counters.insert((*counter).to_owned(), value);
        }
        interfaces.insert(name, counters);
    }
    Ok(serde_json::to_value(interfaces)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_load_average_is_nonnegative() {
        assert!(load_average().unwrap() >= 0.0);
    }

    #[test]
    fn test_static_data_has_four_fields() {
        let data = static_data().unwrap();
        assert_eq!(data.split_whitespace().count(), 4);
    }

    #[test]
    fn test_cpu_count_positive() {
        assert!(cpu_count() >= 1);
    }
}
