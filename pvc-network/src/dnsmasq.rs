//! dnsmasq instances for managed networks.
//!
//! One dnsmasq child per managed network, running only on the primary. The
//! arguments and hosts file are regenerated from the store on every start,
//! so reservation changes take effect with the next takeover or restart.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tracing::info;

use pvc_common::command::OsDaemon;

use crate::definition::{DhcpReservation, NetworkDefinition};

/// Build the dnsmasq argument vector for one managed network.
pub fn dnsmasq_args(
    definition: &NetworkDefinition,
    bridge: &str,
    hosts_file: &Path,
    leases_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--keep-in-foreground".to_owned(),
        "--log-facility=-".to_owned(),
        "--bogus-priv".to_owned(),
        "--no-hosts".to_owned(),
        "--dhcp-authoritative".to_owned(),
        "--domain-needed".to_owned(),
        "--expand-hosts".to_owned(),
        format!("--interface={bridge}"),
        "--bind-interfaces".to_owned(),
        format!(
            "--dhcp-leasefile={}",
            leases_dir.join(format!("dnsmasq-{}.leases", definition.vni)).display()
        ),
        format!("--dhcp-hostsfile={}", hosts_file.display()),
    ];

    if let Some(gateway) = definition.ip4_gateway {
        args.push(format!("--listen-address={gateway}"));
    }
    if let Some(domain) = &definition.domain {
        args.push(format!("--domain={domain}"));
        args.push(format!("--local=/{domain}/"));
        args.push(format!("--auth-zone={domain}"));
    }
    for server in &definition.name_servers {
        args.push(format!("--server={server}"));
    }
    if definition.dhcp4_enabled {
        if let (Some(start), Some(end)) = (definition.dhcp4_start, definition.dhcp4_end) {
            args.push(format!("--dhcp-range={start},{end},24h"));
        }
    }
    args
}

/// Render the dhcp-hostsfile contents for the static reservations.
pub fn hosts_file_contents(reservations: &[DhcpReservation]) -> String {
    let mut contents = String::new();
    for reservation in reservations {
        contents.push_str(&format!(
            "{},{},{}\n",
            reservation.mac, reservation.ip, reservation.hostname
        ));
    }
    contents
}

/// A running dnsmasq child for one network.
pub struct DnsmasqInstance {
    daemon: OsDaemon,
    vni: String,
}

impl DnsmasqInstance {
    pub fn start(
        definition: &NetworkDefinition,
        reservations: &[DhcpReservation],
        bridge: &str,
        dynamic_dir: &Path,
        log_dir: &Path,
    ) -> Result<Self, Error> {
        let hosts_file: PathBuf = dynamic_dir.join(format!("dnsmasq-{}.hosts", definition.vni));
        std::fs::write(&hosts_file, hosts_file_contents(reservations))
            .with_context(|| format!("failed to write {}", hosts_file.display()))?;

        let args = dnsmasq_args(definition, bridge, &hosts_file, dynamic_dir);
        let logfile = log_dir.join(format!("dnsmasq-{}.log", definition.vni));
        let daemon = OsDaemon::spawn("/usr/sbin/dnsmasq", &args, Some(&logfile))?;
        info!(vni = %definition.vni, pid = daemon.pid(), "started dnsmasq instance");

        Ok(DnsmasqInstance {
            daemon,
            vni: definition.vni.clone(),
        })
    }

    pub fn stop(self) {
        info!(vni = %self.vni, "stopping dnsmasq instance");
        self.daemon.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definition::NetworkType;

    fn definition() -> NetworkDefinition {
        NetworkDefinition {
            vni: "100".to_owned(),
            net_type: NetworkType::Managed,
            domain: Some("net100.example.tld".to_owned()),
            name_servers: vec!["8.8.8.8".to_owned()],
            ip4_network: Some("10.100.0.0/24".parse().unwrap()),
            ip4_gateway: Some("10.100.0.1".parse().unwrap()),
            dhcp4_enabled: true,
            dhcp4_start: Some("10.100.0.100".parse().unwrap()),
            dhcp4_end: Some("10.100.0.199".parse().unwrap()),
        }
    }

    #[test]
    fn test_dnsmasq_args_cover_dhcp_and_domain() {
        let args = dnsmasq_args(
            &definition(),
            "vmbr100",
            Path::new("/run/pvc/dnsmasq-100.hosts"),
            Path::new("/run/pvc"),
        );
        assert!(args.contains(&"--interface=vmbr100".to_owned()));
        assert!(args.contains(&"--listen-address=10.100.0.1".to_owned()));
        assert!(args.contains(&"--domain=net100.example.tld".to_owned()));
        assert!(args.contains(&"--dhcp-range=10.100.0.100,10.100.0.199,24h".to_owned()));
        assert!(args.contains(&"--server=8.8.8.8".to_owned()));
    }

    #[test]
    fn test_no_dhcp_range_when_disabled() {
        let mut definition = definition();
        definition.dhcp4_enabled = false;
        let args = dnsmasq_args(
            &definition,
            "vmbr100",
            Path::new("/tmp/h"),
            Path::new("/tmp"),
        );
        assert!(!args.iter().any(|arg| arg.starts_with("--dhcp-range=")));
    }

    #[test]
    fn test_hosts_file_rendering() {
        let reservations = vec![DhcpReservation {
            mac: "52:54:00:aa:bb:cc".to_owned(),
            ip: "10.100.0.50".to_owned(),
            hostname: "db1".to_owned(),
        }];
        assert_eq!(
            hosts_file_contents(&reservations),
            "52:54:00:aa:bb:cc,10.100.0.50,db1\n"
        );
    }
}
