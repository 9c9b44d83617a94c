//! The DNS aggregator, active only while this node is primary.
//!
//! A PowerDNS child serves the aggregated zones from the shared SQL
//! backend; a background loop transfers each managed network's dnsmasq
//! zone every 10 seconds and reconciles the backend against it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Error;
use tracing::{info, warn};

use pvc_common::command::{run_command, OsDaemon};

use crate::axfr::{diff_zone, fetch_axfr, AxfrRecord};
use crate::backend::ZoneBackend;

/// Reconciliation cadence.
const AXFR_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period before the first transfer, letting dnsmasq instances come
/// up after a takeover.
const STARTUP_HOLD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AggregatorParams {
    pub cluster_floating_ip: Ipv4Addr,
    pub upstream_floating_ip: Ipv4Addr,
    pub pdns_dynamic_dir: PathBuf,
    pub pdns_log_dir: PathBuf,
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_dbname: String,
    pub postgres_user: String,
    pub postgres_password: String,
    /// Parent domain used for the seeded SOA/NS names.
    pub upstream_domain: String,
}

impl AggregatorParams {
    fn soa_content(&self) -> String {
        format!(
            "nsX.{d} root.{d} 1 10800 1800 86400 86400",
            d = self.upstream_domain
        )
    }

    fn default_name_servers(&self) -> Vec<String> {
        vec![format!("pvc-dns.{}", self.upstream_domain)]
    }

    fn pdns_args(&self) -> Vec<String> {
        vec![
            "--no-config".to_owned(),
            "--daemon=no".to_owned(),
            "--guardian=yes".to_owned(),
            "--disable-syslog=yes".to_owned(),
            "--disable-axfr=no".to_owned(),
            "--allow-axfr-ips=0.0.0.0/0".to_owned(),
            format!(
                "--local-address={},{}",
                self.cluster_floating_ip, self.upstream_floating_ip
            ),
            "--local-port=53".to_owned(),
            "--log-dns-details=on".to_owned(),
            "--loglevel=3".to_owned(),
            "--master=yes".to_owned(),
            "--slave=yes".to_owned(),
            "--slave-renotify=yes".to_owned(),
            "--version-string=powerdns".to_owned(),
            "--default-soa-name=dns.pvc.local".to_owned(),
            format!("--socket-dir={}", self.pdns_dynamic_dir.display()),
            "--launch=gpgsql".to_owned(),
            format!("--gpgsql-host={}", self.postgres_host),
            format!("--gpgsql-port={}", self.postgres_port),
            format!("--gpgsql-dbname={}", self.postgres_dbname),
            format!("--gpgsql-user={}", self.postgres_user),
            format!("--gpgsql-password={}", self.postgres_password),
            "--gpgsql-dnssec=no".to_owned(),
        ]
    }
}

type BackendFactory = dyn Fn() -> Result<Box<dyn ZoneBackend>, Error> + Send + Sync;

pub struct DnsAggregator {
    params: AggregatorParams,
    backend_factory: Arc<BackendFactory>,
    networks: Arc<Mutex<HashMap<String, Ipv4Addr>>>,
    pdns: Mutex<Option<OsDaemon>>,
    stopper: Arc<AtomicBool>,
    axfr_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DnsAggregator {
    pub fn new(params: AggregatorParams) -> Self {
        let factory_params = params.clone();
        Self::with_backend(
            params,
            Arc::new(move || {
                let backend = crate::backend::PostgresBackend::connect(
                    &factory_params.postgres_host,
                    factory_params.postgres_port,
                    &factory_params.postgres_dbname,
                    &factory_params.postgres_user,
                    &factory_params.postgres_password,
                )?;
                Ok(Box::new(backend) as Box<dyn ZoneBackend>)
            }),
        )
    }

    pub fn with_backend(params: AggregatorParams, backend_factory: Arc<BackendFactory>) -> Self {
        DnsAggregator {
            params,
            backend_factory,
            networks: Arc::new(Mutex::new(HashMap::new())),
            pdns: Mutex::new(None),
            stopper: Arc::new(AtomicBool::new(false)),
            axfr_thread: Mutex::new(None),
        }
    }

    /// Start the PowerDNS child and the AXFR loop.
    pub fn start(&self) -> Result<(), Error> {
        info!("starting PowerDNS zone aggregator");
        let logfile = self.params.pdns_log_dir.join("pdns-aggregator.log");
        let daemon = OsDaemon::spawn(
            "/usr/sbin/pdns_server",
            &self.params.pdns_args(),
            Some(&logfile),
        )?;
        *self.pdns.lock().unwrap() = Some(daemon);

        self.stopper.store(false, Ordering::Release);
        let stopper = Arc::clone(&self.stopper);
        let networks = Arc::clone(&self.networks);
        let backend_factory = Arc::clone(&self.backend_factory);
        let socket_dir = self.params.pdns_dynamic_dir.clone();
        let thread = std::thread::Builder::new()
            .name("dns-axfr".to_owned())
            .spawn(move || {
                axfr_loop(stopper, networks, backend_factory, socket_dir);
            })?;
        *self.axfr_thread.lock().unwrap() = Some(thread);

        info!("successfully started PowerDNS zone aggregator");
        Ok(())
    }

    /// Stop the AXFR loop and the PowerDNS child.
    pub fn stop(&self) {
        self.stopper.store(true, Ordering::Release);
        if let Some(thread) = self.axfr_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        if let Some(daemon) = self.pdns.lock().unwrap().take() {
            info!("stopping PowerDNS zone aggregator");
            daemon.stop();
        }
    }

    /// Register a managed network's zone and seed it in the backend.
    pub fn add_network(&self, domain: &str, gateway: Ipv4Addr) -> Result<(), Error> {
        info!(domain, "adding entry for client domain");
        let mut backend = (self.backend_factory)()?;
        backend.ensure_domain(
            domain,
            &self.params.soa_content(),
            &self.params.default_name_servers(),
        )?;
        self.networks
            .lock()
            .unwrap()
            .insert(domain.to_owned(), gateway);
        Ok(())
    }

    /// Deregister a network's zone and drop it from the backend.
    pub fn remove_network(&self, domain: &str) -> Result<(), Error> {
        info!(domain, "removing entry for client domain");
        self.networks.lock().unwrap().remove(domain);
        let mut backend = (self.backend_factory)()?;
        backend.remove_domain(domain)?;
        Ok(())
    }
}

fn axfr_loop(
    stopper: Arc<AtomicBool>,
    networks: Arc<Mutex<HashMap<String, Ipv4Addr>>>,
    backend_factory: Arc<BackendFactory>,
    socket_dir: PathBuf,
) {
    std::thread::sleep(STARTUP_HOLD);

    // one connection for the life of the loop; reconnect on failure
    let mut backend: Option<Box<dyn ZoneBackend>> = None;

    while !stopper.load(Ordering::Acquire) {
        let snapshot: Vec<(String, Ipv4Addr)> = networks
            .lock()
            .unwrap()
            .iter()
            .map(|(domain, gateway)| (domain.clone(), *gateway))
            .collect();

        for (domain, gateway) in snapshot {
            if stopper.load(Ordering::Acquire) {
                return;
            }

            let transferred = match fetch_axfr(gateway, &domain) {
                Ok(transferred) => transferred,
                Err(err) => {
                    // dnsmasq may simply not be up yet; skip this network
                    warn!(%domain, "zone transfer failed: {err:#}");
                    continue;
                }
            };

            if backend.is_none() {
                match backend_factory() {
                    Ok(fresh) => backend = Some(fresh),
                    Err(err) => {
                        warn!("backend connection failed, retrying next tick: {err:#}");
                        break;
                    }
                }
            }
            let Some(active) = backend.as_mut() else { break };

            match reconcile_zone(active.as_mut(), &domain, &transferred) {
                Ok(true) => {
                    let output = run_command(
                        &format!(
                            "/usr/bin/pdns_control --socket-dir={} reload {domain}",
                            socket_dir.display()
                        ),
                        None,
                    );
                    if let Ok(output) = output {
                        if !output.success() {
                            warn!(%domain, "pdns_control reload failed");
                        }
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(%domain, "zone reconciliation failed: {err:#}");
                    // drop the connection; it is rebuilt next tick
                    backend = None;
                }
            }
        }

        std::thread::sleep(AXFR_INTERVAL);
    }
}

/// Apply one transfer result to the backend. Returns whether anything
/// changed (and therefore whether the SOA serial was bumped).
pub fn reconcile_zone(
    backend: &mut dyn ZoneBackend,
    domain: &str,
    transferred: &[AxfrRecord],
) -> Result<bool, Error> {
    let stored = backend.domain_records(domain)?;
    let diff = diff_zone(transferred, &stored);
    if diff.is_empty() {
        return Ok(false);
    }

    for id in &diff.remove_ids {
        backend.delete_record(domain, *id)?;
    }
    for record in &diff.add {
        backend.insert_record(domain, &record.name, &record.rtype, record.ttl, &record.content)?;
    }
    let serial = backend.bump_soa_serial(domain)?;
    info!(
        domain,
        added = diff.add.len(),
        removed = diff.remove_ids.len(),
        serial,
        "zone records changed"
    );
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::MemBackend;

    fn record(name: &str, content: &str) -> AxfrRecord {
        AxfrRecord {
            name: name.to_owned(),
            ttl: 600,
            rtype: "A".to_owned(),
            content: content.to_owned(),
        }
    }

    #[test]
    fn test_reconcile_converges_and_bumps_serial_once() {
        let mut backend = MemBackend::new();
        backend
            .ensure_domain(
                "n.example",
                "nsX.example.tld root.example.tld 1 10800 1800 86400 86400",
                &["pvc-dns.example.tld".to_owned()],
            )
            .unwrap();

        let transferred = vec![
            record("a.n.example", "10.0.0.1"),
            record("b.n.example", "10.0.0.2"),
        ];
        assert!(reconcile_zone(&mut backend, "n.example", &transferred).unwrap());
        assert_eq!(backend.soa_serial("n.example"), Some(2));

        let hosts: Vec<_> = backend
            .domain_records("n.example")
            .unwrap()
            .into_iter()
            .filter(|record| record.rtype == "A")
            .collect();
        assert_eq!(hosts.len(), 2);

        // a second identical transfer changes nothing
        assert!(!reconcile_zone(&mut backend, "n.example", &transferred).unwrap());
        assert_eq!(backend.soa_serial("n.example"), Some(2));

        // dnsmasq drops b: one more reconciliation, one more serial bump
        let transferred = vec![record("a.n.example", "10.0.0.1")];
        assert!(reconcile_zone(&mut backend, "n.example", &transferred).unwrap());
        assert_eq!(backend.soa_serial("n.example"), Some(3));
        let hosts: Vec<_> = backend
            .domain_records("n.example")
            .unwrap()
            .into_iter()
            .filter(|record| record.rtype == "A")
            .collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "a.n.example");
    }

    #[test]
    fn test_reconcile_replaces_changed_content() {
        let mut backend = MemBackend::new();
        backend
            .ensure_domain("n.example", "ns root 1 2 3 4 5", &[])
            .unwrap();
        reconcile_zone(&mut backend, "n.example", &[record("a.n.example", "10.0.0.1")]).unwrap();

        reconcile_zone(&mut backend, "n.example", &[record("a.n.example", "10.0.0.7")]).unwrap();
        let hosts: Vec<_> = backend
            .domain_records("n.example")
            .unwrap()
            .into_iter()
            .filter(|record| record.rtype == "A")
            .collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].content, "10.0.0.7");
    }
}
