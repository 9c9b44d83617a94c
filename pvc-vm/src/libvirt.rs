//! Libvirt backend for the hypervisor seam.
//!
//! A connection is opened per operation and never crosses a thread;
//! domain handles carry only the URI and UUID, so they stay `Send` and can
//! travel through the worker pool.

use anyhow::{format_err, Context, Error};
use virt::connect::Connect;
use virt::domain::Domain;

use crate::hypervisor::{DomainHandle, DomainStats, Hypervisor, NodeMemory};

const LOCAL_URI: &str = "qemu:///system";

pub struct LibvirtHypervisor {
    uri: String,
}

impl LibvirtHypervisor {
    pub fn new() -> Self {
        LibvirtHypervisor {
            uri: LOCAL_URI.to_owned(),
        }
    }
}

impl Default for LibvirtHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn open(uri: &str) -> Result<Connect, Error> {
    Connect::open(Some(uri))
        .with_context(|| format!("failed to open libvirt connection to {uri}"))
}

/// Run `body` against a fresh connection, closing it afterwards.
fn with_conn<T>(uri: &str, body: impl FnOnce(&Connect) -> Result<T, Error>) -> Result<T, Error> {
    let conn = open(uri)?;
    let result = body(&conn);
    let mut conn = conn;
    let _ = conn.close();
    result
}

fn with_domain<T>(
    uri: &str,
    uuid: &str,
    body: impl FnOnce(&Domain) -> Result<T, Error>,
) -> Result<T, Error> {
    with_conn(uri, |conn| {
        let domain = Domain::lookup_by_uuid_string(conn, uuid)
            .map_err(|err| format_err!("lookup of domain {uuid} failed: {err}"))?;
        body(&domain)
    })
}

struct LibvirtDomain {
    uri: String,
    uuid: String,
}

impl DomainHandle for LibvirtDomain {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn is_running(&self) -> Result<bool, Error> {
        with_domain(&self.uri, &self.uuid, |domain| {
            let (state, _reason) = domain
                .get_state()
                .map_err(|err| format_err!("state query failed: {err}"))?;
            Ok(state == virt::sys::VIR_DOMAIN_RUNNING)
        })
    }

    fn shutdown(&self) -> Result<(), Error> {
        with_domain(&self.uri, &self.uuid, |domain| {
            domain
                .shutdown()
                .map(|_| ())
                .map_err(|err| format_err!("shutdown failed: {err}"))
        })
    }

    fn destroy(&self) -> Result<(), Error> {
        with_domain(&self.uri, &self.uuid, |domain| {
            domain
                .destroy()
                .map(|_| ())
                .map_err(|err| format_err!("destroy failed: {err}"))
        })
    }

    fn stats(&self) -> Result<DomainStats, Error> {
        with_domain(&self.uri, &self.uuid, |domain| {
            let info = domain
                .get_info()
                .map_err(|err| format_err!("info query failed: {err}"))?;
            Ok(DomainStats {
                memory: info.max_mem / 1024,
                vcpus: info.nr_virt_cpu,
            })
        })
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn node_memory(&self) -> Result<NodeMemory, Error> {
        with_conn(&self.uri, |conn| {
            let node_info = conn
                .get_node_info()
                .map_err(|err| format_err!("node info query failed: {err}"))?;
            let free = conn
                .get_free_memory()
                .map_err(|err| format_err!("free memory query failed: {err}"))?;

            // node info reports KiB, free memory reports bytes
            let total = node_info.memory / 1024;
            let free = free / (1024 * 1024);
            Ok(NodeMemory {
                total,
                used: total.saturating_sub(free),
                free,
            })
        })
    }

    fn running_domains(&self) -> Result<Vec<String>, Error> {
        with_conn(&self.uri, |conn| {
            let domains = conn
                .list_all_domains(virt::sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE)
                .map_err(|err| format_err!("domain listing failed: {err}"))?;
            let mut uuids = Vec::with_capacity(domains.len());
            for domain in domains {
                if let Ok(uuid) = domain.get_uuid_string() {
                    uuids.push(uuid);
                }
            }
            uuids.sort();
            Ok(uuids)
        })
    }

    fn lookup(&self, uuid: &str) -> Result<Option<Box<dyn DomainHandle>>, Error> {
        let known = with_conn(&self.uri, |conn| {
            Ok(Domain::lookup_by_uuid_string(conn, uuid).is_ok())
        })?;
        if !known {
            return Ok(None);
        }
        Ok(Some(Box::new(LibvirtDomain {
            uri: self.uri.clone(),
            uuid: uuid.to_owned(),
        })))
    }

    fn create_from_xml(&self, xml: &str) -> Result<Box<dyn DomainHandle>, Error> {
        let uuid = with_conn(&self.uri, |conn| {
            let domain = Domain::create_xml(conn, xml, 0)
                .map_err(|err| format_err!("domain creation failed: {err}"))?;
            domain
                .get_uuid_string()
                .map_err(|err| format_err!("UUID query of new domain failed: {err}"))
        })?;
        Ok(Box::new(LibvirtDomain {
            uri: self.uri.clone(),
            uuid,
        }))
    }

    fn migrate_live(&self, uuid: &str, dest_uri: &str) -> Result<(), Error> {
        with_conn(&self.uri, |conn| {
            let domain = Domain::lookup_by_uuid_string(conn, uuid)
                .map_err(|err| format_err!("lookup of domain {uuid} failed: {err}"))?;
            let dest = Connect::open(Some(dest_uri))
                .with_context(|| format!("failed to open migration target {dest_uri}"))?;
            let result = domain
                .migrate(&dest, virt::sys::VIR_MIGRATE_LIVE, None, None, 0)
                .map(|_| ())
                .map_err(|err| format_err!("live migration of {uuid} failed: {err}"));
            let mut dest = dest;
            let _ = dest.close();
            result
        })
    }
}
