//! In-process hypervisor double for tests.
//!
//! Models just enough libvirt behavior for the state machine: domains are
//! created running, can be flipped between running and shut off, and
//! outbound live migrations are recorded (and optionally failed).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use crate::hypervisor::{DomainHandle, DomainStats, Hypervisor, NodeMemory};

#[derive(Debug, Clone)]
struct MockDomain {
    running: bool,
    memory: u64,
    vcpus: u32,
}

#[derive(Default)]
struct MockState {
    domains: HashMap<String, MockDomain>,
    migrations: Vec<(String, String)>,
    fail_create: bool,
    fail_migrate: bool,
    node_memory: NodeMemory,
}

/// A shared, scriptable hypervisor.
#[derive(Clone, Default)]
pub struct MockHypervisor {
    state: Arc<Mutex<MockState>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().node_memory = NodeMemory {
            total: 32768,
            used: 4096,
            free: 28672,
        };
        mock
    }

    /// Add a domain in the given run state.
    pub fn add_domain(&self, uuid: &str, running: bool) {
        self.state.lock().unwrap().domains.insert(
            uuid.to_owned(),
            MockDomain {
                running,
                memory: 2048,
                vcpus: 2,
            },
        );
    }

    pub fn set_running(&self, uuid: &str, running: bool) {
        if let Some(domain) = self.state.lock().unwrap().domains.get_mut(uuid) {
            domain.running = running;
        }
    }

    pub fn is_running(&self, uuid: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(uuid)
            .map(|domain| domain.running)
            .unwrap_or(false)
    }

    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn fail_migrations(&self, fail: bool) {
        self.state.lock().unwrap().fail_migrate = fail;
    }

    /// Outbound migrations recorded as `(uuid, dest_uri)`.
    pub fn migrations(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().migrations.clone()
    }
}

struct MockDomainHandle {
    uuid: String,
    state: Arc<Mutex<MockState>>,
}

impl DomainHandle for MockDomainHandle {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn is_running(&self) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .domains
            .get(&self.uuid)
            .map(|domain| domain.running)
            .unwrap_or(false))
    }

    fn shutdown(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.domains.get_mut(&self.uuid) {
            Some(domain) => {
                domain.running = false;
                Ok(())
            }
            None => Err(format_err!("no such domain {}", self.uuid)),
        }
    }

    fn destroy(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.domains.get_mut(&self.uuid) {
            Some(domain) => {
                domain.running = false;
                Ok(())
            }
            None => Err(format_err!("no such domain {}", self.uuid)),
        }
    }

    fn stats(&self) -> Result<DomainStats, Error> {
        let state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get(&self.uuid)
            .ok_or_else(|| format_err!("no such domain {}", self.uuid))?;
        Ok(DomainStats {
            memory: domain.memory,
            vcpus: domain.vcpus,
        })
    }
}

impl Hypervisor for MockHypervisor {
    fn node_memory(&self) -> Result<NodeMemory, Error> {
        Ok(self.state.lock().unwrap().node_memory)
    }

    fn running_domains(&self) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        let mut uuids: Vec<String> = state
            .domains
            .iter()
            .filter(|(_, domain)| domain.running)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        uuids.sort();
        Ok(uuids)
    }

    fn lookup(&self, uuid: &str) -> Result<Option<Box<dyn DomainHandle>>, Error> {
        let state = self.state.lock().unwrap();
        if state.domains.contains_key(uuid) {
            Ok(Some(Box::new(MockDomainHandle {
                uuid: uuid.to_owned(),
                state: Arc::clone(&self.state),
            })))
        } else {
            Ok(None)
        }
    }

    fn create_from_xml(&self, xml: &str) -> Result<Box<dyn DomainHandle>, Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            state.fail_create = false;
            return Err(format_err!("mock create failure"));
        }
        // the mock "XML" is just the domain UUID
        let uuid = xml.trim().to_owned();
        state.domains.insert(
            uuid.clone(),
            MockDomain {
                running: true,
                memory: 2048,
                vcpus: 2,
            },
        );
        Ok(Box::new(MockDomainHandle {
            uuid,
            state: Arc::clone(&self.state),
        }))
    }

    fn migrate_live(&self, uuid: &str, dest_uri: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_migrate {
            return Err(format_err!("mock migration failure"));
        }
        match state.domains.get_mut(uuid) {
            Some(domain) => {
                domain.running = false;
                state
                    .migrations
                    .push((uuid.to_owned(), dest_uri.to_owned()));
                Ok(())
            }
            None => Err(format_err!("no such domain {uuid}")),
        }
    }
}
