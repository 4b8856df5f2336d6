//! Known application server addresses.

use crate::config::ApplicationServerAddress;
use common::types::ServerId;
use std::collections::{BTreeMap, HashMap};

/// Address book of application servers, keyed by stable id.
///
/// Registration is idempotent by canonical hostname. Ids are never reused,
/// so a stale id held by an in-flight event cannot alias a newer server.
#[derive(Debug, Default)]
pub struct ServerAddressRegistry {
    next_id: u32,
    by_id: BTreeMap<ServerId, ApplicationServerAddress>,
    by_host: HashMap<String, ServerId>,
}

impl ServerAddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address, returning its id and whether it was new.
    pub fn register(&mut self, address: ApplicationServerAddress) -> (ServerId, bool) {
        let host = address.canonical_hostname.to_ascii_lowercase();
        if let Some(id) = self.by_host.get(&host) {
            return (*id, false);
        }

        self.next_id += 1;
        let id = ServerId(self.next_id);
        self.by_host.insert(host, id);
        self.by_id.insert(id, address);
        (id, true)
    }

    pub fn remove(&mut self, id: ServerId) -> Option<ApplicationServerAddress> {
        let address = self.by_id.remove(&id)?;
        self.by_host
            .remove(&address.canonical_hostname.to_ascii_lowercase());
        Some(address)
    }

    pub fn get(&self, id: ServerId) -> Option<&ApplicationServerAddress> {
        self.by_id.get(&id)
    }

    /// Resolve a canonical hostname (case-insensitive).
    pub fn lookup_host(&self, host: &str) -> Option<ServerId> {
        self.by_host.get(&host.to_ascii_lowercase()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServerId, &ApplicationServerAddress)> {
        self.by_id.iter().map(|(id, addr)| (*id, addr))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
