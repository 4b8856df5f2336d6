//! Application server state tracker.
//!
//! One node per known application server. Each node holds the distribution
//! status of every session it carries plus its outstanding purge operations.
//! Sessions are referenced by id only; purge nodes are owned by their server
//! node and indexed by id for response correlation.

use crate::config::ApplicationServerAddress;
use crate::context::server_registry::ServerAddressRegistry;
use crate::errors::AfError;
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Distribution status of one (session, server) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionStatus {
    NotUploaded,
    Uploaded,
    Stale,
    PurgePending,
}

impl DistributionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DistributionStatus::NotUploaded => "not-uploaded",
            DistributionStatus::Uploaded => "uploaded",
            DistributionStatus::Stale => "stale",
            DistributionStatus::PurgePending => "purge-pending",
        }
    }

    /// Whether `self -> next` is a permitted transition.
    pub fn can_become(self, next: DistributionStatus) -> bool {
        use DistributionStatus::{NotUploaded, PurgePending, Stale, Uploaded};

        self == next
            || matches!(
                (self, next),
                (NotUploaded, Uploaded)
                    | (NotUploaded, Stale)
                    | (Uploaded, Stale)
                    | (Stale, Uploaded)
                    | (_, PurgePending)
            )
    }
}

impl fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracking record for one (session, server) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionEntry {
    pub status: DistributionStatus,
    /// Document version this pair should converge to.
    pub version: u64,
    /// Failed attempts in the current distribution cycle.
    pub attempts: u32,
    pub in_flight: bool,
    /// Retry bound exhausted; no further automatic retry.
    pub exhausted: bool,
    /// The server acknowledged some version at least once.
    pub ever_uploaded: bool,
}

impl DistributionEntry {
    fn new(version: u64) -> Self {
        Self {
            status: DistributionStatus::NotUploaded,
            version,
            attempts: 0,
            in_flight: false,
            exhausted: false,
            ever_uploaded: false,
        }
    }

    /// Whether the server needs (another) copy of the current version.
    pub fn needs_distribution(&self) -> bool {
        matches!(
            self.status,
            DistributionStatus::NotUploaded | DistributionStatus::Stale
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurgeStatus {
    Pending,
    InFlight,
}

/// One outstanding invalidation on one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeNode {
    pub id: PurgeId,
    pub session: ProvisioningSessionId,
    pub server: ServerId,
    /// Path regex; `None` for a withdrawal of the whole configuration.
    pub pattern: Option<String>,
    pub withdraw: bool,
    pub status: PurgeStatus,
    pub attempts: u32,
}

/// Per-server state.
#[derive(Debug)]
pub struct ApplicationServerStateNode {
    pub id: ServerId,
    pub address: ApplicationServerAddress,
    sessions: BTreeMap<ProvisioningSessionId, DistributionEntry>,
    purges: BTreeMap<PurgeId, PurgeNode>,
}

impl ApplicationServerStateNode {
    pub fn sessions(&self) -> impl Iterator<Item = (ProvisioningSessionId, &DistributionEntry)> {
        self.sessions.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn purges(&self) -> impl Iterator<Item = &PurgeNode> {
        self.purges.values()
    }

    /// Sessions the server currently carries (excludes pairs being withdrawn).
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .values()
            .filter(|e| e.status != DistributionStatus::PurgePending)
            .count()
    }
}

/// All server nodes, plus the address registry they were created from.
#[derive(Debug, Default)]
pub struct ApplicationServerStates {
    registry: ServerAddressRegistry,
    nodes: BTreeMap<ServerId, ApplicationServerStateNode>,
    purge_index: HashMap<PurgeId, ServerId>,
    next_purge: u64,
}

impl ApplicationServerStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ServerAddressRegistry {
        &self.registry
    }

    /// Register a server; idempotent by canonical hostname.
    pub fn register_server(&mut self, address: ApplicationServerAddress) -> (ServerId, bool) {
        let (id, created) = self.registry.register(address.clone());
        if created {
            self.nodes.insert(
                id,
                ApplicationServerStateNode {
                    id,
                    address,
                    sessions: BTreeMap::new(),
                    purges: BTreeMap::new(),
                },
            );
        }
        (id, created)
    }

    /// Remove a server that carries no sessions and no pending purges.
    pub fn deregister_server(&mut self, id: ServerId) -> Result<ApplicationServerStateNode, AfError> {
        let node = self.nodes.get(&id).ok_or(AfError::ServerNotFound(id))?;
        if !node.sessions.is_empty() || !node.purges.is_empty() {
            return Err(AfError::Conflict(format!(
                "application server {id} still tracks {} session(s)",
                node.sessions.len()
            )));
        }

        self.registry.remove(id);
        self.nodes.remove(&id).ok_or(AfError::ServerNotFound(id))
    }

    pub fn node(&self, id: ServerId) -> Option<&ApplicationServerStateNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ApplicationServerStateNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Start tracking a pair as not-uploaded at `version`.
    pub fn attach(
        &mut self,
        session: ProvisioningSessionId,
        server: ServerId,
        version: u64,
    ) -> Result<(), AfError> {
        let node = self.nodes.get_mut(&server).ok_or(AfError::ServerNotFound(server))?;
        if node.sessions.contains_key(&session) {
            return Err(AfError::Internal(format!(
                "session {session} already tracked on {server}"
            )));
        }
        node.sessions.insert(session, DistributionEntry::new(version));
        Ok(())
    }

    pub fn entry(
        &self,
        session: ProvisioningSessionId,
        server: ServerId,
    ) -> Option<&DistributionEntry> {
        self.nodes.get(&server)?.sessions.get(&session)
    }

    pub fn entry_mut(
        &mut self,
        session: ProvisioningSessionId,
        server: ServerId,
    ) -> Option<&mut DistributionEntry> {
        self.nodes.get_mut(&server)?.sessions.get_mut(&session)
    }

    /// Apply a status transition, rejecting anything not permitted.
    pub fn mark(
        &mut self,
        session: ProvisioningSessionId,
        server: ServerId,
        status: DistributionStatus,
    ) -> Result<(), AfError> {
        let entry = self
            .entry_mut(session, server)
            .ok_or(AfError::SessionNotFound(session))?;

        if !entry.status.can_become(status) {
            return Err(AfError::Internal(format!(
                "illegal transition {} -> {status} for session {session} on {server}",
                entry.status
            )));
        }

        entry.status = status;
        Ok(())
    }

    /// Stop tracking a pair. Only legal once the pair is purge-pending.
    ///
    /// Remaining purge nodes for the pair are dropped and returned.
    pub fn remove(
        &mut self,
        session: ProvisioningSessionId,
        server: ServerId,
    ) -> Result<Vec<PurgeId>, AfError> {
        let node = self.nodes.get_mut(&server).ok_or(AfError::ServerNotFound(server))?;
        let status = node
            .sessions
            .get(&session)
            .map(|e| e.status)
            .ok_or(AfError::SessionNotFound(session))?;

        if status != DistributionStatus::PurgePending {
            return Err(AfError::Internal(format!(
                "cannot remove session {session} from {server} while {status}"
            )));
        }

        node.sessions.remove(&session);
        let dropped: Vec<PurgeId> = node
            .purges
            .values()
            .filter(|p| p.session == session)
            .map(|p| p.id)
            .collect();
        for id in &dropped {
            node.purges.remove(id);
            self.purge_index.remove(id);
        }

        Ok(dropped)
    }

    /// Servers tracking a session, in id order.
    pub fn servers_for(&self, session: ProvisioningSessionId) -> Vec<ServerId> {
        self.nodes
            .values()
            .filter(|node| node.sessions.contains_key(&session))
            .map(|node| node.id)
            .collect()
    }

    /// Queue a purge; the pair must be tracked.
    pub fn add_purge(
        &mut self,
        session: ProvisioningSessionId,
        server: ServerId,
        pattern: Option<String>,
        withdraw: bool,
    ) -> Result<PurgeId, AfError> {
        let node = self.nodes.get_mut(&server).ok_or(AfError::ServerNotFound(server))?;
        if !node.sessions.contains_key(&session) {
            return Err(AfError::SessionNotFound(session));
        }

        self.next_purge += 1;
        let id = PurgeId(self.next_purge);
        node.purges.insert(
            id,
            PurgeNode {
                id,
                session,
                server,
                pattern,
                withdraw,
                status: PurgeStatus::Pending,
                attempts: 0,
            },
        );
        self.purge_index.insert(id, server);
        Ok(id)
    }

    pub fn purge(&self, id: PurgeId) -> Option<&PurgeNode> {
        let server = self.purge_index.get(&id)?;
        self.nodes.get(server)?.purges.get(&id)
    }

    pub fn purge_mut(&mut self, id: PurgeId) -> Option<&mut PurgeNode> {
        let server = self.purge_index.get(&id)?;
        self.nodes.get_mut(server)?.purges.get_mut(&id)
    }

    pub fn remove_purge(&mut self, id: PurgeId) -> Option<PurgeNode> {
        let server = self.purge_index.remove(&id)?;
        self.nodes.get_mut(&server)?.purges.remove(&id)
    }

    /// Outstanding purges for a server that are not on the wire.
    ///
    /// The iterator is finite and `Clone`, so a caller can walk it more than
    /// once without re-querying.
    pub fn pending_purges(
        &self,
        server: ServerId,
    ) -> impl Iterator<Item = &PurgeNode> + Clone + '_ {
        self.nodes
            .get(&server)
            .into_iter()
            .flat_map(|node| node.purges.values())
            .filter(|p| p.status == PurgeStatus::Pending)
    }

    /// Pairs that still need the current version and are not on the wire.
    pub fn stale_pairs(&self) -> Vec<(ProvisioningSessionId, ServerId)> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.sessions
                    .iter()
                    .filter(|(_, e)| e.needs_distribution() && !e.in_flight)
                    .map(move |(session, _)| (*session, node.id))
            })
            .collect()
    }
}
