//! Process-wide AF context.
//!
//! `Context` is built once at startup, handed to the dispatcher, and torn
//! down when the dispatcher exits. Nothing in it is global: every FSM
//! receives the `Model` by mutable reference for the duration of one event.
//!
//! Model operations are all-or-nothing. Validation happens before the first
//! mutation, so a rejected request leaves no partially linked entity behind.

pub mod as_state;
pub mod cache_control;
pub mod documents;
pub mod provisioning;
pub mod server_registry;

pub use documents::ServedDocument;

use crate::config::Config;
use crate::errors::AfError;
use crate::fsm::{FsmState, Interface, Machines};
use as_state::{ApplicationServerStates, DistributionStatus};
use cache_control::DocumentKind;
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use documents::DocumentCache;
use provisioning::{prefix_pattern, DistributionDiff, HostingConfiguration, ProvisioningSessionStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Answer to an update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Identical document; nothing redistributed.
    Unchanged,
    Updated { version: u64, diff: DistributionDiff },
}

/// Distribution state of one session on one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDistribution {
    pub server: ServerId,
    pub canonical_hostname: String,
    pub status: DistributionStatus,
    pub version: u64,
    pub attempts: u32,
    pub permanently_stale: bool,
}

/// Session view returned by status queries and the M1 session resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub provisioning_session_id: ProvisioningSessionId,
    pub provisioning_session_type: String,
    pub name: String,
    pub version: u64,
    pub pending_deletion: bool,
    pub servers: Vec<ServerDistribution>,
    pub pending_purges: usize,
}

impl SessionStatus {
    pub fn server(&self, server: ServerId) -> Option<&ServerDistribution> {
        self.servers.iter().find(|s| s.server == server)
    }
}

/// Application server view for the management interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: ServerId,
    pub canonical_hostname: String,
    pub m3_base_url: String,
    pub sessions: usize,
    pub pending_purges: usize,
}

/// Work produced by an accepted update.
#[derive(Debug, Default)]
pub struct UpdatePlan {
    pub distribute: Vec<ServerId>,
    pub purges: Vec<PurgeId>,
}

/// Work produced by an accepted delete.
#[derive(Debug, Default)]
pub struct DeletePlan {
    pub purges: Vec<PurgeId>,
    pub drained: bool,
}

/// What remained when the context was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub sessions: usize,
    pub servers: usize,
    pub pending_purges: usize,
}

/// Mutable AF state shared by the FSMs.
#[derive(Debug)]
pub struct Model {
    pub config: Arc<Config>,
    pub server_name: String,
    pub sessions: ProvisioningSessionStore,
    pub servers: ApplicationServerStates,
    pub documents: DocumentCache,
}

impl Model {
    fn new(config: Arc<Config>, server_name: String) -> Self {
        Self {
            config,
            server_name,
            sessions: ProvisioningSessionStore::new(),
            servers: ApplicationServerStates::new(),
            documents: DocumentCache::new(),
        }
    }

    /// Store a new session and start tracking it on every targeted server.
    pub fn create_session(
        &mut self,
        document: HostingConfiguration,
    ) -> Result<(ProvisioningSessionId, Vec<ServerId>), AfError> {
        let id = self.sessions.create(document, self.servers.registry())?;
        let session = self.sessions.live(id)?;
        let version = session.version;
        let servers: Vec<ServerId> = session.servers().into_iter().collect();

        for (attached, server) in servers.iter().enumerate() {
            if let Err(e) = self.servers.attach(id, *server, version) {
                for undo in servers.iter().take(attached) {
                    if let Err(e) = self
                        .servers
                        .mark(id, *undo, DistributionStatus::PurgePending)
                        .and_then(|()| self.servers.remove(id, *undo).map(drop))
                    {
                        warn!(target: "af.context.model", session = %id, server = %undo, error = %e, "Failed to roll back attached pair");
                    }
                }
                self.sessions.release(id);
                return Err(e);
            }
        }

        Ok((id, servers))
    }

    /// Replace a session's document and reconcile tracked servers.
    pub fn update_session(
        &mut self,
        id: ProvisioningSessionId,
        document: HostingConfiguration,
    ) -> Result<(UpdateOutcome, UpdatePlan), AfError> {
        let current = self.sessions.live(id)?;
        let old_rules = current.rules.clone();
        let rules = self
            .sessions
            .validate(&document, self.servers.registry(), Some(id))?;

        let targeted: BTreeSet<ServerId> = rules.keys().map(|key| key.server).collect();
        if let Some(server) = targeted.iter().find(|server| {
            self.servers
                .entry(id, **server)
                .is_some_and(|e| e.status == DistributionStatus::PurgePending)
        }) {
            return Err(AfError::Validation(format!(
                "application server {server} is still withdrawing this session"
            )));
        }

        let diff = self.sessions.apply_update(id, document, rules)?;
        if diff.is_empty() {
            return Ok((UpdateOutcome::Unchanged, UpdatePlan::default()));
        }

        let version = self.sessions.live(id)?.version;
        self.documents.evict(id);

        let tracked: Vec<ServerId> = self
            .servers
            .servers_for(id)
            .into_iter()
            .filter(|server| {
                self.servers
                    .entry(id, *server)
                    .is_some_and(|e| e.status != DistributionStatus::PurgePending)
            })
            .collect();

        let mut plan = UpdatePlan::default();

        for server in &targeted {
            match self.servers.entry(id, *server).map(|e| e.status) {
                Some(status) => {
                    if status == DistributionStatus::Uploaded {
                        self.servers.mark(id, *server, DistributionStatus::Stale)?;
                    }
                    if let Some(entry) = self.servers.entry_mut(id, *server) {
                        entry.version = version;
                        entry.attempts = 0;
                        entry.exhausted = false;
                    }
                }
                None => self.servers.attach(id, *server, version)?,
            }
            plan.distribute.push(*server);
        }

        for server in tracked.iter().filter(|s| !targeted.contains(*s)) {
            if let Some(purge) = self.withdraw(id, *server)? {
                plan.purges.push(purge);
            }
        }

        // Content that was reachable under a removed path (or under any path
        // when the origin changed) must be invalidated on servers that keep
        // carrying the session.
        let mut invalidated: BTreeSet<&provisioning::RuleKey> = diff.removed_rules().collect();
        if diff.ingest.is_some() {
            invalidated.extend(old_rules.keys());
        }
        for key in invalidated {
            let holds_content = self
                .servers
                .entry(id, key.server)
                .is_some_and(|e| e.ever_uploaded || e.in_flight);
            if targeted.contains(&key.server) && tracked.contains(&key.server) && holds_content {
                let purge = self.queue_purge(
                    id,
                    key.server,
                    Some(prefix_pattern(&key.base_path)),
                    false,
                )?;
                plan.purges.push(purge);
            }
        }

        Ok((UpdateOutcome::Updated { version, diff }, plan))
    }

    /// Mark a session for removal and withdraw it from every server.
    pub fn delete_session(&mut self, id: ProvisioningSessionId) -> Result<DeletePlan, AfError> {
        self.sessions.delete(id)?;
        self.documents.evict(id);

        let mut plan = DeletePlan::default();
        for server in self.servers.servers_for(id) {
            if let Some(purge) = self.withdraw(id, server)? {
                plan.purges.push(purge);
            }
        }
        plan.drained = self.is_drained(id);
        Ok(plan)
    }

    /// Queue an explicit purge on every server holding the session's content.
    pub fn purge_session(
        &mut self,
        id: ProvisioningSessionId,
        pattern: &str,
    ) -> Result<Vec<PurgeId>, AfError> {
        self.sessions.live(id)?;
        if pattern.trim().is_empty() {
            return Err(AfError::Validation("purge pattern must not be empty".to_string()));
        }

        let holding: Vec<ServerId> = self
            .servers
            .servers_for(id)
            .into_iter()
            .filter(|server| {
                self.servers.entry(id, *server).is_some_and(|e| {
                    e.status != DistributionStatus::PurgePending && (e.ever_uploaded || e.in_flight)
                })
            })
            .collect();

        holding
            .into_iter()
            .map(|server| self.queue_purge(id, server, Some(pattern.to_string()), false))
            .collect()
    }

    /// Move a pair to purge-pending and queue its withdrawal.
    ///
    /// A pair that never reached the server is dropped on the spot and
    /// `None` is returned. A pair already being withdrawn is left alone.
    pub fn withdraw(
        &mut self,
        id: ProvisioningSessionId,
        server: ServerId,
    ) -> Result<Option<PurgeId>, AfError> {
        let entry = self
            .servers
            .entry(id, server)
            .ok_or(AfError::SessionNotFound(id))?;
        if entry.status == DistributionStatus::PurgePending {
            return Ok(None);
        }
        let never_sent = !entry.ever_uploaded && !entry.in_flight;

        self.servers.mark(id, server, DistributionStatus::PurgePending)?;
        if never_sent {
            debug!(target: "af.context.model", session = %id, server = %server, "Dropping pair that never reached the server");
            self.remove_pair(id, server)?;
            return Ok(None);
        }

        self.queue_purge(id, server, None, true).map(Some)
    }

    /// Create a purge node and link it to its session.
    pub fn queue_purge(
        &mut self,
        id: ProvisioningSessionId,
        server: ServerId,
        pattern: Option<String>,
        withdraw: bool,
    ) -> Result<PurgeId, AfError> {
        let purge = self.servers.add_purge(id, server, pattern, withdraw)?;
        if let Some(session) = self.sessions.lookup_mut(id) {
            session.purges.insert(purge);
        }
        Ok(purge)
    }

    /// Drop a purge node and unlink it from its session.
    pub fn finish_purge(&mut self, purge: PurgeId) -> Option<as_state::PurgeNode> {
        let node = self.servers.remove_purge(purge)?;
        if let Some(session) = self.sessions.lookup_mut(node.session) {
            session.purges.remove(&purge);
        }
        Some(node)
    }

    /// Stop tracking a purge-pending pair.
    pub fn remove_pair(&mut self, id: ProvisioningSessionId, server: ServerId) -> Result<(), AfError> {
        let dropped = self.servers.remove(id, server)?;
        if let Some(session) = self.sessions.lookup_mut(id) {
            for purge in dropped {
                session.purges.remove(&purge);
            }
        }
        Ok(())
    }

    /// A deleted session no server tracks any more.
    pub fn is_drained(&self, id: ProvisioningSessionId) -> bool {
        self.sessions
            .lookup(id)
            .is_some_and(|s| s.pending_deletion)
            && self.servers.servers_for(id).is_empty()
    }

    /// Remove a drained session from the store. Returns whether it was removed.
    pub fn release(&mut self, id: ProvisioningSessionId) -> bool {
        if !self.is_drained(id) {
            return false;
        }
        self.documents.evict(id);
        self.sessions.release(id).is_some()
    }

    pub fn session_status(&self, id: ProvisioningSessionId) -> Result<SessionStatus, AfError> {
        let session = self
            .sessions
            .lookup(id)
            .ok_or(AfError::SessionNotFound(id))?;

        let servers = self
            .servers
            .servers_for(id)
            .into_iter()
            .filter_map(|server| {
                let entry = self.servers.entry(id, server)?;
                let node = self.servers.node(server)?;
                Some(ServerDistribution {
                    server,
                    canonical_hostname: node.address.canonical_hostname.clone(),
                    status: entry.status,
                    version: entry.version,
                    attempts: entry.attempts,
                    permanently_stale: entry.exhausted,
                })
            })
            .collect();

        Ok(SessionStatus {
            provisioning_session_id: id,
            provisioning_session_type: "DOWNLINK".to_string(),
            name: session.document.name.clone(),
            version: session.version,
            pending_deletion: session.pending_deletion,
            servers,
            pending_purges: session.purges.len(),
        })
    }

    /// Render a served document. The provisioning session resource stays
    /// visible while pending deletion; the other documents need a live session.
    pub fn render(
        &mut self,
        id: ProvisioningSessionId,
        kind: DocumentKind,
    ) -> Result<ServedDocument, AfError> {
        let session = match kind {
            DocumentKind::ProvisioningSession => self
                .sessions
                .lookup(id)
                .ok_or(AfError::SessionNotFound(id))?,
            _ => self.sessions.live(id)?,
        };
        let policy = self.config.cache_control;
        let version = session.version;
        let modified = session.modified_at;

        let encode = |e: serde_json::Error| AfError::Internal(format!("failed to encode document: {e}"));

        match kind {
            DocumentKind::ProvisioningSession => {
                let status = self.session_status(id)?;
                let body = serde_json::to_vec(&status).map_err(encode)?;
                Ok(documents::render_document(kind, modified, &policy, body))
            }
            DocumentKind::ContentHostingConfiguration => {
                let document = &session.document;
                self.documents
                    .get_or_render(id, kind, version, modified, &policy, || {
                        serde_json::to_vec(document).map_err(encode)
                    })
            }
            DocumentKind::ServiceAccessInformation => {
                let sai = session.service_access.as_ref().ok_or_else(|| {
                    AfError::NotFound(format!(
                        "provisioning session {id} has no service access information"
                    ))
                })?;
                self.documents
                    .get_or_render(id, kind, version, modified, &policy, || {
                        serde_json::to_vec(sai).map_err(encode)
                    })
            }
        }
    }

    pub fn server_summary(&self, server: ServerId) -> Result<ServerSummary, AfError> {
        let node = self
            .servers
            .node(server)
            .ok_or(AfError::ServerNotFound(server))?;
        Ok(ServerSummary {
            id: server,
            canonical_hostname: node.address.canonical_hostname.clone(),
            m3_base_url: node.address.m3_base_url.clone(),
            sessions: node.active_sessions(),
            pending_purges: node.purges().count(),
        })
    }

    pub fn server_summaries(&self) -> Vec<ServerSummary> {
        self.servers
            .nodes()
            .filter_map(|node| self.server_summary(node.id).ok())
            .collect()
    }

    /// Repair cross-references between the store and the tracker.
    ///
    /// Drops purge references the tracker no longer knows and stops tracking
    /// pairs whose session is gone. Returns the number of repairs.
    pub fn reconcile(&mut self) -> usize {
        let mut repairs = 0;

        let servers = &self.servers;
        for session in self.sessions.iter_mut() {
            let before = session.purges.len();
            session.purges.retain(|purge| servers.purge(*purge).is_some());
            repairs += before - session.purges.len();
        }

        let orphans: Vec<(ProvisioningSessionId, ServerId)> = self
            .servers
            .nodes()
            .flat_map(|node| {
                node.sessions()
                    .map(move |(session, _)| (session, node.id))
            })
            .filter(|(session, _)| self.sessions.lookup(*session).is_none())
            .collect();
        for (session, server) in orphans {
            match self
                .servers
                .mark(session, server, DistributionStatus::PurgePending)
                .and_then(|()| self.servers.remove(session, server).map(drop))
            {
                Ok(()) => repairs += 1,
                Err(e) => {
                    warn!(target: "af.context.model", session = %session, server = %server, error = %e, "Failed to drop orphaned pair");
                }
            }
        }

        if repairs > 0 {
            info!(target: "af.context.model", repairs, "Reconciled provisioning state");
        }
        repairs
    }

    fn outstanding_purges(&self) -> usize {
        self.servers.nodes().map(|node| node.purges().count()).sum()
    }
}

/// Root of all AF state: the model plus the FSM instances.
#[derive(Debug)]
pub struct Context {
    pub model: Model,
    pub machines: Machines,
}

impl Context {
    /// Build the context from parsed configuration.
    ///
    /// Resolves the advertised server name and registers every configured
    /// application server. All FSMs start in their initial state.
    pub fn init(config: Arc<Config>) -> Result<Self, AfError> {
        let server_name = resolve_server_name(&config.server_name)?;
        let machines = Machines::new(&config);
        let mut model = Model::new(Arc::clone(&config), server_name);

        for address in &config.application_servers {
            let (id, _) = model.servers.register_server(address.clone());
            debug!(target: "af.context", server = %id, host = %address.canonical_hostname, "Registered configured application server");
        }

        info!(
            target: "af.context",
            server_name = %model.server_name,
            application_servers = model.servers.len(),
            core_integration = config.core_integration,
            "Context initialized"
        );

        Ok(Self { model, machines })
    }

    pub fn state(&self, interface: Interface) -> FsmState {
        self.machines.state(interface)
    }

    /// Release the context, reporting what was still outstanding.
    pub fn teardown(self) -> TeardownReport {
        let report = TeardownReport {
            sessions: self.model.sessions.len(),
            servers: self.model.servers.len(),
            pending_purges: self.model.outstanding_purges(),
        };
        info!(
            target: "af.context",
            sessions = report.sessions,
            servers = report.servers,
            pending_purges = report.pending_purges,
            "Context torn down"
        );
        report
    }
}

fn resolve_server_name(name: &str) -> Result<String, AfError> {
    let name = name.trim().trim_end_matches('.');
    if name.is_empty() || name.contains(char::is_whitespace) || name.contains('/') {
        return Err(AfError::FatalConfig(format!(
            "server name {name:?} is not a valid hostname"
        )));
    }
    Ok(name.to_ascii_lowercase())
}
