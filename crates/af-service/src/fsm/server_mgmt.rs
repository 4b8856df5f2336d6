//! M3 server management state machine.
//!
//! Pushes hosting configurations to application servers and drives purge
//! operations to completion. Transient failures are retried with bounded
//! exponential backoff; once the bound is spent a pair becomes permanently
//! stale (or a purge is abandoned) and a report is raised.
//!
//! A protocol error from a peer puts the machine in exception. Recovery
//! probes the faulting pair or purge again; if the probe keeps failing past
//! the recovery budget the entity is isolated and the machine carries on.
//! Only faults that cannot be pinned on one entity take it to final.

use super::provisioning::released;
use super::{Action, FsmState, Interface, Recovery, Report, StateMachine};
use crate::config::{Config, RetryPolicy};
use crate::context::as_state::{DistributionStatus, PurgeStatus};
use crate::context::Model;
use crate::errors::AfError;
use crate::events::outbound::{build_request, OutboundKind, RequestInput};
use crate::events::{
    Event, LifecycleSignal, LocalRequest, Outcome, Payload, RequestKind, Response, ServerAdmin,
};
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Entity a protocol fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Distribution {
        session: ProvisioningSessionId,
        server: ServerId,
    },
    Purge(PurgeId),
}

#[derive(Debug)]
pub struct ServerManagementFsm {
    state: FsmState,
    retry: RetryPolicy,
    request_timeout: Duration,
    recovery: Recovery,
    /// Entity that caused the current exception.
    fault: Option<Fault>,
    /// Entity re-sent by the last recovery, awaiting its outcome.
    probing: Option<Fault>,
}

impl ServerManagementFsm {
    pub fn new(config: &Config) -> Self {
        Self {
            state: FsmState::Initial,
            retry: config.retry,
            request_timeout: config.request_timeout,
            recovery: Recovery::new(config.exception_recovery_attempts),
            fault: None,
            probing: None,
        }
    }

    fn lifecycle(&mut self, model: &mut Model, signal: LifecycleSignal) -> Vec<Action> {
        match (self.state, signal) {
            (FsmState::Initial, LifecycleSignal::Start) => {
                self.state = FsmState::Functional;
                info!(
                    target: "af.fsm.server_mgmt",
                    servers = model.servers.len(),
                    "Server management interface functional"
                );
                Vec::new()
            }
            (FsmState::Exception, LifecycleSignal::Recover) => self.recover(model),
            (FsmState::Final, _) => Vec::new(),
            (_, LifecycleSignal::Stop) => {
                self.state = FsmState::Final;
                self.recovery.abandon(&AfError::Unavailable(
                    "server management interface stopped".to_string(),
                ));
                info!(target: "af.fsm.server_mgmt", "Server management interface stopped");
                Vec::new()
            }
            (state, signal) => {
                debug!(target: "af.fsm.server_mgmt", state = %state, signal = ?signal, "Ignoring lifecycle signal");
                Vec::new()
            }
        }
    }

    fn enter_exception(&mut self, reason: String, fault: Option<Fault>) -> Vec<Action> {
        error!(
            target: "af.fsm.server_mgmt",
            reason = %reason,
            fault = ?fault,
            "Server management interface entering exception"
        );
        self.state = FsmState::Exception;
        self.fault = fault;
        self.probing = None;

        vec![
            Action::Report(Report::Fault {
                interface: Interface::ServerManagement,
                reason,
            }),
            Action::Schedule {
                delay: self.retry.delay(self.recovery.attempts()),
                event: Event::lifecycle(Interface::ServerManagement, LifecycleSignal::Recover),
            },
        ]
    }

    fn recover(&mut self, model: &mut Model) -> Vec<Action> {
        let fault = self.fault.take();
        let mut actions = Vec::new();

        if self.recovery.try_recover() {
            model.reconcile();
            if let Some(fault) = fault {
                self.probing = Some(fault);
                actions.push(Action::Emit(probe(model, fault)));
            }
            info!(
                target: "af.fsm.server_mgmt",
                attempt = self.recovery.attempts(),
                fault = ?fault,
                "Server management interface recovering"
            );
        } else {
            let Some(fault) = fault else {
                error!(target: "af.fsm.server_mgmt", "Server management recovery exhausted");
                self.state = FsmState::Final;
                self.recovery.abandon(&AfError::Unavailable(
                    "server management interface failed".to_string(),
                ));
                return vec![Action::Emit(Event::lifecycle(
                    Interface::Af,
                    LifecycleSignal::Failed(Interface::ServerManagement),
                ))];
            };

            warn!(target: "af.fsm.server_mgmt", fault = ?fault, "Isolating faulting entity after failed recoveries");
            actions.extend(self.isolate(model, fault));
            self.recovery.succeeded();
        }

        self.state = FsmState::Functional;
        actions.push(Action::Report(Report::Recovered {
            interface: Interface::ServerManagement,
        }));
        actions.extend(self.recovery.replay());
        actions
    }

    /// Give up on an entity that keeps faulting.
    fn isolate(&mut self, model: &mut Model, fault: Fault) -> Vec<Action> {
        match fault {
            Fault::Distribution { session, server } => give_up_distribution(model, session, server)
                .into_iter()
                .map(Action::Report)
                .collect(),
            Fault::Purge(purge) => abandon_purge(model, purge),
        }
    }

    /// Clear the probe once its entity reaches a terminal outcome.
    fn settle(&mut self, entity: Fault) {
        if self.probing == Some(entity) {
            info!(target: "af.fsm.server_mgmt", fault = ?entity, "Faulting entity settled");
            self.probing = None;
            self.recovery.succeeded();
        }
    }

    fn distribute(
        &mut self,
        model: &mut Model,
        session: ProvisioningSessionId,
        server: ServerId,
    ) -> Vec<Action> {
        let Some(entry) = model.servers.entry(session, server) else {
            debug!(target: "af.fsm.server_mgmt", session = %session, server = %server, "Pair no longer tracked");
            return Vec::new();
        };
        if entry.status == DistributionStatus::PurgePending
            || entry.in_flight
            || entry.exhausted
            || !entry.needs_distribution()
        {
            debug!(
                target: "af.fsm.server_mgmt",
                session = %session,
                server = %server,
                status = %entry.status,
                in_flight = entry.in_flight,
                "Distribution not needed"
            );
            return Vec::new();
        }

        let kind = if entry.ever_uploaded {
            OutboundKind::UpdateConfiguration
        } else {
            OutboundKind::CreateConfiguration
        };
        let version = entry.version;

        let request = {
            let Ok(provisioning) = model.sessions.live(session) else {
                return Vec::new();
            };
            let Some(node) = model.servers.node(server) else {
                return Vec::new();
            };
            build_request(
                kind,
                &RequestInput {
                    session,
                    server,
                    purge: None,
                    base_url: &node.address.m3_base_url,
                    version,
                    document: &provisioning.document,
                    pattern: None,
                    deadline: self.request_timeout,
                },
            )
        };

        match request {
            Ok(request) => {
                if let Some(entry) = model.servers.entry_mut(session, server) {
                    entry.in_flight = true;
                }
                debug!(
                    target: "af.fsm.server_mgmt",
                    session = %session,
                    server = %server,
                    kind = kind.as_str(),
                    version,
                    "Sending configuration"
                );
                vec![Action::Send(request)]
            }
            Err(e) => self.enter_exception(e.to_string(), None),
        }
    }

    fn send_purge(&mut self, model: &mut Model, purge: PurgeId) -> Vec<Action> {
        let Some(node) = model.servers.purge(purge) else {
            debug!(target: "af.fsm.server_mgmt", purge = %purge, "Purge no longer tracked");
            return Vec::new();
        };
        if node.status == PurgeStatus::InFlight {
            return Vec::new();
        }

        let kind = if node.withdraw {
            OutboundKind::WithdrawConfiguration
        } else {
            OutboundKind::PurgeResources
        };
        let (session, server) = (node.session, node.server);
        let pattern = node.pattern.clone();

        let request = {
            let Some(provisioning) = model.sessions.lookup(session) else {
                model.finish_purge(purge);
                return Vec::new();
            };
            let Some(server_node) = model.servers.node(server) else {
                return Vec::new();
            };
            build_request(
                kind,
                &RequestInput {
                    session,
                    server,
                    purge: Some(purge),
                    base_url: &server_node.address.m3_base_url,
                    version: provisioning.version,
                    document: &provisioning.document,
                    pattern: pattern.as_deref(),
                    deadline: self.request_timeout,
                },
            )
        };

        match request {
            Ok(request) => {
                if let Some(node) = model.servers.purge_mut(purge) {
                    node.status = PurgeStatus::InFlight;
                }
                debug!(
                    target: "af.fsm.server_mgmt",
                    purge = %purge,
                    session = %session,
                    server = %server,
                    kind = kind.as_str(),
                    "Sending purge"
                );
                vec![Action::Send(request)]
            }
            Err(e) => self.enter_exception(e.to_string(), None),
        }
    }

    /// Redistribute everything out of date and resend every pending purge.
    fn resync(&mut self, model: &mut Model) -> Vec<Action> {
        let mut actions = Vec::new();

        for (session, server) in model.servers.stale_pairs() {
            if let Some(entry) = model.servers.entry_mut(session, server) {
                if entry.status == DistributionStatus::PurgePending {
                    continue;
                }
                entry.exhausted = false;
                entry.attempts = 0;
            }
            actions.push(Action::Emit(Event::distribute(session, server)));
        }
        let distributions = actions.len();

        let servers: Vec<ServerId> = model.servers.nodes().map(|node| node.id).collect();
        for server in servers {
            let pending = model.servers.pending_purges(server);
            if pending.clone().next().is_none() {
                continue;
            }
            let ids: Vec<PurgeId> = pending.map(|p| p.id).collect();
            for purge in ids {
                if let Some(node) = model.servers.purge_mut(purge) {
                    node.attempts = 0;
                }
                actions.push(Action::Emit(Event::purge(purge)));
            }
        }

        info!(
            target: "af.fsm.server_mgmt",
            distributions,
            purges = actions.len() - distributions,
            "Resynchronising application servers"
        );
        actions
    }

    fn distribution_response(
        &mut self,
        model: &mut Model,
        session: ProvisioningSessionId,
        server: ServerId,
        response: Response,
    ) -> Vec<Action> {
        let Some(entry) = model.servers.entry_mut(session, server) else {
            debug!(target: "af.fsm.server_mgmt", session = %session, server = %server, "Discarding response for untracked pair");
            return Vec::new();
        };
        entry.in_flight = false;
        if response.outcome == Outcome::Ack {
            entry.ever_uploaded = true;
        }

        if entry.status == DistributionStatus::PurgePending {
            debug!(target: "af.fsm.server_mgmt", session = %session, server = %server, "Discarding response for withdrawn pair");
            return Vec::new();
        }
        if response.version != entry.version {
            debug!(
                target: "af.fsm.server_mgmt",
                session = %session,
                server = %server,
                response_version = response.version,
                current_version = entry.version,
                "Discarding response for outdated version"
            );
            return if entry.needs_distribution() && !entry.exhausted {
                vec![Action::Emit(Event::distribute(session, server))]
            } else {
                Vec::new()
            };
        }

        let entity = Fault::Distribution { session, server };
        match response.outcome {
            Outcome::Ack => {
                entry.attempts = 0;
                entry.exhausted = false;
                if let Err(e) = model.servers.mark(session, server, DistributionStatus::Uploaded) {
                    return self.enter_exception(e.to_string(), None);
                }
                info!(
                    target: "af.fsm.server_mgmt",
                    session = %session,
                    server = %server,
                    version = response.version,
                    "Configuration distributed"
                );
                self.settle(entity);
                if self.probing.is_none() {
                    self.recovery.succeeded();
                }
                Vec::new()
            }
            Outcome::Transient(_) | Outcome::TimedOut => {
                entry.attempts += 1;
                let attempts = entry.attempts;
                if let Err(e) = model.servers.mark(session, server, DistributionStatus::Stale) {
                    return self.enter_exception(e.to_string(), None);
                }

                if self.retry.allows_retry(attempts) {
                    let delay = self.retry.delay(attempts - 1);
                    debug!(
                        target: "af.fsm.server_mgmt",
                        session = %session,
                        server = %server,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        outcome = response.outcome.as_str(),
                        "Distribution failed; retrying"
                    );
                    vec![Action::Schedule {
                        delay,
                        event: Event::distribute(session, server),
                    }]
                } else {
                    self.settle(entity);
                    give_up_distribution(model, session, server)
                        .into_iter()
                        .map(Action::Report)
                        .collect()
                }
            }
            Outcome::Protocol(reason) => {
                if let Err(e) = model.servers.mark(session, server, DistributionStatus::Stale) {
                    return self.enter_exception(e.to_string(), None);
                }
                self.enter_exception(
                    format!("application server {server} rejected configuration: {reason}"),
                    Some(entity),
                )
            }
        }
    }

    fn purge_response(&mut self, model: &mut Model, purge: PurgeId, response: Response) -> Vec<Action> {
        let Some(node) = model.servers.purge_mut(purge) else {
            debug!(target: "af.fsm.server_mgmt", purge = %purge, "Discarding response for finished purge");
            return Vec::new();
        };
        node.status = PurgeStatus::Pending;
        let (session, server, withdraw) = (node.session, node.server, node.withdraw);
        let entity = Fault::Purge(purge);

        match response.outcome {
            Outcome::Ack => {
                model.finish_purge(purge);
                info!(
                    target: "af.fsm.server_mgmt",
                    purge = %purge,
                    session = %session,
                    server = %server,
                    withdraw,
                    "Purge acknowledged"
                );
                self.settle(entity);
                if self.probing.is_none() {
                    self.recovery.succeeded();
                }
                if withdraw {
                    withdrawn(model, session, server)
                } else {
                    Vec::new()
                }
            }
            Outcome::Transient(_) | Outcome::TimedOut => {
                node.attempts += 1;
                let attempts = node.attempts;
                if self.retry.allows_retry(attempts) {
                    debug!(
                        target: "af.fsm.server_mgmt",
                        purge = %purge,
                        attempts,
                        outcome = response.outcome.as_str(),
                        "Purge failed; retrying"
                    );
                    vec![Action::Schedule {
                        delay: self.retry.delay(attempts - 1),
                        event: Event::purge(purge),
                    }]
                } else {
                    self.settle(entity);
                    abandon_purge(model, purge)
                }
            }
            Outcome::Protocol(reason) => self.enter_exception(
                format!("application server {server} rejected purge {purge}: {reason}"),
                Some(entity),
            ),
        }
    }

    fn admin(&mut self, model: &mut Model, server: Option<ServerId>, admin: ServerAdmin) -> Vec<Action> {
        match admin {
            ServerAdmin::Register {
                address,
                respond_to,
            } => {
                let host = address.canonical_hostname.clone();
                let (id, created) = model.servers.register_server(address);
                if created {
                    info!(target: "af.fsm.server_mgmt", server = %id, host = %host, "Application server registered");
                }
                let _ = respond_to.send(model.server_summary(id));
            }
            ServerAdmin::Deregister { respond_to } => {
                let result = server
                    .ok_or_else(|| AfError::NotFound("application server reference missing".to_string()))
                    .and_then(|id| model.servers.deregister_server(id).map(|node| (id, node)))
                    .map(|(id, node)| {
                        info!(
                            target: "af.fsm.server_mgmt",
                            server = %id,
                            host = %node.address.canonical_hostname,
                            "Application server deregistered"
                        );
                    });
                let _ = respond_to.send(result);
            }
            ServerAdmin::List { respond_to } => {
                let _ = respond_to.send(Ok(model.server_summaries()));
            }
        }
        Vec::new()
    }

    fn serve(&mut self, model: &mut Model, event: Event) -> Vec<Action> {
        let Event {
            session,
            server,
            purge,
            payload,
        } = event;

        match payload {
            Payload::Local(LocalRequest { kind, .. }) => match (kind, session, server, purge) {
                (RequestKind::Distribute, Some(session), Some(server), _) => {
                    self.distribute(model, session, server)
                }
                (RequestKind::Purge, _, _, Some(purge)) => self.send_purge(model, purge),
                (RequestKind::Resync, _, _, _) => self.resync(model),
                (kind, ..) => {
                    warn!(target: "af.fsm.server_mgmt", kind = ?kind, "Malformed local request");
                    Vec::new()
                }
            },
            Payload::Response(response) => match (response.kind.is_purge(), session, server, purge) {
                (true, _, _, Some(purge)) => self.purge_response(model, purge, response),
                (false, Some(session), Some(server), _) => {
                    self.distribution_response(model, session, server, response)
                }
                _ => {
                    warn!(target: "af.fsm.server_mgmt", kind = response.kind.as_str(), "Response without references");
                    Vec::new()
                }
            },
            Payload::Server(admin) => self.admin(model, server, admin),
            other => super::refuse(Interface::ServerManagement, self.state, Event::new(other)),
        }
    }
}

/// Event that re-sends the request behind a fault.
fn probe(model: &mut Model, fault: Fault) -> Event {
    match fault {
        Fault::Distribution { session, server } => {
            if let Some(entry) = model.servers.entry_mut(session, server) {
                entry.exhausted = false;
            }
            Event::distribute(session, server)
        }
        Fault::Purge(purge) => Event::purge(purge),
    }
}

/// Stop retrying a pair; it stays stale until the next update or reload.
fn give_up_distribution(
    model: &mut Model,
    session: ProvisioningSessionId,
    server: ServerId,
) -> Option<Report> {
    let entry = model.servers.entry_mut(session, server)?;
    if entry.status == DistributionStatus::PurgePending {
        return None;
    }
    entry.exhausted = true;
    warn!(
        target: "af.fsm.server_mgmt",
        session = %session,
        server = %server,
        version = entry.version,
        attempts = entry.attempts,
        "Distribution abandoned; server is permanently stale"
    );
    Some(Report::PermanentlyStale {
        session,
        server,
        version: entry.version,
    })
}

/// Drop a purge that cannot be delivered.
///
/// An abandoned withdrawal still releases the pair. An abandoned content
/// purge leaves the server holding content it should not serve, so the pair
/// is flagged permanently stale.
fn abandon_purge(model: &mut Model, purge: PurgeId) -> Vec<Action> {
    let Some(node) = model.finish_purge(purge) else {
        return Vec::new();
    };
    warn!(
        target: "af.fsm.server_mgmt",
        purge = %purge,
        session = %node.session,
        server = %node.server,
        attempts = node.attempts,
        "Purge abandoned"
    );

    let mut actions = vec![Action::Report(Report::PurgeAbandoned {
        purge,
        session: node.session,
        server: node.server,
    })];

    if node.withdraw {
        actions.extend(withdrawn(model, node.session, node.server));
        return actions;
    }

    let holds_content = model.servers.entry(node.session, node.server).is_some_and(|e| {
        matches!(e.status, DistributionStatus::Uploaded | DistributionStatus::Stale)
    });
    if holds_content && model.servers.mark(node.session, node.server, DistributionStatus::Stale).is_ok() {
        actions.extend(
            give_up_distribution(model, node.session, node.server).map(Action::Report),
        );
    }
    actions
}

/// A withdrawal finished (or was given up): forget the pair and release the
/// session if that was its last one.
fn withdrawn(model: &mut Model, session: ProvisioningSessionId, server: ServerId) -> Vec<Action> {
    if let Err(e) = model.remove_pair(session, server) {
        debug!(target: "af.fsm.server_mgmt", session = %session, server = %server, error = %e, "Pair already removed");
    }
    if model.is_drained(session) {
        vec![Action::Emit(released(session))]
    } else {
        Vec::new()
    }
}

impl StateMachine for ServerManagementFsm {
    fn interface(&self) -> Interface {
        Interface::ServerManagement
    }

    fn state(&self) -> FsmState {
        self.state
    }

    fn handle(&mut self, model: &mut Model, event: Event) -> Vec<Action> {
        if let Payload::Lifecycle(lifecycle) = &event.payload {
            let signal = lifecycle.signal;
            return self.lifecycle(model, signal);
        }

        match self.state {
            FsmState::Functional => self.serve(model, event),
            FsmState::Exception => {
                debug!(target: "af.fsm.server_mgmt", event = event.name(), "Deferring event during exception");
                self.recovery.defer(event);
                Vec::new()
            }
            FsmState::Initial | FsmState::Final => {
                super::refuse(Interface::ServerManagement, self.state, event)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::ApplicationServerAddress;
    use crate::events::outbound::OutboundRequest;
    use crate::fsm::tests_support::{config_with, document, emitted, model, rule, sent, server};
    use reqwest::Method;
    use tokio::sync::oneshot;

    fn started(model: &mut Model) -> ServerManagementFsm {
        let mut fsm = ServerManagementFsm::new(&config_with(&[]));
        fsm.handle(model, Event::lifecycle(Interface::ServerManagement, LifecycleSignal::Start));
        fsm
    }

    fn session_on(model: &mut Model, hosts: &[&str]) -> ProvisioningSessionId {
        let rules = hosts.iter().map(|h| rule(h, "/live/")).collect();
        model.create_session(document(rules)).unwrap().0
    }

    fn send_one(fsm: &mut ServerManagementFsm, model: &mut Model, event: Event) -> OutboundRequest {
        let mut requests = sent(fsm.handle(model, event));
        assert_eq!(requests.len(), 1);
        requests.pop().unwrap()
    }

    fn status(model: &Model, session: ProvisioningSessionId, server: ServerId) -> DistributionStatus {
        model.servers.entry(session, server).unwrap().status
    }

    #[test]
    fn test_distribute_then_ack_marks_uploaded() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");

        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
        assert_eq!(request.kind, OutboundKind::CreateConfiguration);
        assert_eq!(request.method, Method::POST);
        assert!(model.servers.entry(id, as1).unwrap().in_flight);

        // A duplicate trigger while in flight sends nothing.
        assert!(fsm.handle(&mut model, Event::distribute(id, as1)).is_empty());

        fsm.handle(&mut model, request.response(Outcome::Ack));
        assert_eq!(status(&model, id, as1), DistributionStatus::Uploaded);
        assert!(!model.servers.entry(id, as1).unwrap().in_flight);
    }

    #[test]
    fn test_redistribution_after_upload_uses_update() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");
        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
        fsm.handle(&mut model, request.response(Outcome::Ack));

        let mut doc = document(vec![rule("as1.example.com", "/live/")]);
        doc.name = "renamed".to_string();
        model.update_session(id, doc).unwrap();
        assert_eq!(status(&model, id, as1), DistributionStatus::Stale);

        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
        assert_eq!(request.kind, OutboundKind::UpdateConfiguration);
        assert_eq!(request.version, 2);
    }

    #[test]
    fn test_transient_failures_exhaust_into_permanent_stale() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");

        // max attempts is 3: two retries are scheduled, the third failure gives up.
        for attempt in 1..=3u32 {
            let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
            let actions = fsm.handle(&mut model, request.response(Outcome::TimedOut));
            assert_eq!(status(&model, id, as1), DistributionStatus::Stale);

            if attempt < 3 {
                assert!(matches!(
                    actions.as_slice(),
                    [Action::Schedule { delay, .. }] if *delay == Duration::from_millis(100 * 2u64.pow(attempt - 1))
                ));
            } else {
                assert!(matches!(
                    actions.as_slice(),
                    [Action::Report(Report::PermanentlyStale { version: 1, .. })]
                ));
            }
        }

        assert!(model.servers.entry(id, as1).unwrap().exhausted);
        assert!(fsm.handle(&mut model, Event::distribute(id, as1)).is_empty());
    }

    #[test]
    fn test_resync_revives_exhausted_pairs() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");
        model.servers.entry_mut(id, as1).unwrap().exhausted = true;

        let actions = fsm.handle(
            &mut model,
            Event::local(crate::events::ServiceType::ApplicationServer, RequestKind::Resync),
        );
        assert_eq!(emitted(&actions).len(), 1);
        assert!(!model.servers.entry(id, as1).unwrap().exhausted);
    }

    #[test]
    fn test_outdated_response_is_discarded_and_redistributed() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");
        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));

        let mut doc = document(vec![rule("as1.example.com", "/live/")]);
        doc.name = "v2".to_string();
        model.update_session(id, doc).unwrap();

        let actions = fsm.handle(&mut model, request.response(Outcome::Ack));
        assert_eq!(status(&model, id, as1), DistributionStatus::NotUploaded);
        assert_eq!(emitted(&actions).len(), 1);

        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
        assert_eq!(request.kind, OutboundKind::UpdateConfiguration);
    }

    #[test]
    fn test_withdraw_ack_releases_session() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");
        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
        fsm.handle(&mut model, request.response(Outcome::Ack));

        let plan = model.delete_session(id).unwrap();
        assert_eq!(plan.purges.len(), 1);

        let withdraw = send_one(&mut fsm, &mut model, Event::purge(plan.purges[0]));
        assert_eq!(withdraw.method, Method::DELETE);

        let actions = fsm.handle(&mut model, withdraw.response(Outcome::Ack));
        assert!(model.servers.servers_for(id).is_empty());
        assert_eq!(
            emitted(&actions).first().map(|e| e.name()),
            Some("provisioning.released")
        );
    }

    #[test]
    fn test_abandoned_withdrawal_still_releases() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");
        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
        fsm.handle(&mut model, request.response(Outcome::Ack));
        let purge = model.delete_session(id).unwrap().purges[0];

        let mut last = Vec::new();
        for _ in 0..3 {
            let withdraw = send_one(&mut fsm, &mut model, Event::purge(purge));
            last = fsm.handle(&mut model, withdraw.response(Outcome::Transient("reset".to_string())));
        }

        assert!(last
            .iter()
            .any(|a| matches!(a, Action::Report(Report::PurgeAbandoned { .. }))));
        assert!(emitted(&last).iter().any(|e| e.name() == "provisioning.released"));
        assert!(model.servers.purge(purge).is_none());
    }

    #[test]
    fn test_response_for_deleted_pair_is_discarded() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");
        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));

        model.delete_session(id).unwrap();
        let actions = fsm.handle(&mut model, request.response(Outcome::Ack));

        assert!(actions.is_empty());
        assert_eq!(status(&model, id, as1), DistributionStatus::PurgePending);
    }

    #[test]
    fn test_protocol_error_enters_exception_and_probes_on_recovery() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");
        let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));

        let actions = fsm.handle(&mut model, request.response(Outcome::Protocol("400".to_string())));
        assert_eq!(fsm.state(), FsmState::Exception);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Schedule { event, .. } if event.name() == "lifecycle.recover")));

        // Work arriving during the exception waits.
        let (tx, _rx) = oneshot::channel();
        assert!(fsm
            .handle(&mut model, Event::new(Payload::Server(ServerAdmin::List { respond_to: tx })))
            .is_empty());

        let actions = fsm.handle(
            &mut model,
            Event::lifecycle(Interface::ServerManagement, LifecycleSignal::Recover),
        );
        assert_eq!(fsm.state(), FsmState::Functional);
        let names: Vec<&str> = emitted(&actions).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["local.distribute", "server.list"]);
    }

    #[test]
    fn test_repeated_protocol_errors_isolate_the_pair() {
        let mut model = model();
        // Recovery budget of 2.
        let mut fsm = started(&mut model);
        let id = session_on(&mut model, &["as1.example.com"]);
        let as1 = server(&model, "as1.example.com");

        let recover = || Event::lifecycle(Interface::ServerManagement, LifecycleSignal::Recover);
        let mut actions = Vec::new();
        for _ in 0..3 {
            let request = send_one(&mut fsm, &mut model, Event::distribute(id, as1));
            fsm.handle(&mut model, request.response(Outcome::Protocol("400".to_string())));
            actions = fsm.handle(&mut model, recover());
        }

        assert_eq!(fsm.state(), FsmState::Functional);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Report(Report::PermanentlyStale { .. }))));
        assert!(model.servers.entry(id, as1).unwrap().exhausted);
    }

    #[test]
    fn test_register_is_idempotent_and_deregister_requires_idle_server() {
        let mut model = model();
        let mut fsm = started(&mut model);
        let address = ApplicationServerAddress::parse("as3.example.com").unwrap();

        let (tx, mut rx) = oneshot::channel();
        fsm.handle(
            &mut model,
            Event::new(Payload::Server(ServerAdmin::Register {
                address: address.clone(),
                respond_to: tx,
            })),
        );
        let first = rx.try_recv().unwrap().unwrap();

        let (tx, mut rx) = oneshot::channel();
        fsm.handle(
            &mut model,
            Event::new(Payload::Server(ServerAdmin::Register {
                address,
                respond_to: tx,
            })),
        );
        assert_eq!(rx.try_recv().unwrap().unwrap().id, first.id);
        assert_eq!(model.servers.len(), 3);

        let busy = server(&model, "as1.example.com");
        session_on(&mut model, &["as1.example.com"]);
        let (tx, mut rx) = oneshot::channel();
        fsm.handle(
            &mut model,
            Event::new(Payload::Server(ServerAdmin::Deregister { respond_to: tx })).with_server(busy),
        );
        assert!(matches!(rx.try_recv().unwrap(), Err(AfError::Conflict(_))));

        let (tx, mut rx) = oneshot::channel();
        fsm.handle(
            &mut model,
            Event::new(Payload::Server(ServerAdmin::Deregister { respond_to: tx })).with_server(first.id),
        );
        rx.try_recv().unwrap().unwrap();
        assert_eq!(model.servers.len(), 2);
    }
}
