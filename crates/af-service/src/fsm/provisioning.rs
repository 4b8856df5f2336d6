//! M1 provisioning state machine.
//!
//! Serves provisioning requests against the model and turns every accepted
//! change into local distribute/purge events for server management. A
//! deleted session leaves the store only when the `Released` event arrives,
//! which happens once its last distributed copy is gone.

use super::{Action, FsmState, Interface, Recovery, Report, StateMachine};
use crate::context::Model;
use crate::errors::AfError;
use crate::events::{Event, LifecycleSignal, Payload, ProvisioningRequest, Reply};
use common::types::ProvisioningSessionId;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct ProvisioningFsm {
    state: FsmState,
    recovery: Recovery,
}

impl ProvisioningFsm {
    pub fn new(max_recovery_attempts: u32) -> Self {
        Self {
            state: FsmState::Initial,
            recovery: Recovery::new(max_recovery_attempts),
        }
    }

    fn lifecycle(&mut self, model: &mut Model, signal: LifecycleSignal) -> Vec<Action> {
        match (self.state, signal) {
            (FsmState::Initial, LifecycleSignal::Start) => {
                self.state = FsmState::Functional;
                info!(target: "af.fsm.provisioning", "Provisioning interface functional");
                Vec::new()
            }
            (FsmState::Exception, LifecycleSignal::Recover) => self.recover(model),
            (FsmState::Final, _) => Vec::new(),
            (_, LifecycleSignal::Stop) => {
                self.state = FsmState::Final;
                self.recovery
                    .abandon(&AfError::Unavailable("provisioning interface stopped".to_string()));
                info!(target: "af.fsm.provisioning", "Provisioning interface stopped");
                Vec::new()
            }
            (state, signal) => {
                debug!(target: "af.fsm.provisioning", state = %state, signal = ?signal, "Ignoring lifecycle signal");
                Vec::new()
            }
        }
    }

    fn enter_exception(&mut self, reason: String) -> Vec<Action> {
        error!(target: "af.fsm.provisioning", reason = %reason, "Provisioning interface entering exception");
        self.state = FsmState::Exception;
        vec![
            Action::Report(Report::Fault {
                interface: Interface::Provisioning,
                reason,
            }),
            Action::Emit(Event::lifecycle(
                Interface::Provisioning,
                LifecycleSignal::Recover,
            )),
        ]
    }

    fn recover(&mut self, model: &mut Model) -> Vec<Action> {
        if !self.recovery.try_recover() {
            error!(
                target: "af.fsm.provisioning",
                attempts = self.recovery.attempts(),
                "Provisioning recovery exhausted"
            );
            self.state = FsmState::Final;
            self.recovery
                .abandon(&AfError::Unavailable("provisioning interface failed".to_string()));
            return vec![Action::Emit(Event::lifecycle(
                Interface::Af,
                LifecycleSignal::Failed(Interface::Provisioning),
            ))];
        }

        let repairs = model.reconcile();
        self.state = FsmState::Functional;
        info!(
            target: "af.fsm.provisioning",
            repairs,
            deferred = self.recovery.deferred(),
            "Provisioning interface recovered"
        );

        let mut actions = vec![Action::Report(Report::Recovered {
            interface: Interface::Provisioning,
        })];
        actions.extend(self.recovery.replay());
        actions
    }

    /// Reply to the requester and turn internal faults into an exception.
    fn finish<T>(
        &mut self,
        respond_to: Reply<T>,
        result: Result<(T, Vec<Action>), AfError>,
    ) -> Vec<Action> {
        match result {
            Ok((value, actions)) => {
                self.recovery.succeeded();
                let _ = respond_to.send(Ok(value));
                actions
            }
            Err(AfError::Internal(reason)) => {
                let _ = respond_to.send(Err(AfError::Internal(reason.clone())));
                self.enter_exception(reason)
            }
            Err(e) => {
                debug!(target: "af.fsm.provisioning", error = %e, "Provisioning request rejected");
                let _ = respond_to.send(Err(e));
                Vec::new()
            }
        }
    }

    fn serve(&mut self, model: &mut Model, event: Event) -> Vec<Action> {
        let Event {
            session, payload, ..
        } = event;
        let request = match payload {
            Payload::Provisioning(request) => request,
            other => return super::refuse(Interface::Provisioning, self.state, Event::new(other)),
        };

        match request {
            ProvisioningRequest::Create {
                document,
                respond_to,
            } => {
                let result = model.create_session(document).map(|(id, servers)| {
                    info!(target: "af.fsm.provisioning", session = %id, servers = servers.len(), "Provisioning session created");
                    let actions = servers
                        .into_iter()
                        .map(|server| Action::Emit(Event::distribute(id, server)))
                        .collect();
                    (id, actions)
                });
                self.finish(respond_to, result)
            }

            ProvisioningRequest::Update {
                document,
                respond_to,
            } => {
                let result = require(session)
                    .and_then(|id| Ok((id, model.update_session(id, document)?)))
                    .map(|(id, (outcome, plan))| {
                        info!(
                            target: "af.fsm.provisioning",
                            session = %id,
                            distribute = plan.distribute.len(),
                            purges = plan.purges.len(),
                            "Provisioning session updated"
                        );
                        let mut actions: Vec<Action> = plan
                            .distribute
                            .into_iter()
                            .map(|server| Action::Emit(Event::distribute(id, server)))
                            .collect();
                        actions.extend(
                            plan.purges
                                .into_iter()
                                .map(|purge| Action::Emit(Event::purge(purge))),
                        );
                        (outcome, actions)
                    });
                self.finish(respond_to, result)
            }

            ProvisioningRequest::Delete { respond_to } => {
                let result = require(session)
                    .and_then(|id| Ok((id, model.delete_session(id)?)))
                    .map(|(id, plan)| {
                        info!(
                            target: "af.fsm.provisioning",
                            session = %id,
                            withdrawals = plan.purges.len(),
                            "Provisioning session marked for deletion"
                        );
                        let mut actions: Vec<Action> = plan
                            .purges
                            .into_iter()
                            .map(|purge| Action::Emit(Event::purge(purge)))
                            .collect();
                        if plan.drained {
                            actions.push(Action::Emit(released(id)));
                        }
                        ((), actions)
                    });
                self.finish(respond_to, result)
            }

            ProvisioningRequest::Purge {
                pattern,
                respond_to,
            } => {
                let result = require(session)
                    .and_then(|id| model.purge_session(id, &pattern))
                    .map(|purges| {
                        let count = purges.len();
                        let actions = purges
                            .into_iter()
                            .map(|purge| Action::Emit(Event::purge(purge)))
                            .collect();
                        (count, actions)
                    });
                self.finish(respond_to, result)
            }

            ProvisioningRequest::Status { respond_to } => {
                let result = require(session)
                    .and_then(|id| model.session_status(id))
                    .map(|status| (status, Vec::new()));
                self.finish(respond_to, result)
            }

            ProvisioningRequest::Fetch { kind, respond_to } => {
                let result = require(session)
                    .and_then(|id| model.render(id, kind))
                    .map(|document| (document, Vec::new()));
                self.finish(respond_to, result)
            }

            ProvisioningRequest::Released => {
                if let Some(id) = session {
                    if model.release(id) {
                        info!(target: "af.fsm.provisioning", session = %id, "Provisioning session released");
                    } else {
                        warn!(target: "af.fsm.provisioning", session = %id, "Release requested for session still in use");
                    }
                }
                Vec::new()
            }
        }
    }
}

fn require(session: Option<ProvisioningSessionId>) -> Result<ProvisioningSessionId, AfError> {
    session.ok_or_else(|| AfError::NotFound("provisioning session reference missing".to_string()))
}

/// Notification that a deleted session has no distributed copies left.
pub fn released(session: ProvisioningSessionId) -> Event {
    Event::provisioning(Some(session), ProvisioningRequest::Released)
}

impl StateMachine for ProvisioningFsm {
    fn interface(&self) -> Interface {
        Interface::Provisioning
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
                debug!(target: "af.fsm.provisioning", event = event.name(), "Deferring event during exception");
                self.recovery.defer(event);
                Vec::new()
            }
            FsmState::Initial | FsmState::Final => {
                super::refuse(Interface::Provisioning, self.state, event)
            }
        }
    }
}
