//! Overall AF lifecycle.
//!
//! Starts the interface machines in dependency order (server management,
//! provisioning, signaling), stops them in reverse, forwards reloads to
//! server management and decides what a sub-machine failure means for the
//! process.

use super::{Action, FsmState, Interface, Report, StateMachine};
use crate::context::Model;
use crate::events::{Event, LifecycleSignal, Payload, RequestKind, ServiceType};
use tracing::{debug, error, info, warn};

const START_ORDER: [Interface; 3] = [
    Interface::ServerManagement,
    Interface::Provisioning,
    Interface::Signaling,
];

#[derive(Debug)]
pub struct AfFsm {
    state: FsmState,
    shutting_down: bool,
}

impl Default for AfFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl AfFsm {
    pub fn new() -> Self {
        Self {
            state: FsmState::Initial,
            shutting_down: false,
        }
    }

    fn start(&mut self) -> Vec<Action> {
        self.state = FsmState::Functional;
        info!(target: "af.fsm.af", "Starting interfaces");
        START_ORDER
            .iter()
            .map(|iface| Action::Emit(Event::lifecycle(*iface, LifecycleSignal::Start)))
            .collect()
    }

    fn shutdown(&mut self) -> Vec<Action> {
        if self.shutting_down {
            debug!(target: "af.fsm.af", "Shutdown already in progress");
            return Vec::new();
        }
        self.shutting_down = true;
        info!(target: "af.fsm.af", "Stopping interfaces");

        let mut actions: Vec<Action> = START_ORDER
            .iter()
            .rev()
            .map(|iface| Action::Emit(Event::lifecycle(*iface, LifecycleSignal::Stop)))
            .collect();
        actions.push(Action::Emit(Event::lifecycle(
            Interface::Af,
            LifecycleSignal::Stop,
        )));
        actions
    }

    fn failed(&mut self, interface: Interface) -> Vec<Action> {
        match interface {
            Interface::Signaling => {
                warn!(target: "af.fsm.af", "Signaling interface failed; continuing without core integration");
                vec![Action::Report(Report::InterfaceFailed { interface })]
            }
            Interface::Provisioning | Interface::ServerManagement | Interface::Af => {
                error!(target: "af.fsm.af", interface = %interface, "Essential interface failed; shutting down");
                if self.state == FsmState::Functional {
                    self.state = FsmState::Exception;
                }
                let mut actions = vec![Action::Report(Report::Fault {
                    interface: Interface::Af,
                    reason: format!("{interface} interface failed"),
                })];
                actions.extend(self.shutdown());
                actions
            }
        }
    }
}

impl StateMachine for AfFsm {
    fn interface(&self) -> Interface {
        Interface::Af
    }

    fn state(&self) -> FsmState {
        self.state
    }

    fn handle(&mut self, _model: &mut Model, event: Event) -> Vec<Action> {
        let signal = match &event.payload {
            Payload::Lifecycle(lifecycle) => lifecycle.signal,
            _ => return super::refuse(Interface::Af, self.state, event),
        };

        match (self.state, signal) {
            (FsmState::Final, _) => Vec::new(),
            (FsmState::Initial, LifecycleSignal::Start) => self.start(),
            (FsmState::Functional, LifecycleSignal::Reload) => {
                info!(target: "af.fsm.af", "Reload requested");
                vec![Action::Emit(Event::local(
                    ServiceType::ApplicationServer,
                    RequestKind::Resync,
                ))]
            }
            (_, LifecycleSignal::Shutdown) => self.shutdown(),
            (_, LifecycleSignal::Stop) => {
                self.state = FsmState::Final;
                info!(target: "af.fsm.af", "AF stopped");
                vec![Action::Halt]
            }
            (_, LifecycleSignal::Failed(interface)) => self.failed(interface),
            (state, signal) => {
                debug!(target: "af.fsm.af", state = %state, signal = ?signal, "Ignoring lifecycle signal");
                Vec::new()
            }
        }
    }
}
