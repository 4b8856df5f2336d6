//! Interface state machines.
//!
//! Four machines share one event space: the overall AF lifecycle, M1
//! provisioning, M3 server management and core signaling. Each is a plain
//! struct with an explicit state x event table in its `handle` method.
//! Handlers never perform I/O; they mutate the `Model` and return the
//! `Action`s the dispatcher must carry out.
//!
//! Every machine walks the same states:
//!
//! ```text
//! Initial --start--> Functional --fault--> Exception --recovered--> Functional
//!                        |                     |
//!                        +------stop-----------+--exhausted--> Final
//! ```

pub mod af;
pub mod provisioning;
pub mod server_mgmt;
pub mod signaling;

#[cfg(test)]
pub(crate) mod tests_support;

use crate::config::Config;
use crate::context::Model;
use crate::errors::AfError;
use crate::events::outbound::OutboundRequest;
use crate::events::Event;
use crate::transport::{NfProfile, RegistrationHandle};
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

pub use af::AfFsm;
pub use provisioning::ProvisioningFsm;
pub use server_mgmt::ServerManagementFsm;
pub use signaling::SignalingFsm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmState {
    Initial,
    Functional,
    Exception,
    Final,
}

impl FsmState {
    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Initial => "initial",
            FsmState::Functional => "functional",
            FsmState::Exception => "exception",
            FsmState::Final => "final",
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Overall AF lifecycle.
    Af,
    /// M1 provisioning.
    Provisioning,
    /// M3 application server management.
    ServerManagement,
    /// Core network signaling (registry).
    Signaling,
}

impl Interface {
    pub const ALL: [Interface; 4] = [
        Interface::Af,
        Interface::Provisioning,
        Interface::ServerManagement,
        Interface::Signaling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Interface::Af => "af",
            Interface::Provisioning => "provisioning",
            Interface::ServerManagement => "server_management",
            Interface::Signaling => "signaling",
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect requested by a transition.
#[derive(Debug)]
pub enum Action {
    /// Queue an event behind the current one.
    Emit(Event),
    /// Execute an outbound M3 request; the response comes back as an event.
    Send(OutboundRequest),
    /// Submit `event` after `delay`.
    Schedule { delay: Duration, event: Event },
    /// Register with the core registry.
    Register(NfProfile),
    /// Deregister from the core registry.
    Deregister(RegistrationHandle),
    /// Surface a condition to operators.
    Report(Report),
    /// Stop the dispatcher loop.
    Halt,
}

/// Operator-visible conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Distribution gave up; the server keeps an outdated configuration.
    PermanentlyStale {
        session: ProvisioningSessionId,
        server: ServerId,
        version: u64,
    },
    /// A purge was dropped after its retry bound.
    PurgeAbandoned {
        purge: PurgeId,
        session: ProvisioningSessionId,
        server: ServerId,
    },
    Fault {
        interface: Interface,
        reason: String,
    },
    Recovered {
        interface: Interface,
    },
    /// A non-essential interface reached final after failing to recover.
    InterfaceFailed {
        interface: Interface,
    },
}

impl Report {
    pub fn kind(&self) -> &'static str {
        match self {
            Report::PermanentlyStale { .. } => "permanently_stale",
            Report::PurgeAbandoned { .. } => "purge_abandoned",
            Report::Fault { .. } => "fault",
            Report::Recovered { .. } => "recovered",
            Report::InterfaceFailed { .. } => "interface_failed",
        }
    }
}

/// A state machine driven by the dispatcher.
pub trait StateMachine: Send {
    fn interface(&self) -> Interface;

    fn state(&self) -> FsmState;

    /// Apply one event. Runs to completion; never blocks.
    fn handle(&mut self, model: &mut Model, event: Event) -> Vec<Action>;
}

/// The four machine instances.
#[derive(Debug)]
pub struct Machines {
    pub af: AfFsm,
    pub provisioning: ProvisioningFsm,
    pub server_mgmt: ServerManagementFsm,
    pub signaling: SignalingFsm,
}

impl Machines {
    pub fn new(config: &Config) -> Self {
        Self {
            af: AfFsm::new(),
            provisioning: ProvisioningFsm::new(config.exception_recovery_attempts),
            server_mgmt: ServerManagementFsm::new(config),
            signaling: SignalingFsm::new(config),
        }
    }

    pub fn get_mut(&mut self, interface: Interface) -> &mut dyn StateMachine {
        match interface {
            Interface::Af => &mut self.af,
            Interface::Provisioning => &mut self.provisioning,
            Interface::ServerManagement => &mut self.server_mgmt,
            Interface::Signaling => &mut self.signaling,
        }
    }

    pub fn state(&self, interface: Interface) -> FsmState {
        match interface {
            Interface::Af => self.af.state(),
            Interface::Provisioning => self.provisioning.state(),
            Interface::ServerManagement => self.server_mgmt.state(),
            Interface::Signaling => self.signaling.state(),
        }
    }
}

/// Exception-state bookkeeping: deferred events and the recovery budget.
#[derive(Debug)]
pub struct Recovery {
    deferred: VecDeque<Event>,
    attempts: u32,
    max_attempts: u32,
}

impl Recovery {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            deferred: VecDeque::new(),
            attempts: 0,
            max_attempts,
        }
    }

    /// Hold an event until the machine is functional again.
    pub fn defer(&mut self, event: Event) {
        self.deferred.push_back(event);
    }

    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Spend one recovery attempt. `false` once the budget is used up.
    pub fn try_recover(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the budget after a clean operation.
    pub fn succeeded(&mut self) {
        self.attempts = 0;
    }

    /// Deferred events in arrival order, as emits.
    pub fn replay(&mut self) -> Vec<Action> {
        self.deferred.drain(..).map(Action::Emit).collect()
    }

    /// Answer every deferred request with `error` and drop the rest.
    pub fn abandon(&mut self, error: &AfError) {
        for event in self.deferred.drain(..) {
            event.reject(error.clone());
        }
    }
}

/// Refuse an event that reached a machine unable to serve it.
pub(crate) fn refuse(interface: Interface, state: FsmState, event: Event) -> Vec<Action> {
    tracing::debug!(
        target: "af.fsm",
        interface = %interface,
        state = %state,
        event = event.name(),
        "Event refused"
    );
    event.reject(AfError::Unavailable(format!("{interface} interface is {state}")));
    Vec::new()
}
