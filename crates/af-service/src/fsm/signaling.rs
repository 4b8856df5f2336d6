//! Core signaling state machine.
//!
//! Registers the AF with the core registry on start, re-registers when the
//! registry reports the subscription expired and deregisters on stop. With
//! core integration disabled the machine goes straight to functional and
//! never talks to the registry.

use super::{Action, FsmState, Interface, Recovery, Report, StateMachine};
use crate::config::{Config, RetryPolicy};
use crate::context::Model;
use crate::errors::AfError;
use crate::events::{Event, LifecycleSignal, Payload, RequestKind, ServiceType, SignalingEvent};
use crate::transport::{NfProfile, RegistrationHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct SignalingFsm {
    state: FsmState,
    enabled: bool,
    profile: NfProfile,
    handle: Option<RegistrationHandle>,
    registering: bool,
    retry: RetryPolicy,
    recovery: Recovery,
}

impl SignalingFsm {
    pub fn new(config: &Config) -> Self {
        Self {
            state: FsmState::Initial,
            enabled: config.core_integration,
            profile: NfProfile::from_config(config),
            handle: None,
            registering: false,
            retry: config.retry,
            recovery: Recovery::new(config.exception_recovery_attempts),
        }
    }

    /// Current registration, if any.
    pub fn registration(&self) -> Option<&RegistrationHandle> {
        self.handle.as_ref()
    }

    fn register(&mut self) -> Vec<Action> {
        if self.registering {
            debug!(target: "af.fsm.signaling", "Registration already in progress");
            return Vec::new();
        }
        self.registering = true;
        debug!(target: "af.fsm.signaling", nf_instance_id = %self.profile.nf_instance_id, "Registering with core registry");
        vec![Action::Register(self.profile.clone())]
    }

    fn lifecycle(&mut self, model: &Model, signal: LifecycleSignal) -> Vec<Action> {
        match (self.state, signal) {
            (FsmState::Initial, LifecycleSignal::Start) if !self.enabled => {
                self.state = FsmState::Functional;
                info!(target: "af.fsm.signaling", "Core integration disabled");
                Vec::new()
            }
            (FsmState::Initial, LifecycleSignal::Start) => {
                self.profile.fqdn = model.server_name.clone();
                self.register()
            }
            (FsmState::Final, _) => Vec::new(),
            (_, LifecycleSignal::Stop) => {
                self.state = FsmState::Final;
                self.recovery
                    .abandon(&AfError::Unavailable("signaling interface stopped".to_string()));
                info!(target: "af.fsm.signaling", "Signaling interface stopped");
                self.handle.take().map(Action::Deregister).into_iter().collect()
            }
            (state, signal) => {
                debug!(target: "af.fsm.signaling", state = %state, signal = ?signal, "Ignoring lifecycle signal");
                Vec::new()
            }
        }
    }

    fn registered(&mut self, handle: RegistrationHandle) -> Vec<Action> {
        self.registering = false;

        if self.state == FsmState::Final {
            // Stopped while the registration was in flight.
            return vec![Action::Deregister(handle)];
        }

        info!(target: "af.fsm.signaling", location = %handle.location, "Registered with core registry");
        self.handle = Some(handle);
        self.recovery.succeeded();

        let previous = self.state;
        self.state = FsmState::Functional;
        if previous != FsmState::Exception {
            return Vec::new();
        }

        let mut actions = vec![Action::Report(Report::Recovered {
            interface: Interface::Signaling,
        })];
        actions.extend(self.recovery.replay());
        actions
    }

    fn registration_failed(&mut self, reason: String) -> Vec<Action> {
        self.registering = false;
        if self.state == FsmState::Final {
            return Vec::new();
        }

        self.state = FsmState::Exception;
        if !self.recovery.try_recover() {
            error!(target: "af.fsm.signaling", reason = %reason, "Registration retries exhausted");
            self.state = FsmState::Final;
            self.recovery
                .abandon(&AfError::Unavailable("signaling interface failed".to_string()));
            // An earlier registration may still be held by the registry.
            let mut actions: Vec<Action> =
                self.handle.take().map(Action::Deregister).into_iter().collect();
            actions.push(Action::Emit(Event::lifecycle(
                Interface::Af,
                LifecycleSignal::Failed(Interface::Signaling),
            )));
            return actions;
        }

        let delay = self.retry.delay(self.recovery.attempts().saturating_sub(1));
        warn!(
            target: "af.fsm.signaling",
            reason = %reason,
            attempt = self.recovery.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Registration failed; retrying"
        );
        vec![
            Action::Report(Report::Fault {
                interface: Interface::Signaling,
                reason,
            }),
            Action::Schedule {
                delay,
                event: Event::local(ServiceType::Registry, RequestKind::Register),
            },
        ]
    }
}

impl StateMachine for SignalingFsm {
    fn interface(&self) -> Interface {
        Interface::Signaling
    }

    fn state(&self) -> FsmState {
        self.state
    }

    fn handle(&mut self, model: &mut Model, event: Event) -> Vec<Action> {
        match (&event.payload, self.state) {
            (Payload::Lifecycle(lifecycle), _) => {
                let signal = lifecycle.signal;
                self.lifecycle(model, signal)
            }
            (Payload::Signaling(SignalingEvent::Registered(_)), _) => {
                let Payload::Signaling(SignalingEvent::Registered(handle)) = event.payload else {
                    return Vec::new();
                };
                self.registered(handle)
            }
            (Payload::Signaling(SignalingEvent::RegistrationFailed(reason)), _) => {
                let reason = reason.clone();
                self.registration_failed(reason)
            }
            (Payload::Local(local), FsmState::Exception | FsmState::Functional)
                if local.kind == RequestKind::Register && self.enabled =>
            {
                self.register()
            }
            (Payload::Signaling(SignalingEvent::SubscriptionExpired), FsmState::Functional) => {
                if !self.enabled {
                    debug!(target: "af.fsm.signaling", "Ignoring subscription expiry; core integration disabled");
                    return Vec::new();
                }
                info!(target: "af.fsm.signaling", "Subscription expired; re-registering");
                self.register()
            }
            (_, FsmState::Exception) => {
                self.recovery.defer(event);
                Vec::new()
            }
            (_, state) => {
                debug!(target: "af.fsm.signaling", state = %state, event = event.name(), "Ignoring event");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fsm::tests_support::{config_with, emitted, model};

    fn enabled() -> SignalingFsm {
        SignalingFsm::new(&config_with(&[("AF_CORE_INTEGRATION", "true")]))
    }

    fn handle() -> RegistrationHandle {
        RegistrationHandle {
            nf_instance_id: uuid::Uuid::new_v4(),
            location: "http://nrf/nnrf-nfm/v1/nf-instances/1".to_string(),
        }
    }

    fn start() -> Event {
        Event::lifecycle(Interface::Signaling, LifecycleSignal::Start)
    }

    fn signaling(event: SignalingEvent) -> Event {
        Event::new(Payload::Signaling(event))
    }

    #[test]
    fn test_disabled_goes_straight_to_functional() {
        let mut model = model();
        let mut fsm = SignalingFsm::new(&config_with(&[]));

        assert!(fsm.handle(&mut model, start()).is_empty());
        assert_eq!(fsm.state(), FsmState::Functional);
        assert!(fsm
            .handle(&mut model, signaling(SignalingEvent::SubscriptionExpired))
            .is_empty());
    }

    #[test]
    fn test_start_registers_with_resolved_name() {
        let mut model = model();
        let mut fsm = enabled();

        let actions = fsm.handle(&mut model, start());
        assert!(matches!(
            actions.as_slice(),
            [Action::Register(profile)] if profile.fqdn == "af.example.com" && profile.nf_type == "AF"
        ));
        assert_eq!(fsm.state(), FsmState::Initial);

        fsm.handle(&mut model, signaling(SignalingEvent::Registered(handle())));
        assert_eq!(fsm.state(), FsmState::Functional);
        assert!(fsm.registration().is_some());
    }

    #[test]
    fn test_failed_registration_retries_then_recovers() {
        let mut model = model();
        let mut fsm = enabled();
        fsm.handle(&mut model, start());

        let actions = fsm.handle(
            &mut model,
            signaling(SignalingEvent::RegistrationFailed("refused".to_string())),
        );
        assert_eq!(fsm.state(), FsmState::Exception);
        assert!(matches!(
            actions.as_slice(),
            [Action::Report(Report::Fault { .. }), Action::Schedule { .. }]
        ));

        // Expiry during the exception is held back.
        assert!(fsm
            .handle(&mut model, signaling(SignalingEvent::SubscriptionExpired))
            .is_empty());

        let retry = fsm.handle(
            &mut model,
            Event::local(ServiceType::Registry, RequestKind::Register),
        );
        assert!(matches!(retry.as_slice(), [Action::Register(_)]));

        let actions = fsm.handle(&mut model, signaling(SignalingEvent::Registered(handle())));
        assert_eq!(fsm.state(), FsmState::Functional);
        assert!(matches!(actions.first(), Some(Action::Report(Report::Recovered { .. }))));
        assert_eq!(emitted(&actions).len(), 1);
    }

    #[test]
    fn test_exhausted_registration_fails_interface() {
        let mut model = model();
        let mut fsm = enabled();
        fsm.handle(&mut model, start());

        let mut actions = Vec::new();
        for _ in 0..3 {
            actions = fsm.handle(
                &mut model,
                signaling(SignalingEvent::RegistrationFailed("refused".to_string())),
            );
        }

        assert_eq!(fsm.state(), FsmState::Final);
        assert!(matches!(
            emitted(&actions).first().map(|e| &e.payload),
            Some(Payload::Lifecycle(l)) if l.signal == LifecycleSignal::Failed(Interface::Signaling)
        ));
    }

    #[test]
    fn test_exhausted_reregistration_deregisters_previous_profile() {
        let mut model = model();
        let mut fsm = enabled();
        fsm.handle(&mut model, start());
        fsm.handle(&mut model, signaling(SignalingEvent::Registered(handle())));
        fsm.handle(&mut model, signaling(SignalingEvent::SubscriptionExpired));

        let mut actions = Vec::new();
        for _ in 0..3 {
            actions = fsm.handle(
                &mut model,
                signaling(SignalingEvent::RegistrationFailed("refused".to_string())),
            );
        }

        assert_eq!(fsm.state(), FsmState::Final);
        assert!(matches!(actions.first(), Some(Action::Deregister(_))));
        assert_eq!(emitted(&actions).len(), 1);
        assert!(fsm.registration().is_none());

        let stop = fsm.handle(
            &mut model,
            Event::lifecycle(Interface::Signaling, LifecycleSignal::Stop),
        );
        assert!(stop.is_empty());
    }

    #[test]
    fn test_stop_deregisters() {
        let mut model = model();
        let mut fsm = enabled();
        fsm.handle(&mut model, start());
        fsm.handle(&mut model, signaling(SignalingEvent::Registered(handle())));

        let actions = fsm.handle(
            &mut model,
            Event::lifecycle(Interface::Signaling, LifecycleSignal::Stop),
        );
        assert!(matches!(actions.as_slice(), [Action::Deregister(_)]));
        assert_eq!(fsm.state(), FsmState::Final);
    }

    #[test]
    fn test_subscription_expiry_reregisters() {
        let mut model = model();
        let mut fsm = enabled();
        fsm.handle(&mut model, start());
        fsm.handle(&mut model, signaling(SignalingEvent::Registered(handle())));

        let actions = fsm.handle(&mut model, signaling(SignalingEvent::SubscriptionExpired));
        assert!(matches!(actions.as_slice(), [Action::Register(_)]));
    }
}
