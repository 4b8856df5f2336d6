//! Event model.
//!
//! Every input to the FSM core is an `Event`: optional references to a
//! session, a server and a purge operation, plus a payload. References are
//! ids that the dispatcher resolves against the context before routing.
//! Requests that expect an answer carry a oneshot reply channel.

pub mod outbound;

use crate::config::ApplicationServerAddress;
use crate::context::cache_control::DocumentKind;
use crate::context::provisioning::HostingConfiguration;
use crate::context::{ServedDocument, ServerSummary, SessionStatus, UpdateOutcome};
use crate::errors::AfError;
use crate::fsm::Interface;
use crate::transport::RegistrationHandle;
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use outbound::OutboundKind;
use tokio::sync::oneshot;

/// Reply channel carried by request events.
pub type Reply<T> = oneshot::Sender<Result<T, AfError>>;

#[derive(Debug)]
pub struct Event {
    pub session: Option<ProvisioningSessionId>,
    pub server: Option<ServerId>,
    pub purge: Option<PurgeId>,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    Lifecycle(Lifecycle),
    Provisioning(ProvisioningRequest),
    Local(LocalRequest),
    Response(Response),
    Server(ServerAdmin),
    Signaling(SignalingEvent),
}

/// Lifecycle signal addressed to one FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub target: Interface,
    pub signal: LifecycleSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Start,
    Stop,
    /// Orderly shutdown of the whole AF (overall FSM only).
    Shutdown,
    /// Resynchronise application servers (overall FSM only).
    Reload,
    /// Attempt recovery from the exception state.
    Recover,
    /// A sub-FSM reached final after failing to recover.
    Failed(Interface),
}

/// M1 provisioning requests plus the internal release notification.
#[derive(Debug)]
pub enum ProvisioningRequest {
    Create {
        document: HostingConfiguration,
        respond_to: Reply<ProvisioningSessionId>,
    },
    Update {
        document: HostingConfiguration,
        respond_to: Reply<UpdateOutcome>,
    },
    Delete {
        respond_to: Reply<()>,
    },
    Purge {
        pattern: String,
        respond_to: Reply<usize>,
    },
    Status {
        respond_to: Reply<SessionStatus>,
    },
    Fetch {
        kind: DocumentKind,
        respond_to: Reply<ServedDocument>,
    },
    /// Every distributed copy is gone; drop the session from the store.
    Released,
}

/// Locally originated work for an interface FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRequest {
    pub service: ServiceType,
    pub kind: RequestKind,
}

/// Peer a local request is ultimately aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    ApplicationServer,
    Registry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Push the current document version to one server.
    Distribute,
    /// Send one purge (or withdrawal) operation.
    Purge,
    /// Redistribute every stale pair and resend every pending purge.
    Resync,
    /// (Re-)register with the registry.
    Register,
}

/// Result of one outbound request, returned through the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub kind: OutboundKind,
    /// Document version the request carried.
    pub version: u64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Transient(String),
    TimedOut,
    Protocol(String),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ack => "ack",
            Outcome::Transient(_) => "transient",
            Outcome::TimedOut => "timeout",
            Outcome::Protocol(_) => "protocol_error",
        }
    }
}

/// Application server administration.
#[derive(Debug)]
pub enum ServerAdmin {
    Register {
        address: ApplicationServerAddress,
        respond_to: Reply<ServerSummary>,
    },
    Deregister {
        respond_to: Reply<()>,
    },
    List {
        respond_to: Reply<Vec<ServerSummary>>,
    },
}

#[derive(Debug)]
pub enum SignalingEvent {
    Registered(RegistrationHandle),
    RegistrationFailed(String),
    SubscriptionExpired,
}

impl Event {
    pub fn new(payload: Payload) -> Self {
        Self {
            session: None,
            server: None,
            purge: None,
            payload,
        }
    }

    pub fn lifecycle(target: Interface, signal: LifecycleSignal) -> Self {
        Self::new(Payload::Lifecycle(Lifecycle { target, signal }))
    }

    pub fn local(service: ServiceType, kind: RequestKind) -> Self {
        Self::new(Payload::Local(LocalRequest { service, kind }))
    }

    /// Distribution of the current version of `session` to `server`.
    pub fn distribute(session: ProvisioningSessionId, server: ServerId) -> Self {
        Self::local(ServiceType::ApplicationServer, RequestKind::Distribute)
            .with_session(session)
            .with_server(server)
    }

    /// Transmission of one purge operation.
    pub fn purge(purge: PurgeId) -> Self {
        Self::local(ServiceType::ApplicationServer, RequestKind::Purge).with_purge(purge)
    }

    pub fn provisioning(session: Option<ProvisioningSessionId>, request: ProvisioningRequest) -> Self {
        Self {
            session,
            ..Self::new(Payload::Provisioning(request))
        }
    }

    #[must_use]
    pub fn with_session(mut self, session: ProvisioningSessionId) -> Self {
        self.session = Some(session);
        self
    }

    #[must_use]
    pub fn with_server(mut self, server: ServerId) -> Self {
        self.server = Some(server);
        self
    }

    #[must_use]
    pub fn with_purge(mut self, purge: PurgeId) -> Self {
        self.purge = Some(purge);
        self
    }

    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match &self.payload {
            Payload::Lifecycle(l) => match l.signal {
                LifecycleSignal::Start => "lifecycle.start",
                LifecycleSignal::Stop => "lifecycle.stop",
                LifecycleSignal::Shutdown => "lifecycle.shutdown",
                LifecycleSignal::Reload => "lifecycle.reload",
                LifecycleSignal::Recover => "lifecycle.recover",
                LifecycleSignal::Failed(_) => "lifecycle.failed",
            },
            Payload::Provisioning(p) => match p {
                ProvisioningRequest::Create { .. } => "provisioning.create",
                ProvisioningRequest::Update { .. } => "provisioning.update",
                ProvisioningRequest::Delete { .. } => "provisioning.delete",
                ProvisioningRequest::Purge { .. } => "provisioning.purge",
                ProvisioningRequest::Status { .. } => "provisioning.status",
                ProvisioningRequest::Fetch { .. } => "provisioning.fetch",
                ProvisioningRequest::Released => "provisioning.released",
            },
            Payload::Local(l) => match l.kind {
                RequestKind::Distribute => "local.distribute",
                RequestKind::Purge => "local.purge",
                RequestKind::Resync => "local.resync",
                RequestKind::Register => "local.register",
            },
            Payload::Response(_) => "response",
            Payload::Server(s) => match s {
                ServerAdmin::Register { .. } => "server.register",
                ServerAdmin::Deregister { .. } => "server.deregister",
                ServerAdmin::List { .. } => "server.list",
            },
            Payload::Signaling(s) => match s {
                SignalingEvent::Registered(_) => "signaling.registered",
                SignalingEvent::RegistrationFailed(_) => "signaling.registration_failed",
                SignalingEvent::SubscriptionExpired => "signaling.subscription_expired",
            },
        }
    }

    /// Answer the event's reply channel, if it has one, with `error`.
    ///
    /// Returns whether a reply channel was present.
    pub fn reject(self, error: AfError) -> bool {
        fn answer<T>(respond_to: Reply<T>, error: AfError) -> bool {
            // Receiver may have given up; nothing to do then.
            let _ = respond_to.send(Err(error));
            true
        }

        match self.payload {
            Payload::Provisioning(request) => match request {
                ProvisioningRequest::Create { respond_to, .. } => answer(respond_to, error),
                ProvisioningRequest::Update { respond_to, .. } => answer(respond_to, error),
                ProvisioningRequest::Delete { respond_to } => answer(respond_to, error),
                ProvisioningRequest::Purge { respond_to, .. } => answer(respond_to, error),
                ProvisioningRequest::Status { respond_to } => answer(respond_to, error),
                ProvisioningRequest::Fetch { respond_to, .. } => answer(respond_to, error),
                ProvisioningRequest::Released => false,
            },
            Payload::Server(admin) => match admin {
                ServerAdmin::Register { respond_to, .. } => answer(respond_to, error),
                ServerAdmin::Deregister { respond_to } => answer(respond_to, error),
                ServerAdmin::List { respond_to } => answer(respond_to, error),
            },
            Payload::Lifecycle(_)
            | Payload::Local(_)
            | Payload::Response(_)
            | Payload::Signaling(_) => false,
        }
    }
}
