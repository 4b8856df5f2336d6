//! Event dispatcher.
//!
//! One task owns the `Context` and feeds it events from a bounded mailbox.
//! Each mailbox event runs to completion: the selected machine's actions are
//! collected, emitted events are appended to a local FIFO and handled before
//! the next mailbox event, and only then are the external effects carried
//! out. Outbound requests, timers and registry calls run in spawned tasks
//! whose only way back in is the mailbox.
//!
//! # Reference resolution
//!
//! Events name sessions, servers and purges by id. Before routing, every
//! reference is checked against the model; an event with a dangling
//! reference is dropped and, if it carries a reply channel, answered with
//! the matching not-found error.

use crate::config::ApplicationServerAddress;
use crate::context::cache_control::DocumentKind;
use crate::context::provisioning::HostingConfiguration;
use crate::context::{
    Context, Model, ServedDocument, ServerSummary, SessionStatus, TeardownReport, UpdateOutcome,
};
use crate::errors::AfError;
use crate::events::outbound::OutboundRequest;
use crate::events::{
    Event, LifecycleSignal, Outcome, Payload, ProvisioningRequest, Reply, ServerAdmin,
    ServiceType, SignalingEvent,
};
use crate::fsm::{Action, FsmState, Interface, Report};
use crate::observability::{
    record_event, record_event_dropped, record_outbound, record_report, set_mailbox_depth,
    set_servers_known, set_sessions_active, HealthState,
};
use crate::transport::{ApplicationServerClient, NfProfile, RegistrationHandle, RegistryClient};
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Mailbox capacity.
const DISPATCHER_CHANNEL_BUFFER: usize = 1000;

/// How long the dispatcher waits for in-flight deregistrations on exit.
const REGISTRY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Select the machine that owns `event`.
pub fn route(event: &Event) -> Interface {
    match &event.payload {
        Payload::Lifecycle(lifecycle) => lifecycle.target,
        Payload::Provisioning(_) => Interface::Provisioning,
        Payload::Local(local) => match local.service {
            ServiceType::ApplicationServer => Interface::ServerManagement,
            ServiceType::Registry => Interface::Signaling,
        },
        Payload::Response(_) | Payload::Server(_) => Interface::ServerManagement,
        Payload::Signaling(_) => Interface::Signaling,
    }
}

/// A reference that no longer points at anything in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dangling {
    Session(ProvisioningSessionId),
    Server(ServerId),
    Purge(PurgeId),
}

impl Dangling {
    fn reason(self) -> &'static str {
        match self {
            Dangling::Session(_) => "unresolved_session",
            Dangling::Server(_) => "unresolved_server",
            Dangling::Purge(_) => "unresolved_purge",
        }
    }

    fn into_error(self) -> AfError {
        match self {
            Dangling::Session(id) => AfError::SessionNotFound(id),
            Dangling::Server(id) => AfError::ServerNotFound(id),
            Dangling::Purge(id) => AfError::NotFound(format!("purge operation {id}")),
        }
    }
}

fn dangling_reference(model: &Model, event: &Event) -> Option<Dangling> {
    if let Some(id) = event.session {
        if model.sessions.lookup(id).is_none() {
            return Some(Dangling::Session(id));
        }
    }
    if let Some(id) = event.server {
        if model.servers.node(id).is_none() {
            return Some(Dangling::Server(id));
        }
    }
    if let Some(id) = event.purge {
        if model.servers.purge(id).is_none() {
            return Some(Dangling::Purge(id));
        }
    }
    None
}

/// Synchronous core: the context plus the local FIFO of emitted events.
#[derive(Debug)]
pub struct Dispatcher {
    context: Context,
    queue: VecDeque<Event>,
}

impl Dispatcher {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            queue: VecDeque::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn into_context(self) -> Context {
        self.context
    }

    /// Handle `event` and every event it causes to be emitted.
    ///
    /// Returns the external effects in the order the machines produced them.
    /// `Emit` never appears in the result.
    pub fn dispatch(&mut self, event: Event) -> Vec<Action> {
        let mut effects = Vec::new();
        self.queue.push_back(event);

        while let Some(event) = self.queue.pop_front() {
            if let Some(dangling) = dangling_reference(&self.context.model, &event) {
                debug!(
                    target: "af.dispatcher",
                    event = event.name(),
                    reference = ?dangling,
                    "Dropping event with unresolved reference"
                );
                record_event_dropped(dangling.reason());
                event.reject(dangling.into_error());
                continue;
            }

            let interface = route(&event);
            record_event(interface.as_str());
            debug!(
                target: "af.dispatcher",
                event = event.name(),
                interface = %interface,
                state = %self.context.machines.state(interface),
                "Dispatching event"
            );

            let machine = self.context.machines.get_mut(interface);
            for action in machine.handle(&mut self.context.model, event) {
                match action {
                    Action::Emit(emitted) => self.queue.push_back(emitted),
                    other => effects.push(other),
                }
            }
        }

        set_sessions_active(self.context.model.sessions.len());
        set_servers_known(self.context.model.servers.len());
        effects
    }

    /// Whether the AF can serve provisioning traffic.
    pub fn is_ready(&self) -> bool {
        [
            Interface::Af,
            Interface::Provisioning,
            Interface::ServerManagement,
        ]
        .iter()
        .all(|iface| self.context.state(*iface) == FsmState::Functional)
    }
}

/// Outbound clients used by the dispatcher task.
#[derive(Clone)]
pub struct Transport {
    pub application_servers: Arc<dyn ApplicationServerClient>,
    pub registry: Arc<dyn RegistryClient>,
}

/// Handle to the dispatcher task.
///
/// Cloneable; every HTTP surface holds one. All request methods wait for the
/// owning machine's answer.
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<Event>,
    cancel_token: CancellationToken,
}

impl DispatcherHandle {
    /// Spawn the dispatcher task.
    ///
    /// The returned join handle yields the teardown report once the task
    /// exits (after `Halt`, cancellation, or when every handle is dropped).
    pub fn spawn(
        context: Context,
        transport: Transport,
        health: Arc<HealthState>,
    ) -> (Self, JoinHandle<TeardownReport>) {
        Self::launch(context, transport, health, None)
    }

    /// Like [`DispatcherHandle::spawn`], also forwarding every report to
    /// `reports`.
    pub fn spawn_observed(
        context: Context,
        transport: Transport,
        health: Arc<HealthState>,
        reports: mpsc::UnboundedSender<Report>,
    ) -> (Self, JoinHandle<TeardownReport>) {
        Self::launch(context, transport, health, Some(reports))
    }

    fn launch(
        context: Context,
        transport: Transport,
        health: Arc<HealthState>,
        reports: Option<mpsc::UnboundedSender<Report>>,
    ) -> (Self, JoinHandle<TeardownReport>) {
        let (sender, receiver) = mpsc::channel(DISPATCHER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = DispatcherActor {
            dispatcher: Dispatcher::new(context),
            receiver,
            loopback: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            transport,
            health,
            reports,
            registry_tasks: Vec::new(),
        };
        let task = tokio::spawn(actor.run());

        (
            Self {
                sender,
                cancel_token,
            },
            task,
        )
    }

    /// Enqueue one event.
    pub async fn submit(&self, event: Event) -> Result<(), AfError> {
        self.sender
            .send(event)
            .await
            .map_err(|e| AfError::Unavailable(format!("channel send failed: {e}")))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Event) -> Result<T, AfError> {
        let (tx, rx) = oneshot::channel();
        self.submit(build(tx)).await?;

        rx.await
            .map_err(|e| AfError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn create_session(
        &self,
        document: HostingConfiguration,
    ) -> Result<ProvisioningSessionId, AfError> {
        self.request(|respond_to| {
            Event::provisioning(
                None,
                ProvisioningRequest::Create {
                    document,
                    respond_to,
                },
            )
        })
        .await
    }

    pub async fn update_session(
        &self,
        id: ProvisioningSessionId,
        document: HostingConfiguration,
    ) -> Result<UpdateOutcome, AfError> {
        self.request(|respond_to| {
            Event::provisioning(
                Some(id),
                ProvisioningRequest::Update {
                    document,
                    respond_to,
                },
            )
        })
        .await
    }

    pub async fn delete_session(&self, id: ProvisioningSessionId) -> Result<(), AfError> {
        self.request(|respond_to| {
            Event::provisioning(Some(id), ProvisioningRequest::Delete { respond_to })
        })
        .await
    }

    /// Purge cached content matching `pattern` from every server holding the
    /// session. Returns the number of purge operations queued.
    pub async fn purge_session(
        &self,
        id: ProvisioningSessionId,
        pattern: String,
    ) -> Result<usize, AfError> {
        self.request(|respond_to| {
            Event::provisioning(
                Some(id),
                ProvisioningRequest::Purge {
                    pattern,
                    respond_to,
                },
            )
        })
        .await
    }

    pub async fn session_status(&self, id: ProvisioningSessionId) -> Result<SessionStatus, AfError> {
        self.request(|respond_to| {
            Event::provisioning(Some(id), ProvisioningRequest::Status { respond_to })
        })
        .await
    }

    pub async fn fetch_document(
        &self,
        id: ProvisioningSessionId,
        kind: DocumentKind,
    ) -> Result<ServedDocument, AfError> {
        self.request(|respond_to| {
            Event::provisioning(Some(id), ProvisioningRequest::Fetch { kind, respond_to })
        })
        .await
    }

    pub async fn register_server(
        &self,
        address: ApplicationServerAddress,
    ) -> Result<ServerSummary, AfError> {
        self.request(|respond_to| {
            Event::new(Payload::Server(ServerAdmin::Register {
                address,
                respond_to,
            }))
        })
        .await
    }

    pub async fn deregister_server(&self, id: ServerId) -> Result<(), AfError> {
        self.request(|respond_to| {
            Event::new(Payload::Server(ServerAdmin::Deregister { respond_to })).with_server(id)
        })
        .await
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerSummary>, AfError> {
        self.request(|respond_to| Event::new(Payload::Server(ServerAdmin::List { respond_to })))
            .await
    }

    /// Start every interface.
    pub async fn start(&self) -> Result<(), AfError> {
        self.submit(Event::lifecycle(Interface::Af, LifecycleSignal::Start))
            .await
    }

    /// Redistribute stale configurations and resend pending purges.
    pub async fn reload(&self) -> Result<(), AfError> {
        self.submit(Event::lifecycle(Interface::Af, LifecycleSignal::Reload))
            .await
    }

    /// Orderly shutdown; the dispatcher exits once every interface stopped.
    pub async fn shutdown(&self) -> Result<(), AfError> {
        self.submit(Event::lifecycle(Interface::Af, LifecycleSignal::Shutdown))
            .await
    }

    pub async fn subscription_expired(&self) -> Result<(), AfError> {
        self.submit(Event::new(Payload::Signaling(
            SignalingEvent::SubscriptionExpired,
        )))
        .await
    }

    /// Stop the dispatcher immediately, without the orderly shutdown.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct DispatcherActor {
    dispatcher: Dispatcher,
    receiver: mpsc::Receiver<Event>,
    /// Path back into the mailbox for spawned tasks. Weak, so the mailbox
    /// closes once every handle is gone.
    loopback: mpsc::WeakSender<Event>,
    cancel_token: CancellationToken,
    transport: Transport,
    health: Arc<HealthState>,
    reports: Option<mpsc::UnboundedSender<Report>>,
    registry_tasks: Vec<JoinHandle<()>>,
}

impl DispatcherActor {
    #[instrument(skip_all, name = "af.dispatcher")]
    async fn run(mut self) -> TeardownReport {
        info!(target: "af.dispatcher", "Dispatcher started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "af.dispatcher", "Dispatcher received cancellation signal");
                    break;
                }

                event = self.receiver.recv() => {
                    let Some(event) = event else {
                        info!(target: "af.dispatcher", "Dispatcher mailbox closed, exiting");
                        break;
                    };
                    set_mailbox_depth(self.receiver.len());

                    let effects = self.dispatcher.dispatch(event);
                    let halted = self.execute(effects);
                    self.update_health();
                    if halted {
                        info!(target: "af.dispatcher", "All interfaces stopped");
                        break;
                    }
                }
            }
        }

        self.health.set_not_ready();
        self.cancel_token.cancel();
        self.receiver.close();
        let mut rejected = 0usize;
        while let Ok(event) = self.receiver.try_recv() {
            record_event_dropped("dispatcher_stopped");
            if event.reject(AfError::Unavailable("dispatcher stopped".to_string())) {
                rejected += 1;
            }
        }

        self.drain_registry_tasks().await;

        info!(target: "af.dispatcher", rejected, "Dispatcher stopped");
        self.dispatcher.into_context().teardown()
    }

    /// Carry out effects. Returns whether a machine asked to halt.
    fn execute(&mut self, effects: Vec<Action>) -> bool {
        let mut halted = false;
        for effect in effects {
            match effect {
                Action::Send(request) => self.send(request),
                Action::Schedule { delay, event } => self.schedule(delay, event),
                Action::Register(profile) => self.register(profile),
                Action::Deregister(handle) => self.deregister(handle),
                Action::Report(report) => self.report(report),
                Action::Halt => halted = true,
                Action::Emit(event) => {
                    // Dispatch consumes emits; anything left is a late arrival.
                    debug!(target: "af.dispatcher", event = event.name(), "Resubmitting emitted event");
                    self.loop_back(event);
                }
            }
        }
        halted
    }

    fn send(&self, request: OutboundRequest) {
        let client = Arc::clone(&self.transport.application_servers);
        let loopback = self.loopback.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(request.deadline, client.send(&request)).await
            {
                Ok(Ok(())) => Outcome::Ack,
                Ok(Err(AfError::Protocol(reason))) => Outcome::Protocol(reason),
                Ok(Err(e)) => Outcome::Transient(e.to_string()),
                Err(_) => Outcome::TimedOut,
            };
            record_outbound(request.kind.as_str(), outcome.as_str(), started.elapsed());
            debug!(
                target: "af.dispatcher",
                kind = request.kind.as_str(),
                session = %request.session,
                server = %request.server,
                outcome = outcome.as_str(),
                "Outbound request completed"
            );
            deliver(&loopback, request.response(outcome)).await;
        });
    }

    fn schedule(&self, delay: Duration, event: Event) {
        let loopback = self.loopback.clone();
        let cancel = self.cancel_token.child_token();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => deliver(&loopback, event).await,
            }
        });
    }

    fn loop_back(&self, event: Event) {
        let loopback = self.loopback.clone();
        tokio::spawn(async move { deliver(&loopback, event).await });
    }

    fn register(&self, profile: NfProfile) {
        let registry = Arc::clone(&self.transport.registry);
        let loopback = self.loopback.clone();

        tokio::spawn(async move {
            let event = match registry.register(&profile).await {
                Ok(handle) => SignalingEvent::Registered(handle),
                Err(e) => {
                    warn!(target: "af.dispatcher", error = %e, "Registry registration failed");
                    SignalingEvent::RegistrationFailed(e.to_string())
                }
            };
            deliver(&loopback, Event::new(Payload::Signaling(event))).await;
        });
    }

    fn deregister(&mut self, handle: RegistrationHandle) {
        let registry = Arc::clone(&self.transport.registry);
        self.registry_tasks.retain(|task| !task.is_finished());

        self.registry_tasks.push(tokio::spawn(async move {
            match registry.deregister(&handle).await {
                Ok(()) => info!(target: "af.dispatcher", location = %handle.location, "Deregistered from core registry"),
                Err(e) => warn!(target: "af.dispatcher", error = %e, "Registry deregistration failed"),
            }
        }));
    }

    fn report(&self, report: Report) {
        record_report(report.kind());
        match &report {
            Report::PermanentlyStale {
                session,
                server,
                version,
            } => warn!(
                target: "af.dispatcher",
                session = %session,
                server = %server,
                version,
                "Distribution abandoned; server keeps an outdated configuration"
            ),
            Report::PurgeAbandoned {
                purge,
                session,
                server,
            } => warn!(
                target: "af.dispatcher",
                purge = %purge,
                session = %session,
                server = %server,
                "Purge abandoned after retries"
            ),
            Report::Fault { interface, reason } => {
                warn!(target: "af.dispatcher", interface = %interface, reason = %reason, "Interface fault");
            }
            Report::Recovered { interface } => {
                info!(target: "af.dispatcher", interface = %interface, "Interface recovered");
            }
            Report::InterfaceFailed { interface } => {
                error!(target: "af.dispatcher", interface = %interface, "Interface failed");
            }
        }

        if let Some(reports) = &self.reports {
            let _ = reports.send(report);
        }
    }

    fn update_health(&self) {
        if self.dispatcher.is_ready() {
            self.health.set_ready();
        } else {
            self.health.set_not_ready();
        }
    }

    async fn drain_registry_tasks(&mut self) {
        let tasks = std::mem::take(&mut self.registry_tasks);
        if tasks.is_empty() {
            return;
        }

        let drain = async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(target: "af.dispatcher", error = %e, "Registry task failed");
                }
            }
        };
        if tokio::time::timeout(REGISTRY_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(
                target: "af.dispatcher",
                timeout_secs = REGISTRY_DRAIN_TIMEOUT.as_secs(),
                "Timed out waiting for registry calls"
            );
        }
    }
}

/// Submit an event from a spawned task, if the dispatcher is still there.
async fn deliver(loopback: &mpsc::WeakSender<Event>, event: Event) {
    let Some(sender) = loopback.upgrade() else {
        debug!(target: "af.dispatcher", event = event.name(), "Dispatcher gone; dropping event");
        return;
    };
    if sender.send(event).await.is_err() {
        debug!(target: "af.dispatcher", "Dispatcher mailbox closed; dropping event");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::outbound::OutboundKind;
    use crate::events::{LocalRequest, RequestKind, Response};
    use crate::fsm::tests_support::{config_with, document, rule, server};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Context::init(Arc::new(config_with(&[]))).unwrap())
    }

    fn started() -> Dispatcher {
        let mut dispatcher = dispatcher();
        let effects = dispatcher.dispatch(Event::lifecycle(Interface::Af, LifecycleSignal::Start));
        assert!(effects.is_empty());
        dispatcher
    }

    fn create(dispatcher: &mut Dispatcher, hosts: &[&str]) -> (ProvisioningSessionId, Vec<Action>) {
        let rules = hosts.iter().map(|h| rule(h, "/live/")).collect();
        let (tx, mut rx) = oneshot::channel();
        let effects = dispatcher.dispatch(Event::provisioning(
            None,
            ProvisioningRequest::Create {
                document: document(rules),
                respond_to: tx,
            },
        ));
        (rx.try_recv().unwrap().unwrap(), effects)
    }

    fn requests(effects: Vec<Action>) -> Vec<OutboundRequest> {
        effects
            .into_iter()
            .filter_map(|a| match a {
                Action::Send(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_route_table() {
        let local = |service| {
            Event::new(Payload::Local(LocalRequest {
                service,
                kind: RequestKind::Register,
            }))
        };
        assert_eq!(
            route(&Event::lifecycle(Interface::Signaling, LifecycleSignal::Stop)),
            Interface::Signaling
        );
        assert_eq!(
            route(&local(ServiceType::ApplicationServer)),
            Interface::ServerManagement
        );
        assert_eq!(route(&local(ServiceType::Registry)), Interface::Signaling);
        assert_eq!(
            route(&Event::new(Payload::Signaling(SignalingEvent::SubscriptionExpired))),
            Interface::Signaling
        );

        let (tx, _rx) = oneshot::channel();
        assert_eq!(
            route(&Event::new(Payload::Server(ServerAdmin::List { respond_to: tx }))),
            Interface::ServerManagement
        );
    }

    #[test]
    fn test_start_brings_every_interface_up() {
        let dispatcher = started();
        for iface in Interface::ALL {
            assert_eq!(dispatcher.context().state(iface), FsmState::Functional, "{iface}");
        }
        assert!(dispatcher.is_ready());
    }

    #[test]
    fn test_create_runs_emitted_distribution_before_returning() {
        let mut dispatcher = started();
        let (id, effects) = create(&mut dispatcher, &["as1.example.com", "as2.example.com"]);

        let sent = requests(effects);
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|r| r.kind == OutboundKind::CreateConfiguration && r.session == id));
    }

    #[test]
    fn test_unresolved_session_is_answered_not_found() {
        let mut dispatcher = started();
        let missing = ProvisioningSessionId::new();
        let (tx, mut rx) = oneshot::channel();

        let effects = dispatcher.dispatch(Event::provisioning(
            Some(missing),
            ProvisioningRequest::Status { respond_to: tx },
        ));

        assert!(effects.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Err(AfError::SessionNotFound(missing)));
    }

    #[test]
    fn test_unresolved_server_is_answered_not_found() {
        let mut dispatcher = started();
        let (tx, mut rx) = oneshot::channel();

        dispatcher.dispatch(
            Event::new(Payload::Server(ServerAdmin::Deregister { respond_to: tx }))
                .with_server(ServerId(99)),
        );

        assert_eq!(rx.try_recv().unwrap(), Err(AfError::ServerNotFound(ServerId(99))));
    }

    #[test]
    fn test_response_for_unknown_purge_is_dropped() {
        let mut dispatcher = started();
        let (id, _) = create(&mut dispatcher, &["as1.example.com"]);
        let server = server(&dispatcher.context().model, "as1.example.com");

        let response = Event {
            session: Some(id),
            server: Some(server),
            purge: Some(PurgeId(4242)),
            payload: Payload::Response(Response {
                kind: OutboundKind::PurgeResources,
                version: 1,
                outcome: Outcome::Ack,
            }),
        };
        assert!(dispatcher.dispatch(response).is_empty());
    }

    #[test]
    fn test_shutdown_stops_in_reverse_and_halts() {
        let mut dispatcher = started();
        let effects = dispatcher.dispatch(Event::lifecycle(Interface::Af, LifecycleSignal::Shutdown));

        assert!(matches!(effects.last(), Some(Action::Halt)));
        for iface in Interface::ALL {
            assert_eq!(dispatcher.context().state(iface), FsmState::Final, "{iface}");
        }
        assert!(!dispatcher.is_ready());
    }

    #[test]
    fn test_requests_after_shutdown_are_refused() {
        let mut dispatcher = started();
        dispatcher.dispatch(Event::lifecycle(Interface::Af, LifecycleSignal::Shutdown));

        let (tx, mut rx) = oneshot::channel();
        dispatcher.dispatch(Event::provisioning(
            None,
            ProvisioningRequest::Create {
                document: document(vec![rule("as1.example.com", "/live/")]),
                respond_to: tx,
            },
        ));
        assert!(matches!(rx.try_recv().unwrap(), Err(AfError::Unavailable(_))));
    }
}
