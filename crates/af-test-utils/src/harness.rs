//! Running AF for integration tests.
//!
//! `TestAf` spawns a real dispatcher over a real context, with the M3 and
//! registry clients replaced by mocks. HTTP tests drive [`TestAf::router`]
//! with `tower::ServiceExt::oneshot`; no socket is bound.

use crate::mock_application_server::MockApplicationServer;
use crate::mock_registry::MockRegistry;
use af_service::config::Config;
use af_service::context::{Context, SessionStatus, TeardownReport};
use af_service::dispatcher::{DispatcherHandle, Transport};
use af_service::fsm::Report;
use af_service::http::{self, AppState};
use af_service::observability::HealthState;
use axum::Router;
use common::types::ProvisioningSessionId;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long [`TestAf::next_report`] and [`TestAf::wait_for_session`] wait.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct TestAf {
    pub dispatcher: DispatcherHandle,
    pub servers: Arc<MockApplicationServer>,
    pub registry: Arc<MockRegistry>,
    pub health: Arc<HealthState>,
    pub config: Arc<Config>,
    reports: mpsc::UnboundedReceiver<Report>,
    task: Option<JoinHandle<TeardownReport>>,
}

impl TestAf {
    /// Spawn with accepting mocks and start every interface.
    pub async fn start(vars: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        Self::start_with(
            vars,
            MockApplicationServer::accepting(),
            MockRegistry::accepting(),
        )
        .await
    }

    /// Spawn with the given mocks and start every interface.
    pub async fn start_with(
        vars: HashMap<String, String>,
        servers: MockApplicationServer,
        registry: MockRegistry,
    ) -> Result<Self, anyhow::Error> {
        let af = Self::spawn_with(vars, servers, registry)?;
        af.dispatcher.start().await?;
        Ok(af)
    }

    /// Spawn without starting; the interfaces stay in their initial state.
    pub fn spawn_with(
        vars: HashMap<String, String>,
        servers: MockApplicationServer,
        registry: MockRegistry,
    ) -> Result<Self, anyhow::Error> {
        let config = Arc::new(Config::from_vars(&vars)?);
        let context = Context::init(Arc::clone(&config))?;

        let servers = Arc::new(servers);
        let registry = Arc::new(registry);
        let transport = Transport {
            application_servers: servers.clone(),
            registry: registry.clone(),
        };

        let health = Arc::new(HealthState::new());
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (dispatcher, task) =
            DispatcherHandle::spawn_observed(context, transport, Arc::clone(&health), reports_tx);

        Ok(Self {
            dispatcher,
            servers,
            registry,
            health,
            config,
            reports,
            task: Some(task),
        })
    }

    /// Every surface merged onto one router, with the production layers.
    ///
    /// The metrics handle comes from a recorder that is never installed, so
    /// tests do not fight over the global recorder.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            dispatcher: self.dispatcher.clone(),
        });
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        let router = http::m1::router(Arc::clone(&state))
            .merge(http::m5::router(Arc::clone(&state)))
            .merge(http::mgmt::router(
                Arc::clone(&state),
                Arc::clone(&self.health),
                metrics_handle,
            ))
            .merge(http::sbi::router(state));

        http::with_layers(router)
    }

    /// Next operator report, if one arrives within [`REPORT_TIMEOUT`].
    pub async fn next_report(&mut self) -> Option<Report> {
        tokio::time::timeout(REPORT_TIMEOUT, self.reports.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the first report matching `predicate`, skipping others.
    pub async fn wait_for_report(&mut self, predicate: impl Fn(&Report) -> bool) -> Option<Report> {
        while let Some(report) = self.next_report().await {
            if predicate(&report) {
                return Some(report);
            }
        }
        None
    }

    /// Poll the session until `predicate` holds.
    ///
    /// Fails if the session disappears or the predicate does not hold within
    /// [`REPORT_TIMEOUT`].
    pub async fn wait_for_session(
        &self,
        id: ProvisioningSessionId,
        predicate: impl Fn(&SessionStatus) -> bool,
    ) -> Result<SessionStatus, anyhow::Error> {
        let poll = async {
            loop {
                let status = self.dispatcher.session_status(id).await?;
                if predicate(&status) {
                    return Ok::<_, anyhow::Error>(status);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(REPORT_TIMEOUT, poll).await?
    }

    /// Poll until the session is gone from the context.
    pub async fn wait_for_release(&self, id: ProvisioningSessionId) -> Result<(), anyhow::Error> {
        let poll = async {
            while self.dispatcher.session_status(id).await.is_ok() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        Ok(tokio::time::timeout(REPORT_TIMEOUT, poll).await?)
    }

    /// Orderly shutdown; returns what the context still held.
    pub async fn shutdown(mut self) -> Result<TeardownReport, anyhow::Error> {
        self.dispatcher.shutdown().await?;
        let task = self
            .task
            .take()
            .ok_or_else(|| anyhow::anyhow!("dispatcher task already joined"))?;
        Ok(tokio::time::timeout(REPORT_TIMEOUT, task).await??)
    }
}

impl Drop for TestAf {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.dispatcher.cancel();
        }
    }
}
