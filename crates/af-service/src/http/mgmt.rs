//! Management interface.
//!
//! - `GET /maf-mgmt/v1/application-servers` - Known servers and their load
//! - `POST /maf-mgmt/v1/application-servers` - Register a server (idempotent
//!   by canonical hostname)
//! - `DELETE /maf-mgmt/v1/application-servers/:id` - Forget an idle server
//! - `POST /maf-mgmt/v1/reload` - Redistribute stale configurations and
//!   resend pending purges
//! - `/health`, `/ready`, `/metrics`
//!
//! Bound to loopback by default; nothing here is authenticated.

use super::{parse_json, AppState};
use crate::config::ApplicationServerAddress;
use crate::context::ServerSummary;
use crate::errors::AfError;
use crate::observability::{health_router, HealthState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use common::types::ServerId;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

pub fn router(
    state: Arc<AppState>,
    health: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let admin = Router::new()
        .route(
            "/maf-mgmt/v1/application-servers",
            get(list_servers).post(register_server),
        )
        .route(
            "/maf-mgmt/v1/application-servers/:id",
            delete(deregister_server),
        )
        .route("/maf-mgmt/v1/reload", post(reload))
        .with_state(state);

    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    admin.merge(health_router(health)).merge(metrics)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerRequest {
    pub canonical_hostname: String,
    /// M3 base URL; defaults to `http://{canonicalHostname}:7777`.
    #[serde(default)]
    pub m3_base_url: Option<String>,
}

impl RegisterServerRequest {
    fn address(&self) -> Result<ApplicationServerAddress, AfError> {
        let entry = match &self.m3_base_url {
            Some(url) => format!("{}={url}", self.canonical_hostname),
            None => self.canonical_hostname.clone(),
        };
        ApplicationServerAddress::parse(&entry).map_err(|e| AfError::Validation(e.to_string()))
    }
}

#[instrument(skip_all, name = "af.mgmt.list_servers")]
pub async fn list_servers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ServerSummary>>, AfError> {
    Ok(Json(state.dispatcher.list_servers().await?))
}

#[instrument(skip_all, name = "af.mgmt.register_server")]
pub async fn register_server(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ServerSummary>), AfError> {
    let request: RegisterServerRequest = parse_json(&body)?;
    let summary = state.dispatcher.register_server(request.address()?).await?;

    info!(target: "af.http.mgmt", server = %summary.id, host = %summary.canonical_hostname, "Application server registered");
    Ok((StatusCode::CREATED, Json(summary)))
}

#[instrument(skip_all, name = "af.mgmt.deregister_server", fields(server = %id))]
pub async fn deregister_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AfError> {
    let server: ServerId = id
        .parse()
        .map_err(|_| AfError::NotFound(format!("application server {id}")))?;
    state.dispatcher.deregister_server(server).await?;

    info!(target: "af.http.mgmt", server = %server, "Application server deregistered");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, name = "af.mgmt.reload")]
pub async fn reload(State(state): State<Arc<AppState>>) -> Result<StatusCode, AfError> {
    state.dispatcher.reload().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
