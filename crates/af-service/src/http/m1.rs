//! M1 provisioning interface.
//!
//! - `POST /3gpp-m1/v2/provisioning-sessions` - Create a session from a
//!   hosting configuration
//! - `GET /3gpp-m1/v2/provisioning-sessions/:id` - Session resource
//! - `DELETE /3gpp-m1/v2/provisioning-sessions/:id` - Withdraw and delete
//! - `GET|PUT /3gpp-m1/v2/provisioning-sessions/:id/content-hosting-configuration`
//! - `POST /3gpp-m1/v2/provisioning-sessions/:id/content-hosting-configuration/purge`
//!
//! Deletion answers 202: the session stays visible (pending deletion) until
//! every application server has dropped its copy.

use super::{document_response, parse_json, parse_session_id, AppState};
use crate::context::cache_control::DocumentKind;
use crate::context::provisioning::HostingConfiguration;
use crate::context::UpdateOutcome;
use crate::errors::AfError;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::LOCATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::types::ProvisioningSessionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

pub const M1_BASE: &str = "/3gpp-m1/v2";

/// Pattern used when a purge request names none: everything.
const PURGE_ALL_PATTERN: &str = ".*";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/3gpp-m1/v2/provisioning-sessions", post(create_session))
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/content-hosting-configuration",
            get(get_hosting_configuration).put(put_hosting_configuration),
        )
        .route(
            "/3gpp-m1/v2/provisioning-sessions/:id/content-hosting-configuration/purge",
            post(purge_content),
        )
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub provisioning_session_id: ProvisioningSessionId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeAccepted {
    /// Purge operations queued, one per application server holding content.
    pub purge_requests: usize,
}

#[instrument(skip_all, name = "af.m1.create_session")]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AfError> {
    let document: HostingConfiguration = parse_json(&body)?;
    let id = state.dispatcher.create_session(document).await?;

    info!(target: "af.http.m1", session = %id, "Provisioning session created");
    let location = format!("{M1_BASE}/provisioning-sessions/{id}");
    Ok((
        StatusCode::CREATED,
        [(LOCATION, location)],
        Json(CreatedSession {
            provisioning_session_id: id,
        }),
    )
        .into_response())
}

#[instrument(skip_all, name = "af.m1.get_session", fields(session = %id))]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AfError> {
    let id = parse_session_id(&id)?;
    let document = state
        .dispatcher
        .fetch_document(id, DocumentKind::ProvisioningSession)
        .await?;
    Ok(document_response(document, &headers))
}

#[instrument(skip_all, name = "af.m1.delete_session", fields(session = %id))]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AfError> {
    let id = parse_session_id(&id)?;
    state.dispatcher.delete_session(id).await?;
    info!(target: "af.http.m1", session = %id, "Provisioning session deletion accepted");
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip_all, name = "af.m1.get_hosting_configuration", fields(session = %id))]
pub async fn get_hosting_configuration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AfError> {
    let id = parse_session_id(&id)?;
    let document = state
        .dispatcher
        .fetch_document(id, DocumentKind::ContentHostingConfiguration)
        .await?;
    Ok(document_response(document, &headers))
}

#[instrument(skip_all, name = "af.m1.put_hosting_configuration", fields(session = %id))]
pub async fn put_hosting_configuration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AfError> {
    let id = parse_session_id(&id)?;
    let document: HostingConfiguration = parse_json(&body)?;

    match state.dispatcher.update_session(id, document).await? {
        UpdateOutcome::Unchanged => {
            info!(target: "af.http.m1", session = %id, "Hosting configuration unchanged");
        }
        UpdateOutcome::Updated { version, .. } => {
            info!(target: "af.http.m1", session = %id, version, "Hosting configuration updated");
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, name = "af.m1.purge_content", fields(session = %id))]
pub async fn purge_content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PurgeAccepted>, AfError> {
    let id = parse_session_id(&id)?;
    let request: PurgeRequest = if body.is_empty() {
        PurgeRequest::default()
    } else {
        parse_json(&body)?
    };
    let pattern = request
        .pattern
        .unwrap_or_else(|| PURGE_ALL_PATTERN.to_string());

    let purge_requests = state.dispatcher.purge_session(id, pattern).await?;
    Ok(Json(PurgeAccepted { purge_requests }))
}
