//! M5 service access interface.
//!
//! `GET /3gpp-m5/v2/service-access-information/:id` serves the entry points
//! media clients use for a provisioning session, with the same conditional
//! GET support as the M1 documents.

use super::{document_response, parse_session_id, AppState};
use crate::context::cache_control::DocumentKind;
use crate::errors::AfError;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::instrument;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/3gpp-m5/v2/service-access-information/:id",
            get(get_service_access_information),
        )
        .with_state(state)
}

#[instrument(skip_all, name = "af.m5.service_access_information", fields(session = %id))]
pub async fn get_service_access_information(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AfError> {
    let id = parse_session_id(&id)?;
    let document = state
        .dispatcher
        .fetch_document(id, DocumentKind::ServiceAccessInformation)
        .await?;
    Ok(document_response(document, &headers))
}
