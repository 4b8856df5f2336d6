//! SBI callbacks from the core network.
//!
//! `POST /nmsaf-callback/v1/subscription-expiry` tells the AF that its
//! registry subscription lapsed; signaling re-registers. The notification
//! body carries nothing the AF needs, so it is not parsed.

use super::AppState;
use crate::errors::AfError;
use axum::{extract::State, http::StatusCode, routing::post, Router};
use std::sync::Arc;
use tracing::{info, instrument};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/nmsaf-callback/v1/subscription-expiry",
            post(subscription_expiry),
        )
        .with_state(state)
}

#[instrument(skip_all, name = "af.sbi.subscription_expiry")]
pub async fn subscription_expiry(State(state): State<Arc<AppState>>) -> Result<StatusCode, AfError> {
    info!(target: "af.http.sbi", "Registry subscription expiry notified");
    state.dispatcher.subscription_expired().await?;
    Ok(StatusCode::NO_CONTENT)
}
