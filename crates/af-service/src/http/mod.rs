//! HTTP surfaces of the Application Function.
//!
//! - M1 provisioning (`/3gpp-m1/v2`)
//! - M5 service access (`/3gpp-m5/v2`)
//! - Management (`/maf-mgmt/v1`, `/health`, `/ready`, `/metrics`)
//! - SBI callbacks from the core registry (`/nmsaf-callback/v1`)
//!
//! Handlers only translate between HTTP and dispatcher requests; every
//! decision is taken by the state machines behind the dispatcher.

pub mod m1;
pub mod m5;
pub mod middleware;
pub mod mgmt;
pub mod sbi;

use crate::config::Config;
use crate::context::ServedDocument;
use crate::dispatcher::DispatcherHandle;
use crate::errors::AfError;
use crate::observability::HealthState;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LAST_MODIFIED};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{body::Body, Router};
use common::types::ProvisioningSessionId;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Upper bound for one HTTP request, including the wait for the dispatcher.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatcherHandle,
}

/// Apply the common middleware stack.
///
/// Layer order (bottom-to-top execution):
/// 1. TimeoutLayer (innermost)
/// 2. TraceLayer
/// 3. http_metrics_middleware (outermost, sees every response)
pub fn with_layers(router: Router) -> Router {
    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(HTTP_REQUEST_TIMEOUT))
        .layer(axum::middleware::from_fn(middleware::http_metrics_middleware))
}

/// Group the four surfaces by bind address.
///
/// Surfaces configured on the same address share one listener.
pub fn listeners(
    config: &Config,
    state: Arc<AppState>,
    health: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Vec<(String, Router)> {
    let surfaces = [
        (config.m1_bind_address.clone(), m1::router(Arc::clone(&state))),
        (config.m5_bind_address.clone(), m5::router(Arc::clone(&state))),
        (
            config.mgmt_bind_address.clone(),
            mgmt::router(Arc::clone(&state), health, metrics_handle),
        ),
        (config.sbi_bind_address.clone(), sbi::router(state)),
    ];

    let mut grouped: BTreeMap<String, Router> = BTreeMap::new();
    for (address, router) in surfaces {
        let merged = match grouped.remove(&address) {
            Some(existing) => existing.merge(router),
            None => router,
        };
        grouped.insert(address, merged);
    }

    grouped
        .into_iter()
        .map(|(address, router)| (address, with_layers(router)))
        .collect()
}

/// Parse a provisioning session id from a path segment.
///
/// A malformed id names no session, so it is a 404 rather than a 400.
pub(crate) fn parse_session_id(raw: &str) -> Result<ProvisioningSessionId, AfError> {
    raw.parse()
        .map_err(|_| AfError::NotFound(format!("provisioning session {raw}")))
}

/// Decode a JSON body, answering 400 (not axum's default 422) on failure.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, AfError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "af.http", error = %e, "Invalid request body");
        AfError::Validation(format!("invalid request body: {e}"))
    })
}

/// Write a served document with its cache headers, honouring `If-None-Match`.
pub(crate) fn document_response(document: ServedDocument, headers: &HeaderMap) -> Response {
    let not_modified = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| document.directive.matches(value));

    let builder = Response::builder()
        .header(CACHE_CONTROL, document.directive.cache_control.as_str())
        .header(ETAG, document.directive.etag.as_str())
        .header(LAST_MODIFIED, document.directive.last_modified.as_str());

    let response = if not_modified {
        builder.status(StatusCode::NOT_MODIFIED).body(Body::empty())
    } else {
        builder
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(document.body))
    };

    response.unwrap_or_else(|e| {
        AfError::Internal(format!("failed to build document response: {e}")).into_response()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::cache_control::{compute, CachePolicy, DocumentKind};
    use axum::http::HeaderValue;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;

    fn served() -> ServedDocument {
        let body = br#"{"name":"live"}"#;
        ServedDocument {
            kind: DocumentKind::ContentHostingConfiguration,
            body: Bytes::from_static(body),
            directive: compute(
                body,
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                &CachePolicy {
                    max_age: Duration::from_secs(60),
                    must_revalidate: true,
                },
            ),
        }
    }

    #[tokio::test]
    async fn test_document_response_sets_cache_headers() {
        let document = served();
        let etag = document.directive.etag.clone();
        let response = document_response(document, &HeaderMap::new());

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[CACHE_CONTROL], "max-age=60, must-revalidate");
        assert_eq!(headers[ETAG], etag.as_str());
        assert_eq!(headers[LAST_MODIFIED], "Fri, 01 Mar 2024 12:00:00 GMT");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"name":"live"}"#);
    }

    #[tokio::test]
    async fn test_matching_if_none_match_is_not_modified() {
        let document = served();
        let mut headers = HeaderMap::new();
        headers.insert(
            IF_NONE_MATCH,
            HeaderValue::from_str(&document.directive.etag).unwrap(),
        );

        let response = document_response(document, &headers);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[test]
    fn test_stale_if_none_match_is_served() {
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"0000\""));
        assert_eq!(document_response(served(), &headers).status(), StatusCode::OK);
    }

    #[test]
    fn test_malformed_session_id_is_not_found() {
        assert!(matches!(
            parse_session_id("not-a-uuid"),
            Err(AfError::NotFound(_))
        ));
        let id = ProvisioningSessionId::new();
        assert_eq!(parse_session_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_invalid_json_is_validation_error() {
        let result: Result<serde_json::Value, _> = parse_json(b"{not json");
        assert!(matches!(result, Err(AfError::Validation(_))));
    }
}
