//! M3 HTTP client for application servers.

use crate::errors::AfError;
use crate::events::outbound::OutboundRequest;
use crate::transport::{classify_status, ApplicationServerClient};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Connect timeout for application servers.
const M3_CONNECT_TIMEOUT_SECS: u64 = 5;

/// reqwest-backed M3 client. One instance serves every application server;
/// the target is carried by each request.
#[derive(Clone)]
pub struct M3Client {
    client: Client,
}

impl M3Client {
    /// # Errors
    ///
    /// Returns `AfError::Internal` if the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> Result<Self, AfError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(M3_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                error!(target: "af.transport.m3", error = %e, "Failed to build HTTP client");
                AfError::Internal(format!("failed to build M3 client: {e}"))
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ApplicationServerClient for M3Client {
    #[instrument(skip_all, name = "af.transport.m3", fields(kind = request.kind.as_str(), server = %request.server, session = %request.session))]
    async fn send(&self, request: &OutboundRequest) -> Result<(), AfError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url);
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            warn!(target: "af.transport.m3", error = %e, url = %request.url, "M3 request failed");
            AfError::TransientNetwork(format!("M3 request failed: {e}"))
        })?;

        let status = response.status();
        debug!(target: "af.transport.m3", status = %status, "M3 response received");
        classify_status(status)
    }
}
