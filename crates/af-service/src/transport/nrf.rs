//! Registry (NRF) client: NF registration and deregistration.

use crate::errors::AfError;
use crate::transport::{classify_status, NfProfile, RegistrationHandle, RegistryClient};
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Connect timeout for the registry.
const NRF_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Clone)]
pub struct NrfClient {
    client: Client,
    base_url: String,
}

impl NrfClient {
    /// # Errors
    ///
    /// Returns `AfError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, AfError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(NRF_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                error!(target: "af.transport.nrf", error = %e, "Failed to build HTTP client");
                AfError::Internal(format!("failed to build registry client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn instance_url(&self, profile_id: &uuid::Uuid) -> String {
        format!("{}/nnrf-nfm/v1/nf-instances/{profile_id}", self.base_url)
    }
}

#[async_trait]
impl RegistryClient for NrfClient {
    #[instrument(skip_all, name = "af.transport.nrf.register", fields(nf_instance_id = %profile.nf_instance_id))]
    async fn register(&self, profile: &NfProfile) -> Result<RegistrationHandle, AfError> {
        let url = self.instance_url(&profile.nf_instance_id);

        let response = self
            .client
            .put(&url)
            .json(profile)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "af.transport.nrf", error = %e, "Registry request failed");
                AfError::TransientNetwork(format!("registry request failed: {e}"))
            })?;

        classify_status(response.status())?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|loc| {
                if loc.starts_with('/') {
                    format!("{}{loc}", self.base_url)
                } else {
                    loc.to_string()
                }
            })
            .unwrap_or(url);

        info!(target: "af.transport.nrf", location = %location, "Registered with registry");

        Ok(RegistrationHandle {
            nf_instance_id: profile.nf_instance_id,
            location,
        })
    }

    #[instrument(skip_all, name = "af.transport.nrf.deregister", fields(nf_instance_id = %handle.nf_instance_id))]
    async fn deregister(&self, handle: &RegistrationHandle) -> Result<(), AfError> {
        let response = self
            .client
            .delete(&handle.location)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "af.transport.nrf", error = %e, "Registry request failed");
                AfError::TransientNetwork(format!("registry request failed: {e}"))
            })?;

        classify_status(response.status())?;
        info!(target: "af.transport.nrf", "Deregistered from registry");
        Ok(())
    }
}
