//! Outbound transports: application servers (M3) and the core registry.
//!
//! The dispatcher only sees these traits; the reqwest implementations live
//! in the submodules and test doubles live in `af-test-utils`.

pub mod m3;
pub mod nrf;

pub use m3::M3Client;
pub use nrf::NrfClient;

use crate::config::Config;
use crate::errors::AfError;
use crate::events::outbound::OutboundRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client for the M3 interface of application servers.
#[async_trait]
pub trait ApplicationServerClient: Send + Sync {
    /// Execute one request.
    ///
    /// `Ok(())` is an acknowledgment. Errors are `TransientNetwork` for
    /// failures worth retrying and `Protocol` for malformed peer responses.
    async fn send(&self, request: &OutboundRequest) -> Result<(), AfError>;
}

/// Client for the core network's NF registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register(&self, profile: &NfProfile) -> Result<RegistrationHandle, AfError>;

    async fn deregister(&self, handle: &RegistrationHandle) -> Result<(), AfError>;
}

/// Profile this AF presents to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfProfile {
    pub nf_instance_id: Uuid,
    pub nf_type: String,
    pub nf_status: String,
    pub fqdn: String,
    pub heart_beat_timer: u32,
}

impl NfProfile {
    pub fn from_config(config: &Config) -> Self {
        Self {
            nf_instance_id: config.nf_instance_id,
            nf_type: "AF".to_string(),
            nf_status: "REGISTERED".to_string(),
            fqdn: config.server_name.clone(),
            heart_beat_timer: 60,
        }
    }
}

/// Proof of a successful registration, needed to deregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    pub nf_instance_id: Uuid,
    /// Resource URL of the registered profile.
    pub location: String,
}

/// Map an HTTP status from a peer onto the error taxonomy.
///
/// 2xx is success. 408, 429 and 5xx are worth retrying; any other status
/// means the peer rejected what we sent.
pub fn classify_status(status: reqwest::StatusCode) -> Result<(), AfError> {
    if status.is_success() {
        return Ok(());
    }

    let code = status.as_u16();
    if code == 408 || code == 429 || status.is_server_error() {
        Err(AfError::TransientNetwork(format!("peer returned {status}")))
    } else {
        Err(AfError::Protocol(format!("peer rejected request with {status}")))
    }
}
