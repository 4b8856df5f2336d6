//! Mock registry (NRF) client.

use af_service::errors::AfError;
use af_service::transport::{NfProfile, RegistrationHandle, RegistryClient};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct MockRegistry {
    /// Registrations to refuse before accepting.
    failures_before_success: AtomicUsize,
    registrations: Mutex<Vec<NfProfile>>,
    deregistrations: Mutex<Vec<RegistrationHandle>>,
}

impl MockRegistry {
    pub fn accepting() -> Self {
        Self::failing_times(0)
    }

    /// Refuse the first `failures` registrations, then accept.
    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures_before_success: AtomicUsize::new(failures),
            registrations: Mutex::new(Vec::new()),
            deregistrations: Mutex::new(Vec::new()),
        }
    }

    /// Profiles of every registration attempt, accepted or not.
    pub fn registrations(&self) -> Vec<NfProfile> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn deregistrations(&self) -> Vec<RegistrationHandle> {
        self.deregistrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn register(&self, profile: &NfProfile) -> Result<RegistrationHandle, AfError> {
        self.registrations.lock().unwrap().push(profile.clone());

        let refused = self
            .failures_before_success
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AfError::TransientNetwork(
                "mock registry unavailable".to_string(),
            ));
        }

        Ok(RegistrationHandle {
            nf_instance_id: profile.nf_instance_id,
            location: format!("http://nrf.test/nnrf-nfm/v1/nf-instances/{}", profile.nf_instance_id),
        })
    }

    async fn deregister(&self, handle: &RegistrationHandle) -> Result<(), AfError> {
        self.deregistrations.lock().unwrap().push(handle.clone());
        Ok(())
    }
}
