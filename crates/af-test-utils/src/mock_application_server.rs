//! Mock M3 client.
//!
//! Answers requests from a script, falling back to a fixed outcome once the
//! script runs out, and records every request it sees.

use af_service::errors::AfError;
use af_service::events::outbound::{OutboundKind, OutboundRequest};
use af_service::transport::ApplicationServerClient;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// How the mock answers one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Ack,
    /// Retryable failure (connection refused, 503...).
    Transient,
    /// Malformed or rejected exchange.
    Protocol,
    /// Never answers; the dispatcher's deadline fires.
    Hang,
}

pub struct MockApplicationServer {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    requests: Mutex<Vec<OutboundRequest>>,
    seen: Notify,
}

impl MockApplicationServer {
    /// Acknowledge everything.
    pub fn accepting() -> Self {
        Self::with_script(Vec::new(), MockOutcome::Ack)
    }

    /// Fail every request with a transient error.
    pub fn failing() -> Self {
        Self::with_script(Vec::new(), MockOutcome::Transient)
    }

    /// Answer with `script` in order, then with `fallback`.
    pub fn with_script(script: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            seen: Notify::new(),
        }
    }

    /// Append outcomes to the script.
    pub fn push_script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_of(&self, kind: OutboundKind) -> Vec<OutboundRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }

    /// Wait until at least `count` requests were received.
    ///
    /// Wrap in `tokio::time::timeout` in tests.
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let notified = self.seen.notified();
            if self.request_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ApplicationServerClient for MockApplicationServer {
    async fn send(&self, request: &OutboundRequest) -> Result<(), AfError> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.requests.lock().unwrap().push(request.clone());
        self.seen.notify_waiters();

        match outcome {
            MockOutcome::Ack => Ok(()),
            MockOutcome::Transient => Err(AfError::TransientNetwork(
                "mock application server unavailable".to_string(),
            )),
            MockOutcome::Protocol => Err(AfError::Protocol(
                "mock application server rejected request".to_string(),
            )),
            MockOutcome::Hang => std::future::pending().await,
        }
    }
}
