//! Outbound M3 request construction.
//!
//! A request is built by a pure function chosen by `OutboundKind`. The built
//! request carries the session/server/purge references it was made for, and
//! turns back into a response event with the same references.

use crate::context::provisioning::HostingConfiguration;
use crate::errors::AfError;
use crate::events::{Event, Outcome, Payload, Response};
use bytes::Bytes;
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use reqwest::Method;
use serde::Serialize;
use std::time::Duration;

const JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundKind {
    CreateConfiguration,
    UpdateConfiguration,
    WithdrawConfiguration,
    PurgeResources,
}

impl OutboundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundKind::CreateConfiguration => "create",
            OutboundKind::UpdateConfiguration => "update",
            OutboundKind::WithdrawConfiguration => "withdraw",
            OutboundKind::PurgeResources => "purge",
        }
    }

    /// Whether the response is correlated through a purge node.
    pub fn is_purge(self) -> bool {
        matches!(
            self,
            OutboundKind::WithdrawConfiguration | OutboundKind::PurgeResources
        )
    }
}

/// Everything a builder may read.
#[derive(Debug, Clone, Copy)]
pub struct RequestInput<'a> {
    pub session: ProvisioningSessionId,
    pub server: ServerId,
    pub purge: Option<PurgeId>,
    pub base_url: &'a str,
    pub version: u64,
    pub document: &'a HostingConfiguration,
    pub pattern: Option<&'a str>,
    pub deadline: Duration,
}

/// A fully encoded M3 request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub kind: OutboundKind,
    pub session: ProvisioningSessionId,
    pub server: ServerId,
    pub purge: Option<PurgeId>,
    pub version: u64,
    pub method: Method,
    pub url: String,
    pub content_type: Option<&'static str>,
    pub body: Option<Bytes>,
    pub deadline: Duration,
}

impl OutboundRequest {
    /// Response event for this request.
    pub fn response(&self, outcome: Outcome) -> Event {
        Event {
            session: Some(self.session),
            server: Some(self.server),
            purge: self.purge,
            payload: Payload::Response(Response {
                kind: self.kind,
                version: self.version,
                outcome,
            }),
        }
    }
}

struct Encoded {
    method: Method,
    suffix: &'static str,
    content_type: Option<&'static str>,
    body: Option<Bytes>,
}

type Builder = fn(&RequestInput<'_>) -> Result<Encoded, AfError>;

fn builder_for(kind: OutboundKind) -> Builder {
    match kind {
        OutboundKind::CreateConfiguration => encode_create,
        OutboundKind::UpdateConfiguration => encode_update,
        OutboundKind::WithdrawConfiguration => encode_withdraw,
        OutboundKind::PurgeResources => encode_purge,
    }
}

fn document_body(document: &HostingConfiguration) -> Result<Bytes, AfError> {
    serde_json::to_vec(document)
        .map(Bytes::from)
        .map_err(|e| AfError::Internal(format!("failed to encode hosting configuration: {e}")))
}

fn encode_create(input: &RequestInput<'_>) -> Result<Encoded, AfError> {
    Ok(Encoded {
        method: Method::POST,
        suffix: "",
        content_type: Some(JSON),
        body: Some(document_body(input.document)?),
    })
}

fn encode_update(input: &RequestInput<'_>) -> Result<Encoded, AfError> {
    Ok(Encoded {
        method: Method::PUT,
        suffix: "",
        content_type: Some(JSON),
        body: Some(document_body(input.document)?),
    })
}

fn encode_withdraw(_input: &RequestInput<'_>) -> Result<Encoded, AfError> {
    Ok(Encoded {
        method: Method::DELETE,
        suffix: "",
        content_type: None,
        body: None,
    })
}

#[derive(Serialize)]
struct PurgeBody<'a> {
    pattern: &'a str,
}

fn encode_purge(input: &RequestInput<'_>) -> Result<Encoded, AfError> {
    let pattern = input
        .pattern
        .ok_or_else(|| AfError::Internal("purge request without pattern".to_string()))?;
    let body = serde_json::to_vec(&PurgeBody { pattern })
        .map_err(|e| AfError::Internal(format!("failed to encode purge body: {e}")))?;

    Ok(Encoded {
        method: Method::POST,
        suffix: "/purge",
        content_type: Some(JSON),
        body: Some(Bytes::from(body)),
    })
}

/// Build the request for `kind`.
pub fn build_request(kind: OutboundKind, input: &RequestInput<'_>) -> Result<OutboundRequest, AfError> {
    if kind.is_purge() && input.purge.is_none() {
        return Err(AfError::Internal(format!(
            "{} request without purge reference",
            kind.as_str()
        )));
    }

    let encoded = builder_for(kind)(input)?;
    let url = format!(
        "{}/3gpp-m3/v1/content-hosting-configurations/{}{}",
        input.base_url.trim_end_matches('/'),
        input.session,
        encoded.suffix
    );

    Ok(OutboundRequest {
        kind,
        session: input.session,
        server: input.server,
        purge: input.purge,
        version: input.version,
        method: encoded.method,
        url,
        content_type: encoded.content_type,
        body: encoded.body,
        deadline: input.deadline,
    })
}
