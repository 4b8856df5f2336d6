//! Response cache control for served documents.
//!
//! Directives are a pure function of the document bytes, its modification
//! time and the configured policy, so re-serving an unchanged document always
//! yields identical headers.

use chrono::{DateTime, Utc};
use ring::digest::{digest, SHA256};
use std::time::Duration;

/// Cache policy for one kind of served document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_age: Duration,
    pub must_revalidate: bool,
}

/// Kinds of document the AF serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    ProvisioningSession,
    ContentHostingConfiguration,
    ServiceAccessInformation,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::ProvisioningSession => "provisioning_session",
            DocumentKind::ContentHostingConfiguration => "content_hosting_configuration",
            DocumentKind::ServiceAccessInformation => "service_access_information",
        }
    }
}

/// Configured policies, one per document kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCacheControl {
    pub provisioning_session: CachePolicy,
    pub content_hosting_configuration: CachePolicy,
    pub service_access_information: CachePolicy,
}

impl ResponseCacheControl {
    pub fn policy_for(&self, kind: DocumentKind) -> CachePolicy {
        match kind {
            DocumentKind::ProvisioningSession => self.provisioning_session,
            DocumentKind::ContentHostingConfiguration => self.content_hosting_configuration,
            DocumentKind::ServiceAccessInformation => self.service_access_information,
        }
    }
}

/// Cache headers for one served document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    /// `Cache-Control` header value.
    pub cache_control: String,
    /// Strong entity tag, quoted.
    pub etag: String,
    /// `Last-Modified` header value in IMF-fixdate form.
    pub last_modified: String,
}

impl CacheDirective {
    /// Whether an `If-None-Match` header value matches this document.
    ///
    /// Accepts `*`, a comma separated list, and weak validators (weak
    /// comparison is what `If-None-Match` requires).
    pub fn matches(&self, if_none_match: &str) -> bool {
        if_none_match.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.strip_prefix("W/").unwrap_or(tag) == self.etag
        })
    }
}

/// Compute cache directives for a document.
pub fn compute(body: &[u8], modified: DateTime<Utc>, policy: &CachePolicy) -> CacheDirective {
    let max_age = policy.max_age.as_secs();
    let cache_control = if max_age == 0 {
        "no-cache".to_string()
    } else if policy.must_revalidate {
        format!("max-age={max_age}, must-revalidate")
    } else {
        format!("max-age={max_age}")
    };

    let fingerprint = digest(&SHA256, body);

    CacheDirective {
        cache_control,
        etag: format!("\"{}\"", hex::encode(fingerprint.as_ref())),
        last_modified: modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
    }
}
