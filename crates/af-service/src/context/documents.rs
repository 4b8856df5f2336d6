//! Rendered document cache.
//!
//! Hosting configuration and service access documents are serialised once
//! per version and kept with their cache directives until the session
//! changes.

use crate::context::cache_control::{self, CacheDirective, DocumentKind, ResponseCacheControl};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::types::ProvisioningSessionId;
use std::collections::HashMap;

/// A document ready to be written to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedDocument {
    pub kind: DocumentKind,
    pub body: Bytes,
    pub directive: CacheDirective,
}

#[derive(Debug, Default)]
pub struct DocumentCache {
    entries: HashMap<(ProvisioningSessionId, DocumentKind), (u64, ServedDocument)>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached document for `version`, or render and cache it.
    pub fn get_or_render<E>(
        &mut self,
        session: ProvisioningSessionId,
        kind: DocumentKind,
        version: u64,
        modified: DateTime<Utc>,
        policy: &ResponseCacheControl,
        render: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<ServedDocument, E> {
        if let Some((cached_version, document)) = self.entries.get(&(session, kind)) {
            if *cached_version == version {
                return Ok(document.clone());
            }
        }

        let document = render_document(kind, modified, policy, render()?);
        self.entries
            .insert((session, kind), (version, document.clone()));
        Ok(document)
    }

    pub fn evict(&mut self, session: ProvisioningSessionId) {
        self.entries.retain(|(id, _), _| *id != session);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wrap freshly rendered bytes with their cache directives.
pub fn render_document(
    kind: DocumentKind,
    modified: DateTime<Utc>,
    policy: &ResponseCacheControl,
    body: Vec<u8>,
) -> ServedDocument {
    let directive = cache_control::compute(&body, modified, &policy.policy_for(kind));
    ServedDocument {
        kind,
        body: Bytes::from(body),
        directive,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::cache_control::CachePolicy;
    use std::cell::Cell;
    use std::time::Duration;

    fn policy() -> ResponseCacheControl {
        let p = CachePolicy {
            max_age: Duration::from_secs(60),
            must_revalidate: true,
        };
        ResponseCacheControl {
            provisioning_session: p,
            content_hosting_configuration: p,
            service_access_information: p,
        }
    }

    #[test]
    fn test_renders_once_per_version() {
        let mut cache = DocumentCache::new();
        let session = ProvisioningSessionId::new();
        let renders = Cell::new(0);
        let render = || {
            renders.set(renders.get() + 1);
            Ok::<_, ()>(b"{}".to_vec())
        };

        let kind = DocumentKind::ContentHostingConfiguration;
        let first = cache
            .get_or_render(session, kind, 1, Utc::now(), &policy(), render)
            .unwrap();
        let second = cache
            .get_or_render(session, kind, 1, Utc::now(), &policy(), render)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(renders.get(), 1);

        cache
            .get_or_render(session, kind, 2, Utc::now(), &policy(), render)
            .unwrap();
        assert_eq!(renders.get(), 2);
    }

    #[test]
    fn test_evict_drops_all_kinds_for_session() {
        let mut cache = DocumentCache::new();
        let session = ProvisioningSessionId::new();
        let other = ProvisioningSessionId::new();
        for kind in [
            DocumentKind::ContentHostingConfiguration,
            DocumentKind::ServiceAccessInformation,
        ] {
            cache
                .get_or_render(session, kind, 1, Utc::now(), &policy(), || Ok::<_, ()>(vec![]))
                .unwrap();
        }
        cache
            .get_or_render(
                other,
                DocumentKind::ContentHostingConfiguration,
                1,
                Utc::now(),
                &policy(),
                || Ok::<_, ()>(vec![]),
            )
            .unwrap();

        cache.evict(session);
        assert_eq!(cache.len(), 1);
    }
}
