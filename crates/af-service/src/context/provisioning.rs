//! Provisioning sessions and their store.
//!
//! A session's hosting configuration is never edited in place: each accepted
//! change produces a new version plus a structured diff of distribution
//! rules keyed by `(server, base path)`. The store never touches
//! server-facing state; acting on the diff is the provisioning FSM's job.

use crate::context::server_registry::ServerAddressRegistry;
use crate::errors::AfError;
use chrono::{DateTime, Utc};
use common::types::{ProvisioningSessionId, PurgeId, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

fn default_pull() -> bool {
    true
}

/// Content hosting configuration submitted over M1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostingConfiguration {
    pub name: String,
    pub ingest_configuration: IngestConfiguration,
    #[serde(default)]
    pub distribution_configurations: Vec<DistributionConfiguration>,
}

/// Where the application server pulls content from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestConfiguration {
    #[serde(default = "default_pull")]
    pub pull: bool,
    pub protocol: String,
    #[serde(rename = "baseURL")]
    pub base_url: String,
}

/// One distribution rule: content served by one server under one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionConfiguration {
    pub canonical_domain_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name_alias: Option<String>,
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    pub relative_path: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
}

/// Service access information served over M5.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccessInformation {
    pub provisioning_session_id: ProvisioningSessionId,
    pub provisioning_session_type: String,
    pub streaming_access: StreamingAccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingAccess {
    pub entry_points: Vec<MediaEntryPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntryPoint {
    pub locator: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
}

/// Identity of a distribution rule within the AF.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub server: ServerId,
    pub base_path: String,
}

/// A session's rules, resolved against the server registry.
pub type Rules = BTreeMap<RuleKey, DistributionConfiguration>;

/// Before/after pair for a changed scalar part of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub before: T,
    pub after: T,
}

impl<T: Clone> Change<T> {
    pub fn inverse(&self) -> Self {
        Self {
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChange {
    Added {
        key: RuleKey,
        rule: DistributionConfiguration,
    },
    Removed {
        key: RuleKey,
        rule: DistributionConfiguration,
    },
    Modified {
        key: RuleKey,
        before: DistributionConfiguration,
        after: DistributionConfiguration,
    },
}

impl RuleChange {
    pub fn key(&self) -> &RuleKey {
        match self {
            RuleChange::Added { key, .. }
            | RuleChange::Removed { key, .. }
            | RuleChange::Modified { key, .. } => key,
        }
    }

    pub fn inverse(&self) -> Self {
        match self {
            RuleChange::Added { key, rule } => RuleChange::Removed {
                key: key.clone(),
                rule: rule.clone(),
            },
            RuleChange::Removed { key, rule } => RuleChange::Added {
                key: key.clone(),
                rule: rule.clone(),
            },
            RuleChange::Modified { key, before, after } => RuleChange::Modified {
                key: key.clone(),
                before: after.clone(),
                after: before.clone(),
            },
        }
    }
}

/// Structured difference between two versions of a hosting configuration.
///
/// Rule changes are ordered by key, so `a.inverse().inverse() == a` and the
/// diff of `(v2 -> v1)` equals the inverse of `(v1 -> v2)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistributionDiff {
    pub name: Option<Change<String>>,
    pub ingest: Option<Change<IngestConfiguration>>,
    pub rules: Vec<RuleChange>,
}

impl DistributionDiff {
    pub fn between(
        before: &HostingConfiguration,
        before_rules: &Rules,
        after: &HostingConfiguration,
        after_rules: &Rules,
    ) -> Self {
        let name = (before.name != after.name).then(|| Change {
            before: before.name.clone(),
            after: after.name.clone(),
        });
        let ingest = (before.ingest_configuration != after.ingest_configuration).then(|| Change {
            before: before.ingest_configuration.clone(),
            after: after.ingest_configuration.clone(),
        });

        let keys: BTreeSet<&RuleKey> = before_rules.keys().chain(after_rules.keys()).collect();
        let rules = keys
            .into_iter()
            .filter_map(|key| match (before_rules.get(key), after_rules.get(key)) {
                (None, Some(rule)) => Some(RuleChange::Added {
                    key: key.clone(),
                    rule: rule.clone(),
                }),
                (Some(rule), None) => Some(RuleChange::Removed {
                    key: key.clone(),
                    rule: rule.clone(),
                }),
                (Some(old), Some(new)) if old != new => Some(RuleChange::Modified {
                    key: key.clone(),
                    before: old.clone(),
                    after: new.clone(),
                }),
                _ => None,
            })
            .collect();

        Self {
            name,
            ingest,
            rules,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.ingest.is_none() && self.rules.is_empty()
    }

    pub fn inverse(&self) -> Self {
        Self {
            name: self.name.as_ref().map(Change::inverse),
            ingest: self.ingest.as_ref().map(Change::inverse),
            rules: self.rules.iter().map(RuleChange::inverse).collect(),
        }
    }

    /// Rules removed from servers that still carry other rules of the session.
    pub fn removed_rules(&self) -> impl Iterator<Item = &RuleKey> {
        self.rules.iter().filter_map(|change| match change {
            RuleChange::Removed { key, .. } => Some(key),
            _ => None,
        })
    }
}

/// One content provider's provisioning session.
#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    pub id: ProvisioningSessionId,
    pub document: HostingConfiguration,
    pub rules: Rules,
    pub service_access: Option<ServiceAccessInformation>,
    pub purges: BTreeSet<PurgeId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub pending_deletion: bool,
}

impl ProvisioningSession {
    /// Servers targeted by the current document.
    pub fn servers(&self) -> BTreeSet<ServerId> {
        self.rules.keys().map(|key| key.server).collect()
    }
}

/// Anchored regex matching everything under a base path.
pub fn prefix_pattern(base_path: &str) -> String {
    let mut pattern = String::with_capacity(base_path.len() + 1);
    pattern.push('^');
    for c in base_path.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern
}

fn derive_service_access(
    id: ProvisioningSessionId,
    document: &HostingConfiguration,
) -> Option<ServiceAccessInformation> {
    let entry_points: Vec<MediaEntryPoint> = document
        .distribution_configurations
        .iter()
        .filter_map(|rule| {
            let entry = rule.entry_point.as_ref()?;
            let host = rule
                .domain_name_alias
                .as_deref()
                .unwrap_or(&rule.canonical_domain_name);
            Some(MediaEntryPoint {
                locator: format!(
                    "http://{host}{}/{}",
                    rule.base_path.trim_end_matches('/'),
                    entry.relative_path.trim_start_matches('/')
                ),
                content_type: entry.content_type.clone(),
                profiles: entry.profiles.clone(),
            })
        })
        .collect();

    if entry_points.is_empty() {
        return None;
    }

    Some(ServiceAccessInformation {
        provisioning_session_id: id,
        provisioning_session_type: "DOWNLINK".to_string(),
        streaming_access: StreamingAccess { entry_points },
    })
}

/// Active provisioning sessions, indexed by id.
#[derive(Debug, Default)]
pub struct ProvisioningSessionStore {
    sessions: BTreeMap<ProvisioningSessionId, ProvisioningSession>,
}

impl ProvisioningSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a document against schema and policy rules.
    ///
    /// `exclude` names the session being updated so its own rules do not
    /// count as conflicts.
    pub fn validate(
        &self,
        document: &HostingConfiguration,
        registry: &ServerAddressRegistry,
        exclude: Option<ProvisioningSessionId>,
    ) -> Result<Rules, AfError> {
        if document.name.trim().is_empty() {
            return Err(AfError::Validation(
                "name must not be empty".to_string(),
            ));
        }

        let ingest = &document.ingest_configuration;
        if ingest.protocol.trim().is_empty() {
            return Err(AfError::Validation(
                "ingest protocol must not be empty".to_string(),
            ));
        }
        reqwest::Url::parse(&ingest.base_url).map_err(|e| {
            AfError::Validation(format!("ingest baseURL {:?} is invalid: {e}", ingest.base_url))
        })?;

        let mut rules = Rules::new();
        for rule in &document.distribution_configurations {
            let server = registry
                .lookup_host(&rule.canonical_domain_name)
                .ok_or_else(|| {
                    AfError::Validation(format!(
                        "canonicalDomainName {:?} is not a known application server",
                        rule.canonical_domain_name
                    ))
                })?;

            if !rule.base_path.starts_with('/') {
                return Err(AfError::Validation(format!(
                    "basePath {:?} must be absolute",
                    rule.base_path
                )));
            }

            if let Some(entry) = &rule.entry_point {
                if entry.relative_path.trim().is_empty() || entry.content_type.trim().is_empty() {
                    return Err(AfError::Validation(
                        "entryPoint needs relativePath and contentType".to_string(),
                    ));
                }
            }

            let key = RuleKey {
                server,
                base_path: rule.base_path.clone(),
            };
            if rules.insert(key, rule.clone()).is_some() {
                return Err(AfError::Validation(format!(
                    "duplicate distribution rule for {} {}",
                    rule.canonical_domain_name, rule.base_path
                )));
            }
        }

        for session in self.sessions.values() {
            if Some(session.id) == exclude {
                continue;
            }
            if let Some(key) = rules.keys().find(|key| session.rules.contains_key(*key)) {
                return Err(AfError::Validation(format!(
                    "distribution rule {} {} conflicts with provisioning session {}",
                    key.server, key.base_path, session.id
                )));
            }
        }

        Ok(rules)
    }

    /// Validate and store a new session at version 1.
    pub fn create(
        &mut self,
        document: HostingConfiguration,
        registry: &ServerAddressRegistry,
    ) -> Result<ProvisioningSessionId, AfError> {
        let rules = self.validate(&document, registry, None)?;

        let mut id = ProvisioningSessionId::new();
        while self.sessions.contains_key(&id) {
            id = ProvisioningSessionId::new();
        }

        let now = Utc::now();
        let session = ProvisioningSession {
            id,
            service_access: derive_service_access(id, &document),
            document,
            rules,
            purges: BTreeSet::new(),
            version: 1,
            created_at: now,
            modified_at: now,
            pending_deletion: false,
        };
        self.sessions.insert(id, session);

        Ok(id)
    }

    /// Validate and apply a replacement document.
    pub fn update(
        &mut self,
        id: ProvisioningSessionId,
        document: HostingConfiguration,
        registry: &ServerAddressRegistry,
    ) -> Result<DistributionDiff, AfError> {
        self.live(id)?;
        let rules = self.validate(&document, registry, Some(id))?;
        self.apply_update(id, document, rules)
    }

    /// Apply an already validated replacement document.
    ///
    /// An identical document yields an empty diff and no new version.
    pub fn apply_update(
        &mut self,
        id: ProvisioningSessionId,
        document: HostingConfiguration,
        rules: Rules,
    ) -> Result<DistributionDiff, AfError> {
        let session = self
            .sessions
            .get_mut(&id)
            .filter(|s| !s.pending_deletion)
            .ok_or(AfError::SessionNotFound(id))?;

        let diff = DistributionDiff::between(&session.document, &session.rules, &document, &rules);
        if diff.is_empty() {
            return Ok(diff);
        }

        session.service_access = derive_service_access(id, &document);
        session.document = document;
        session.rules = rules;
        session.version += 1;
        session.modified_at = Utc::now();

        Ok(diff)
    }

    /// Mark a session for removal once its distributed copies are purged.
    pub fn delete(&mut self, id: ProvisioningSessionId) -> Result<(), AfError> {
        let session = self
            .sessions
            .get_mut(&id)
            .filter(|s| !s.pending_deletion)
            .ok_or(AfError::SessionNotFound(id))?;
        session.pending_deletion = true;
        session.modified_at = Utc::now();
        Ok(())
    }

    pub fn lookup(&self, id: ProvisioningSessionId) -> Option<&ProvisioningSession> {
        self.sessions.get(&id)
    }

    pub fn lookup_mut(&mut self, id: ProvisioningSessionId) -> Option<&mut ProvisioningSession> {
        self.sessions.get_mut(&id)
    }

    /// Session that exists and is not being deleted.
    pub fn live(&self, id: ProvisioningSessionId) -> Result<&ProvisioningSession, AfError> {
        self.sessions
            .get(&id)
            .filter(|s| !s.pending_deletion)
            .ok_or(AfError::SessionNotFound(id))
    }

    /// Remove a session for good. Only the purge-completion path calls this.
    pub fn release(&mut self, id: ProvisioningSessionId) -> Option<ProvisioningSession> {
        self.sessions.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProvisioningSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProvisioningSession> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
