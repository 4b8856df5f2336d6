//! Configuration variables and hosting configuration documents for tests.

use af_service::config::Config;
use af_service::context::provisioning::{
    DistributionConfiguration, EntryPoint, HostingConfiguration, IngestConfiguration,
};
use std::collections::HashMap;

pub const TEST_SERVER_NAME: &str = "af.test";
pub const TEST_INGEST_URL: &str = "https://origin.example.com/";
pub const HTTP_PULL_INGEST: &str = "urn:3gpp:5gms:content-protocol:http-pull-ingest";

/// Configuration variables with the given application servers and fast
/// retries (3 attempts, 100ms initial backoff).
pub fn test_config_vars(servers: &[&str]) -> HashMap<String, String> {
    HashMap::from([
        ("AF_APPLICATION_SERVERS".to_string(), servers.join(",")),
        ("AF_SERVER_NAME".to_string(), TEST_SERVER_NAME.to_string()),
        ("AF_DISTRIBUTION_MAX_ATTEMPTS".to_string(), "3".to_string()),
        ("AF_RETRY_BACKOFF_INITIAL_MS".to_string(), "100".to_string()),
        ("AF_RETRY_BACKOFF_MAX_MS".to_string(), "1000".to_string()),
        ("AF_REQUEST_TIMEOUT_MS".to_string(), "2000".to_string()),
        ("AF_EXCEPTION_RECOVERY_ATTEMPTS".to_string(), "2".to_string()),
    ])
}

/// Parsed configuration for [`test_config_vars`].
pub fn test_config(servers: &[&str]) -> Config {
    Config::from_vars(&test_config_vars(servers)).expect("test config should parse")
}

/// Builder for hosting configuration documents.
pub struct HostingConfigurationBuilder {
    name: String,
    ingest_url: String,
    rules: Vec<DistributionConfiguration>,
}

impl HostingConfigurationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ingest_url: TEST_INGEST_URL.to_string(),
            rules: Vec::new(),
        }
    }

    pub fn ingest(mut self, url: &str) -> Self {
        self.ingest_url = url.to_string();
        self
    }

    /// Add a DASH rule served by `host` under `base_path`.
    pub fn rule(self, host: &str, base_path: &str) -> Self {
        self.rule_with_entry(host, base_path, "manifest.mpd", "application/dash+xml")
    }

    pub fn rule_with_entry(
        mut self,
        host: &str,
        base_path: &str,
        relative_path: &str,
        content_type: &str,
    ) -> Self {
        self.rules.push(DistributionConfiguration {
            canonical_domain_name: host.to_string(),
            domain_name_alias: None,
            base_path: base_path.to_string(),
            entry_point: Some(EntryPoint {
                relative_path: relative_path.to_string(),
                content_type: content_type.to_string(),
                profiles: Vec::new(),
            }),
        });
        self
    }

    pub fn build(self) -> HostingConfiguration {
        HostingConfiguration {
            name: self.name,
            ingest_configuration: IngestConfiguration {
                pull: true,
                protocol: HTTP_PULL_INGEST.to_string(),
                base_url: self.ingest_url,
            },
            distribution_configurations: self.rules,
        }
    }

    /// The document as an M1 request body.
    pub fn to_json(self) -> serde_json::Value {
        serde_json::to_value(self.build()).expect("hosting configuration serializes")
    }
}
