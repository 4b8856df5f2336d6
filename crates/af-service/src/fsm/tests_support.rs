//! Shared fixtures for state machine unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::Action;
use crate::config::Config;
use crate::context::provisioning::{
    DistributionConfiguration, EntryPoint, HostingConfiguration, IngestConfiguration,
};
use crate::context::{Context, Model};
use crate::events::outbound::OutboundRequest;
use crate::events::{Event, Payload};
use common::types::ServerId;
use std::collections::HashMap;
use std::sync::Arc;

pub fn config_with(extra: &[(&str, &str)]) -> Config {
    let mut vars = HashMap::from([
        (
            "AF_APPLICATION_SERVERS".to_string(),
            "as1.example.com,as2.example.com".to_string(),
        ),
        ("AF_SERVER_NAME".to_string(), "af.example.com".to_string()),
        ("AF_DISTRIBUTION_MAX_ATTEMPTS".to_string(), "3".to_string()),
        ("AF_RETRY_BACKOFF_INITIAL_MS".to_string(), "100".to_string()),
        ("AF_EXCEPTION_RECOVERY_ATTEMPTS".to_string(), "2".to_string()),
    ]);
    for (k, v) in extra {
        vars.insert((*k).to_string(), (*v).to_string());
    }
    Config::from_vars(&vars).unwrap()
}

pub fn model() -> Model {
    Context::init(Arc::new(config_with(&[]))).unwrap().model
}

pub fn server(model: &Model, host: &str) -> ServerId {
    model.servers.registry().lookup_host(host).unwrap()
}

pub fn rule(host: &str, base_path: &str) -> DistributionConfiguration {
    DistributionConfiguration {
        canonical_domain_name: host.to_string(),
        domain_name_alias: None,
        base_path: base_path.to_string(),
        entry_point: Some(EntryPoint {
            relative_path: "manifest.mpd".to_string(),
            content_type: "application/dash+xml".to_string(),
            profiles: vec![],
        }),
    }
}

pub fn document(rules: Vec<DistributionConfiguration>) -> HostingConfiguration {
    HostingConfiguration {
        name: "session".to_string(),
        ingest_configuration: IngestConfiguration {
            pull: true,
            protocol: "urn:3gpp:5gms:content-protocol:http-pull-ingest".to_string(),
            base_url: "https://origin.example.com/".to_string(),
        },
        distribution_configurations: rules,
    }
}

pub fn emitted(actions: &[Action]) -> Vec<&Event> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Emit(e) => Some(e),
            _ => None,
        })
        .collect()
}

pub fn sent(actions: Vec<Action>) -> Vec<OutboundRequest> {
    actions
        .into_iter()
        .filter_map(|a| match a {
            Action::Send(r) => Some(r),
            _ => None,
        })
        .collect()
}

pub fn is_local(event: &Event) -> bool {
    matches!(event.payload, Payload::Local(_))
}
