//! Metrics definitions for the Application Function.
//!
//! All metrics follow Prometheus naming conventions:
//! - `af_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by enums in the code base:
//! - `interface`: 4 values (af, provisioning, server_management, signaling)
//! - `reason`: dropped-event reasons (unresolved_session, unresolved_server,
//!   unresolved_purge, dispatcher_stopped)
//! - `kind`: outbound request kinds (create, update, withdraw, purge) and
//!   report kinds
//! - `outcome`: ack, transient, timeout, protocol_error
//! - `endpoint`: normalized HTTP paths (ids replaced by placeholders)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("af_http".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("af_outbound".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set outbound latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Count one event handed to an FSM.
///
/// Metric: `af_events_total`
/// Labels: `interface`
pub fn record_event(interface: &'static str) {
    counter!("af_events_total", "interface" => interface).increment(1);
}

/// Count one event dropped before reaching an FSM.
///
/// Metric: `af_events_dropped_total`
/// Labels: `reason`
pub fn record_event_dropped(reason: &'static str) {
    counter!("af_events_dropped_total", "reason" => reason).increment(1);
}

/// Set the number of events waiting in the dispatcher mailbox.
///
/// Metric: `af_dispatcher_mailbox_depth`
pub fn set_mailbox_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("af_dispatcher_mailbox_depth").set(depth as f64);
}

// ============================================================================
// Outbound requests
// ============================================================================

/// Record one completed outbound M3 request.
///
/// Metrics: `af_outbound_requests_total`, `af_outbound_request_duration_seconds`
/// Labels: `kind`, `outcome`
pub fn record_outbound(kind: &'static str, outcome: &'static str, duration: Duration) {
    counter!("af_outbound_requests_total", "kind" => kind, "outcome" => outcome).increment(1);
    histogram!("af_outbound_request_duration_seconds", "kind" => kind)
        .record(duration.as_secs_f64());
}

/// Count one report raised by an FSM.
///
/// Metric: `af_reports_total`
/// Labels: `kind`
pub fn record_report(kind: &'static str) {
    counter!("af_reports_total", "kind" => kind).increment(1);
}

// ============================================================================
// Context gauges
// ============================================================================

/// Metric: `af_provisioning_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("af_provisioning_sessions_active").set(count as f64);
}

/// Metric: `af_application_servers_known`
pub fn set_servers_known(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("af_application_servers_known").set(count as f64);
}

// ============================================================================
// HTTP
// ============================================================================

/// Record one HTTP request served by any of the AF's listeners.
///
/// Metrics: `af_http_requests_total`, `af_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("af_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint.clone(),
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("af_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        300..=399 => "redirect",
        400..=499 => "client_error",
        _ => "server_error",
    }
}

/// Replace path segments that carry ids with placeholders.
fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    let normalized: Vec<&str> = segments
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            let parent = i.checked_sub(1).and_then(|p| segments.get(p)).copied();
            match parent {
                Some("provisioning-sessions") => "{id}",
                Some("service-access-information") => "{id}",
                Some("application-servers") => "{id}",
                _ => segment,
            }
        })
        .collect();

    let joined = normalized.join("/");
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // Recording without an installed recorder goes to the no-op recorder;
    // these exercise the label construction only.

    #[test]
    fn test_dispatcher_metrics() {
        record_event("provisioning");
        record_event_dropped("unresolved_session");
        set_mailbox_depth(0);
        set_mailbox_depth(250);
    }

    #[test]
    fn test_outbound_and_report_metrics() {
        record_outbound("create", "ack", Duration::from_millis(12));
        record_outbound("purge", "timeout", Duration::from_secs(10));
        record_report("permanently_stale");
        set_sessions_active(3);
        set_servers_known(2);
    }

    #[test]
    fn test_record_http_request() {
        record_http_request("GET", "/health", 200, Duration::from_millis(1));
        record_http_request("POST", "/3gpp-m1/v2/provisioning-sessions", 201, Duration::from_millis(4));
    }

    #[test]
    fn test_recorded_names_and_labels() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_event("provisioning");
            record_event("provisioning");
            record_outbound("create", "ack", Duration::from_millis(12));
            set_sessions_active(4);
        });

        let recorded = snapshotter.snapshot().into_vec();
        let find = |name: &str| {
            recorded
                .iter()
                .find(|(key, _, _, _)| key.key().name() == name)
                .map(|(key, _, _, value)| (key.key().clone(), value.clone()))
        };

        let (key, value) = find("af_events_total").expect("events counter");
        assert!(key
            .labels()
            .any(|l| l.key() == "interface" && l.value() == "provisioning"));
        assert_eq!(value, &DebugValue::Counter(2));

        assert!(find("af_outbound_requests_total").is_some());
        assert!(find("af_outbound_request_duration_seconds").is_some());
        assert!(matches!(
            find("af_provisioning_sessions_active"),
            Some((_, DebugValue::Gauge(v))) if v.into_inner() == 4.0
        ));
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("/"), "/");
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(
            normalize_endpoint("/3gpp-m1/v2/provisioning-sessions/5b0c/content-hosting-configuration"),
            "/3gpp-m1/v2/provisioning-sessions/{id}/content-hosting-configuration"
        );
        assert_eq!(
            normalize_endpoint("/3gpp-m5/v2/service-access-information/abc"),
            "/3gpp-m5/v2/service-access-information/{id}"
        );
        assert_eq!(
            normalize_endpoint("/maf-mgmt/v1/application-servers/as-3"),
            "/maf-mgmt/v1/application-servers/{id}"
        );
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(304), "redirect");
        assert_eq!(categorize_status_code(404), "client_error");
        assert_eq!(categorize_status_code(503), "server_error");
    }
}
