//! Observability for the Application Function.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `af_events_total` | Counter | `interface` | Events handed to each FSM |
//! | `af_events_dropped_total` | Counter | `reason` | Events dropped before dispatch |
//! | `af_outbound_requests_total` | Counter | `kind`, `outcome` | M3 requests by result |
//! | `af_outbound_request_duration_seconds` | Histogram | `kind` | M3 request latency |
//! | `af_reports_total` | Counter | `kind` | Faults, exhaustion and recovery reports |
//! | `af_provisioning_sessions_active` | Gauge | none | Sessions in the store |
//! | `af_application_servers_known` | Gauge | none | Registered application servers |
//! | `af_dispatcher_mailbox_depth` | Gauge | none | Backpressure on the dispatcher |
//! | `af_http_requests_total` | Counter | `method`, `endpoint`, `status_code` | HTTP traffic |
//! | `af_http_request_duration_seconds` | Histogram | `method`, `endpoint`, `status` | HTTP latency |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_event, record_event_dropped, record_http_request,
    record_outbound, record_report, set_mailbox_depth, set_servers_known, set_sessions_active,
};
