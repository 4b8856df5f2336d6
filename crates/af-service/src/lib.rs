//! 5GMS Application Function (AF) Service Library
//!
//! The AF accepts provisioning sessions from content providers over M1,
//! distributes their hosting configurations to application servers over M3,
//! purges distributed content on request, serves service access information
//! to media clients over M5 and optionally registers with the core network
//! registry.
//!
//! # Architecture
//!
//! ```text
//! HTTP surfaces (M1, M5, mgmt, SBI)      spawned I/O tasks (M3, registry, timers)
//!            │                                         │
//!            └──────────── DispatcherHandle ───────────┘
//!                                 │ mailbox
//!                          Dispatcher task
//!                                 │ run-to-completion per event
//!            ┌────────────┬───────┴────────┬──────────────┐
//!          AfFsm   ProvisioningFsm  ServerManagementFsm  SignalingFsm
//!                                 │
//!                               Model (sessions, server states, documents)
//! ```
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`context`] - Provisioning sessions, application server state, served documents
//! - [`dispatcher`] - Mailbox, routing and effect execution
//! - [`errors`] - Error types with HTTP status mapping
//! - [`events`] - Event model and outbound request construction
//! - [`fsm`] - The four interface state machines
//! - [`http`] - axum routers
//! - [`observability`] - Health state and Prometheus metrics
//! - [`transport`] - M3 and registry clients

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod fsm;
pub mod http;
pub mod observability;
pub mod transport;
