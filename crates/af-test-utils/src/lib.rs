//! # AF Test Utilities
//!
//! Shared test utilities for the 5GMS Application Function.
//!
//! - `mock_application_server` - Scripted M3 client that records every request
//! - `mock_registry` - Scripted registry client
//! - `fixtures` - Hosting configuration builder and configuration variables
//! - `harness` - `TestAf`: a running dispatcher wired to the mocks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use af_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let af = TestAf::start(test_config_vars(&["as1.example.com"])).await?;
//!
//!     let document = HostingConfigurationBuilder::new("live")
//!         .rule("as1.example.com", "/live/")
//!         .build();
//!     let id = af.dispatcher.create_session(document).await?;
//!
//!     af.servers.wait_for_requests(1).await;
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_application_server;
pub mod mock_registry;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use mock_application_server::*;
pub use mock_registry::*;
