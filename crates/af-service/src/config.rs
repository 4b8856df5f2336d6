//! Application Function configuration.
//!
//! Configuration is loaded from environment variables once at startup and is
//! immutable afterwards. Any missing or malformed value is a fatal
//! configuration error: no consistent context can be built from it.

use crate::context::cache_control::{CachePolicy, ResponseCacheControl};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default M1 (provisioning) bind address.
pub const DEFAULT_M1_BIND_ADDRESS: &str = "0.0.0.0:7778";

/// Default M5 (service access) bind address.
pub const DEFAULT_M5_BIND_ADDRESS: &str = "0.0.0.0:7779";

/// Default management bind address (health, metrics, server administration).
pub const DEFAULT_MGMT_BIND_ADDRESS: &str = "127.0.0.1:7780";

/// Default SBI bind address (registry callbacks).
pub const DEFAULT_SBI_BIND_ADDRESS: &str = "0.0.0.0:7777";

/// Default registry (NRF) base URL.
pub const DEFAULT_REGISTRY_URL: &str = "http://127.0.0.1:7777";

/// Default M3 port used when an application server entry has no explicit URL.
pub const DEFAULT_M3_PORT: u16 = 7777;

/// Default max-age for served documents, in seconds.
pub const DEFAULT_CACHE_MAX_AGE_SECONDS: u64 = 60;

/// Default number of attempts for one distribution or purge request.
pub const DEFAULT_DISTRIBUTION_MAX_ATTEMPTS: u32 = 5;

/// Default first retry delay in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_INITIAL_MS: u64 = 500;

/// Default retry delay cap in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 30_000;

/// Default retry delay growth factor.
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;

/// Default deadline for one outbound request in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default number of recovery attempts an FSM makes from its exception state.
pub const DEFAULT_EXCEPTION_RECOVERY_ATTEMPTS: u32 = 3;

/// Address of one application server as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationServerAddress {
    /// Canonical hostname the server serves content under.
    pub canonical_hostname: String,
    /// Base URL of the server's M3 interface.
    pub m3_base_url: String,
}

impl ApplicationServerAddress {
    /// Parse a `host` or `host=url` entry.
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        let (host, url) = match entry.split_once('=') {
            Some((host, url)) => (host.trim(), url.trim().trim_end_matches('/').to_string()),
            None => (entry, format!("http://{entry}:{DEFAULT_M3_PORT}")),
        };

        if host.is_empty() || host.contains('/') || host.contains(' ') {
            return Err(ConfigError::InvalidValue(format!(
                "application server hostname {host:?} is not a valid hostname"
            )));
        }

        reqwest::Url::parse(&url).map_err(|e| {
            ConfigError::InvalidValue(format!("application server URL {url:?} is invalid: {e}"))
        })?;

        Ok(Self {
            canonical_hostname: host.to_ascii_lowercase(),
            m3_base_url: url,
        })
    }
}

/// Bounded exponential backoff for distribution, purge and registration retries.
///
/// Delay for attempt `n` (0-indexed) is `initial × factor^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed for one request, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial: Duration,
    /// Delay cap.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DISTRIBUTION_MAX_ATTEMPTS,
            initial: Duration::from_millis(DEFAULT_RETRY_BACKOFF_INITIAL_MS),
            max: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MAX_MS),
            factor: DEFAULT_RETRY_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Application Function configuration.
#[derive(Clone)]
pub struct Config {
    /// Application servers known at startup.
    pub application_servers: Vec<ApplicationServerAddress>,

    /// M1 provisioning interface bind address.
    pub m1_bind_address: String,

    /// M5 service access interface bind address.
    pub m5_bind_address: String,

    /// Management interface bind address (health, metrics, server admin).
    pub mgmt_bind_address: String,

    /// SBI bind address for registry callbacks.
    pub sbi_bind_address: String,

    /// Identifier of the certificate manager, if one is configured.
    pub certificate_manager: Option<String>,

    /// Cache directives for served documents.
    pub cache_control: ResponseCacheControl,

    /// Whether the AF registers with the core network registry.
    pub core_integration: bool,

    /// Registry (NRF) base URL.
    pub registry_url: String,

    /// NF instance id presented to the registry.
    pub nf_instance_id: Uuid,

    /// Hostname this AF advertises.
    pub server_name: String,

    /// Retry policy for outbound requests.
    pub retry: RetryPolicy,

    /// Deadline for one outbound request.
    pub request_timeout: Duration,

    /// Recovery attempts an FSM makes from its exception state.
    pub exception_recovery_attempts: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let servers: Vec<&str> = self
            .application_servers
            .iter()
            .map(|s| s.canonical_hostname.as_str())
            .collect();

        f.debug_struct("Config")
            .field("application_servers", &servers)
            .field("m1_bind_address", &self.m1_bind_address)
            .field("m5_bind_address", &self.m5_bind_address)
            .field("mgmt_bind_address", &self.mgmt_bind_address)
            .field("sbi_bind_address", &self.sbi_bind_address)
            .field("certificate_manager", &self.certificate_manager)
            .field("core_integration", &self.core_integration)
            .field("registry_url", &self.registry_url)
            .field("nf_instance_id", &self.nf_instance_id)
            .field("server_name", &self.server_name)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let servers_raw = vars
            .get("AF_APPLICATION_SERVERS")
            .ok_or_else(|| ConfigError::MissingEnvVar("AF_APPLICATION_SERVERS".to_string()))?;

        let mut application_servers = Vec::new();
        for entry in servers_raw.split(',').filter(|e| !e.trim().is_empty()) {
            let address = ApplicationServerAddress::parse(entry)?;
            if application_servers
                .iter()
                .any(|s: &ApplicationServerAddress| s.canonical_hostname == address.canonical_hostname)
            {
                return Err(ConfigError::InvalidValue(format!(
                    "application server {} listed twice",
                    address.canonical_hostname
                )));
            }
            application_servers.push(address);
        }

        if application_servers.is_empty() {
            return Err(ConfigError::InvalidValue(
                "AF_APPLICATION_SERVERS must list at least one server".to_string(),
            ));
        }

        let m1_bind_address = string_or(vars, "AF_M1_BIND_ADDRESS", DEFAULT_M1_BIND_ADDRESS);
        let m5_bind_address = string_or(vars, "AF_M5_BIND_ADDRESS", DEFAULT_M5_BIND_ADDRESS);
        let mgmt_bind_address = string_or(vars, "AF_MGMT_BIND_ADDRESS", DEFAULT_MGMT_BIND_ADDRESS);
        let sbi_bind_address = string_or(vars, "AF_SBI_BIND_ADDRESS", DEFAULT_SBI_BIND_ADDRESS);

        let certificate_manager = vars
            .get("AF_CERTIFICATE_MANAGER")
            .filter(|v| !v.trim().is_empty())
            .cloned();

        let must_revalidate = parse_or(vars, "AF_CACHE_MUST_REVALIDATE", true)?;
        let policy = |name: &str| -> Result<CachePolicy, ConfigError> {
            let max_age = parse_or(vars, name, DEFAULT_CACHE_MAX_AGE_SECONDS)?;
            Ok(CachePolicy {
                max_age: Duration::from_secs(max_age),
                must_revalidate,
            })
        };
        let cache_control = ResponseCacheControl {
            provisioning_session: policy("AF_CACHE_MAX_AGE_PROVISIONING_SESSION")?,
            content_hosting_configuration: policy("AF_CACHE_MAX_AGE_CONTENT_HOSTING_CONFIGURATION")?,
            service_access_information: policy("AF_CACHE_MAX_AGE_SERVICE_ACCESS_INFORMATION")?,
        };

        let core_integration = parse_or(vars, "AF_CORE_INTEGRATION", false)?;
        let registry_url = string_or(vars, "AF_REGISTRY_URL", DEFAULT_REGISTRY_URL);
        if core_integration {
            reqwest::Url::parse(&registry_url).map_err(|e| {
                ConfigError::InvalidValue(format!("AF_REGISTRY_URL {registry_url:?}: {e}"))
            })?;
        }

        let nf_instance_id = match vars.get("AF_NF_INSTANCE_ID") {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|e| ConfigError::InvalidValue(format!("AF_NF_INSTANCE_ID: {e}")))?,
            None => Uuid::new_v4(),
        };

        let server_name = vars
            .get("AF_SERVER_NAME")
            .or_else(|| vars.get("HOSTNAME"))
            .cloned()
            .unwrap_or_else(|| "localhost".to_string());

        let retry = RetryPolicy {
            max_attempts: parse_or(vars, "AF_DISTRIBUTION_MAX_ATTEMPTS", DEFAULT_DISTRIBUTION_MAX_ATTEMPTS)?,
            initial: Duration::from_millis(parse_or(
                vars,
                "AF_RETRY_BACKOFF_INITIAL_MS",
                DEFAULT_RETRY_BACKOFF_INITIAL_MS,
            )?),
            max: Duration::from_millis(parse_or(
                vars,
                "AF_RETRY_BACKOFF_MAX_MS",
                DEFAULT_RETRY_BACKOFF_MAX_MS,
            )?),
            factor: parse_or(vars, "AF_RETRY_BACKOFF_FACTOR", DEFAULT_RETRY_BACKOFF_FACTOR)?,
        };

        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "AF_DISTRIBUTION_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if !retry.factor.is_finite() || retry.factor < 1.0 {
            return Err(ConfigError::InvalidValue(
                "AF_RETRY_BACKOFF_FACTOR must be a finite number >= 1.0".to_string(),
            ));
        }

        let request_timeout = Duration::from_millis(parse_or(
            vars,
            "AF_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?);
        if request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "AF_REQUEST_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let exception_recovery_attempts = parse_or(
            vars,
            "AF_EXCEPTION_RECOVERY_ATTEMPTS",
            DEFAULT_EXCEPTION_RECOVERY_ATTEMPTS,
        )?;

        Ok(Config {
            application_servers,
            m1_bind_address,
            m5_bind_address,
            mgmt_bind_address,
            sbi_bind_address,
            certificate_manager,
            cache_control,
            core_integration,
            registry_url,
            nf_instance_id,
            server_name,
            retry,
            request_timeout,
            exception_recovery_attempts,
        })
    }
}

fn string_or(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    vars.get(name)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

/// Parse an optional variable; a present but unparseable value is an error.
fn parse_or<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "AF_APPLICATION_SERVERS".to_string(),
            "as1.example.com,as2.example.com=http://10.0.0.2:8080/".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.application_servers.len(), 2);
        assert_eq!(
            config.application_servers[0].m3_base_url,
            "http://as1.example.com:7777"
        );
        assert_eq!(config.application_servers[1].m3_base_url, "http://10.0.0.2:8080");
        assert_eq!(config.m1_bind_address, DEFAULT_M1_BIND_ADDRESS);
        assert_eq!(config.m5_bind_address, DEFAULT_M5_BIND_ADDRESS);
        assert_eq!(config.mgmt_bind_address, DEFAULT_MGMT_BIND_ADDRESS);
        assert_eq!(config.sbi_bind_address, DEFAULT_SBI_BIND_ADDRESS);
        assert!(config.certificate_manager.is_none());
        assert!(!config.core_integration);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(
            config.request_timeout,
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
        assert_eq!(
            config.cache_control.content_hosting_configuration.max_age,
            Duration::from_secs(DEFAULT_CACHE_MAX_AGE_SECONDS)
        );
        assert!(config.cache_control.service_access_information.must_revalidate);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("AF_M1_BIND_ADDRESS".to_string(), "127.0.0.1:9001".to_string());
        vars.insert("AF_CERTIFICATE_MANAGER".to_string(), "cm-1".to_string());
        vars.insert("AF_CORE_INTEGRATION".to_string(), "true".to_string());
        vars.insert("AF_REGISTRY_URL".to_string(), "http://nrf:7777".to_string());
        vars.insert("AF_DISTRIBUTION_MAX_ATTEMPTS".to_string(), "2".to_string());
        vars.insert("AF_RETRY_BACKOFF_INITIAL_MS".to_string(), "10".to_string());
        vars.insert("AF_CACHE_MAX_AGE_SERVICE_ACCESS_INFORMATION".to_string(), "0".to_string());
        vars.insert("AF_CACHE_MUST_REVALIDATE".to_string(), "false".to_string());
        vars.insert("AF_SERVER_NAME".to_string(), "af.example.com".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.m1_bind_address, "127.0.0.1:9001");
        assert_eq!(config.certificate_manager.as_deref(), Some("cm-1"));
        assert!(config.core_integration);
        assert_eq!(config.registry_url, "http://nrf:7777");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial, Duration::from_millis(10));
        assert_eq!(
            config.cache_control.service_access_information.max_age,
            Duration::ZERO
        );
        assert!(!config.cache_control.provisioning_session.must_revalidate);
        assert_eq!(config.server_name, "af.example.com");
    }

    #[test]
    fn test_server_name_falls_back_to_hostname() {
        let mut vars = base_vars();
        vars.insert("HOSTNAME".to_string(), "af-pod-1".to_string());
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.server_name, "af-pod-1");
    }

    #[test]
    fn test_from_vars_missing_application_servers() {
        let result = Config::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "AF_APPLICATION_SERVERS")
        );
    }

    #[test]
    fn test_from_vars_rejects_empty_server_list() {
        let vars = HashMap::from([("AF_APPLICATION_SERVERS".to_string(), " , ".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_from_vars_rejects_duplicate_servers() {
        let vars = HashMap::from([(
            "AF_APPLICATION_SERVERS".to_string(),
            "as1.example.com,AS1.example.com".to_string(),
        )]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_from_vars_rejects_unparseable_numbers() {
        let mut vars = base_vars();
        vars.insert("AF_REQUEST_TIMEOUT_MS".to_string(), "soon".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("AF_REQUEST_TIMEOUT_MS")
        ));
    }

    #[test]
    fn test_from_vars_rejects_zero_attempts() {
        let mut vars = base_vars();
        vars.insert("AF_DISTRIBUTION_MAX_ATTEMPTS".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_retry_policy_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            factor: 2.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(500));

        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }

    #[test]
    fn test_debug_lists_server_hostnames_only() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("as1.example.com"));
        assert!(!debug_output.contains("10.0.0.2"));
    }
}
