//! Declarative configuration loading from YAML, TOML, and environment variables.
//!
//! [`FileConfig`] mirrors [`ClientPolicy`] with serde-friendly types and is
//! converted through the builder, so file and code configuration share one
//! validation path.
//!
//! # Supported Formats
//!
//! - **YAML** (requires `config-file` feature): `ClientPolicy::from_yaml("aerospike.yaml")`
//! - **TOML** (requires `config-file` feature): `ClientPolicy::from_toml("aerospike.toml")`
//! - **Environment Variables** (always available): `ClientPolicy::from_env()`
//!
//! # Example YAML
//!
//! ```yaml
//! hosts:
//!   - "10.0.0.1:3000"
//!   - "10.0.0.2:3000"
//! cluster-name: production
//! user: app
//! password: secret
//! tend-interval-ms: 1000
//! connection-queue-size: 256
//! min-connections-per-node: 8
//! rack-id: 2
//! ip-map:
//!   "172.17.0.2": "127.0.0.1"
//! tls:
//!   ca-cert-path: /etc/aerospike/ca.pem
//!   tls-name: db.example.com
//! ```

use std::collections::HashMap;
use std::time::Duration;

#[cfg(feature = "config-file")]
use serde::{Deserialize, Serialize};

use crate::cluster::Host;
use crate::config::{AuthMode, ClientPolicy, ClientPolicyBuilder, ConfigError};

/// Default service port used when a host string has none.
pub const DEFAULT_PORT: u16 = 3000;

/// Top-level file-based configuration.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "config-file",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct FileConfig {
    /// Seed hosts as `host[:port]`.
    pub hosts: Option<Vec<String>>,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// `internal`, `external` or `pki`.
    pub auth_mode: Option<String>,
    /// Expected cluster name.
    pub cluster_name: Option<String>,
    /// Connect and info timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Login timeout in milliseconds.
    pub login_timeout_ms: Option<u64>,
    /// Pooled connection idle timeout in milliseconds.
    pub idle_timeout_ms: Option<u64>,
    /// Tend period in milliseconds.
    pub tend_interval_ms: Option<u64>,
    /// Connections kept open per node.
    pub min_connections_per_node: Option<usize>,
    /// Per-node connection cap.
    pub connection_queue_size: Option<usize>,
    /// Whether the queue size is a hard cap.
    pub limit_connections_to_queue_size: Option<bool>,
    /// Cluster-wide cap on concurrent connects.
    pub opening_connection_threshold: Option<usize>,
    /// Error budget per node per window.
    pub max_error_rate: Option<u32>,
    /// Error window in tend ticks.
    pub error_rate_window: Option<u32>,
    /// Use alternate service addresses.
    pub use_services_alternate: Option<bool>,
    /// Local rack; enables rack-aware reads.
    pub rack_id: Option<i32>,
    /// Host rewrite table.
    pub ip_map: Option<HashMap<String, String>>,
    /// Fail boot when no seed is reachable.
    pub fail_if_not_connected: Option<bool>,
    /// TLS settings.
    pub tls: Option<FileTlsConfig>,
}

/// File-based TLS configuration.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "config-file",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct FileTlsConfig {
    /// Enable TLS even without a CA path.
    pub enabled: Option<bool>,
    /// CA certificate path.
    pub ca_cert_path: Option<String>,
    /// Client certificate path.
    pub client_cert_path: Option<String>,
    /// Client key path.
    pub client_key_path: Option<String>,
    /// Server name override.
    pub tls_name: Option<String>,
    /// Skip certificate name checks.
    pub skip_name_verification: Option<bool>,
}

impl FileConfig {
    /// Parses the configured seed hosts.
    pub fn seed_hosts(&self) -> Result<Vec<Host>, ConfigError> {
        let mut hosts = Vec::new();
        for entry in self.hosts.iter().flatten() {
            let parsed = Host::parse_hosts(entry, DEFAULT_PORT)
                .map_err(|e| ConfigError::new(format!("invalid host `{entry}`: {e}")))?;
            hosts.extend(parsed);
        }
        Ok(hosts)
    }
}

fn parse_auth_mode(mode: &str) -> Result<AuthMode, ConfigError> {
    match mode.to_ascii_lowercase().as_str() {
        "internal" => Ok(AuthMode::Internal),
        "external" => Ok(AuthMode::External),
        "pki" => Ok(AuthMode::Pki),
        other => Err(ConfigError::new(format!(
            "unknown auth mode `{other}` (expected internal, external or pki)"
        ))),
    }
}

impl TryFrom<FileConfig> for ClientPolicy {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        let mut builder = ClientPolicyBuilder::new();

        if let Some(user) = file.user {
            builder = builder.user(user);
        }

        if let Some(password) = file.password {
            builder = builder.password(password);
        }

        if let Some(mode) = file.auth_mode {
            builder = builder.auth_mode(parse_auth_mode(&mode)?);
        }

        if let Some(name) = file.cluster_name {
            builder = builder.cluster_name(name);
        }

        if let Some(ms) = file.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        if let Some(ms) = file.login_timeout_ms {
            builder = builder.login_timeout(Duration::from_millis(ms));
        }

        if let Some(ms) = file.idle_timeout_ms {
            builder = builder.idle_timeout(Duration::from_millis(ms));
        }

        if let Some(ms) = file.tend_interval_ms {
            builder = builder.tend_interval(Duration::from_millis(ms));
        }

        if let Some(n) = file.min_connections_per_node {
            builder = builder.min_connections_per_node(n);
        }

        if let Some(n) = file.connection_queue_size {
            builder = builder.connection_queue_size(n);
        }

        if let Some(limit) = file.limit_connections_to_queue_size {
            builder = builder.limit_connections_to_queue_size(limit);
        }

        if let Some(n) = file.opening_connection_threshold {
            builder = builder.opening_connection_threshold(n);
        }

        if let Some(rate) = file.max_error_rate {
            builder = builder.max_error_rate(rate);
        }

        if let Some(window) = file.error_rate_window {
            builder = builder.error_rate_window(window);
        }

        if let Some(alt) = file.use_services_alternate {
            builder = builder.use_services_alternate(alt);
        }

        if let Some(rack) = file.rack_id {
            builder = builder.rack_aware(rack);
        }

        for (from, to) in file.ip_map.unwrap_or_default() {
            builder = builder.map_ip(from, to);
        }

        if let Some(fail) = file.fail_if_not_connected {
            builder = builder.fail_if_not_connected(fail);
        }

        if let Some(tls) = file.tls {
            builder = builder.tls(|mut t| {
                if let Some(enabled) = tls.enabled {
                    t = t.enabled(enabled);
                }
                if let Some(path) = tls.ca_cert_path {
                    t = t.ca_cert_path(path);
                }
                if let Some(path) = tls.client_cert_path {
                    t = t.client_cert_path(path);
                }
                if let Some(path) = tls.client_key_path {
                    t = t.client_key_path(path);
                }
                if let Some(name) = tls.tls_name {
                    t = t.tls_name(name);
                }
                if let Some(skip) = tls.skip_name_verification {
                    t = t.skip_name_verification(skip);
                }
                t
            });
        }

        builder.build()
    }
}

impl ClientPolicy {
    /// Loads a policy from a YAML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_yaml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        read_yaml(path.as_ref())?.try_into()
    }

    /// Loads a policy from a TOML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        read_toml(path.as_ref())?.try_into()
    }

    /// Loads a policy from environment variables.
    ///
    /// This method is always available (no feature flag required).
    ///
    /// | Variable | Maps to |
    /// |----------|---------|
    /// | `AEROSPIKE_USER` | `user` |
    /// | `AEROSPIKE_PASSWORD` | `password` |
    /// | `AEROSPIKE_AUTH_MODE` | `internal`, `external` or `pki` |
    /// | `AEROSPIKE_CLUSTER_NAME` | `cluster_name` |
    /// | `AEROSPIKE_TIMEOUT_MS` | connect and info timeout |
    /// | `AEROSPIKE_TEND_INTERVAL_MS` | tend period |
    /// | `AEROSPIKE_CONNECTION_QUEUE_SIZE` | per-node connection cap |
    /// | `AEROSPIKE_MIN_CONNECTIONS_PER_NODE` | connections kept open |
    /// | `AEROSPIKE_RACK_ID` | local rack, enables rack-aware reads |
    /// | `AEROSPIKE_TLS_CA_CERT_PATH` | CA certificate, enables TLS |
    pub fn from_env() -> Result<Self, ConfigError> {
        file_config_from_env().try_into()
    }
}

/// Builds a [`FileConfig`] from `AEROSPIKE_*` environment variables.
///
/// `AEROSPIKE_HOSTS` holds comma-separated seeds.
pub fn file_config_from_env() -> FileConfig {
    fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
    }

    let mut file_config = FileConfig {
        user: std::env::var("AEROSPIKE_USER").ok(),
        password: std::env::var("AEROSPIKE_PASSWORD").ok(),
        auth_mode: std::env::var("AEROSPIKE_AUTH_MODE").ok(),
        cluster_name: std::env::var("AEROSPIKE_CLUSTER_NAME").ok(),
        timeout_ms: parsed("AEROSPIKE_TIMEOUT_MS"),
        tend_interval_ms: parsed("AEROSPIKE_TEND_INTERVAL_MS"),
        connection_queue_size: parsed("AEROSPIKE_CONNECTION_QUEUE_SIZE"),
        min_connections_per_node: parsed("AEROSPIKE_MIN_CONNECTIONS_PER_NODE"),
        rack_id: parsed("AEROSPIKE_RACK_ID"),
        ..Default::default()
    };

    if let Ok(val) = std::env::var("AEROSPIKE_HOSTS") {
        file_config.hosts = Some(val.split(',').map(|s| s.trim().to_string()).collect());
    }

    if let Ok(path) = std::env::var("AEROSPIKE_TLS_CA_CERT_PATH") {
        file_config.tls.get_or_insert_with(Default::default).ca_cert_path = Some(path);
    }

    file_config
}

#[cfg(feature = "config-file")]
fn read_yaml(path: &std::path::Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::new(format!("failed to read YAML config file: {e}")))?;
    serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::new(format!("failed to parse YAML config: {e}")))
}

#[cfg(feature = "config-file")]
fn read_toml(path: &std::path::Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::new(format!("failed to read TOML config file: {e}")))?;
    toml_crate::from_str(&content)
        .map_err(|e| ConfigError::new(format!("failed to parse TOML config: {e}")))
}

/// Loads a configuration file, detecting the format by extension, and
/// returns the policy together with the seed hosts it lists.
///
/// Supports `.yaml`, `.yml`, and `.toml` extensions.
/// Requires the `config-file` feature.
#[cfg(feature = "config-file")]
pub fn load_config<P: AsRef<std::path::Path>>(
    path: P,
) -> Result<(ClientPolicy, Vec<Host>), ConfigError> {
    let path = path.as_ref();
    let file_config = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => read_yaml(path)?,
        Some("toml") => read_toml(path)?,
        Some(ext) => {
            return Err(ConfigError::new(format!(
                "unsupported config file extension: .{ext} (expected .yaml, .yml, or .toml)"
            )))
        }
        None => {
            return Err(ConfigError::new(
                "config file has no extension; expected .yaml, .yml, or .toml",
            ))
        }
    };
    let hosts = file_config.seed_hosts()?;
    Ok((file_config.try_into()?, hosts))
}
