//! Client configuration types and builders.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default cluster connect and info timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default login timeout.
const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default idle time before a pooled connection is dropped.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(55);
/// Default tend period.
const DEFAULT_TEND_INTERVAL: Duration = Duration::from_secs(1);
/// Shortest tend period accepted.
const MIN_TEND_INTERVAL: Duration = Duration::from_millis(10);
/// Default per-node connection cap.
const DEFAULT_CONNECTION_QUEUE_SIZE: usize = 100;
/// Default error budget per node per window.
const DEFAULT_MAX_ERROR_RATE: u32 = 100;
/// Default error window, in tend ticks.
const DEFAULT_ERROR_RATE_WINDOW: u32 = 1;

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for aerospike_core::Error {
    fn from(e: ConfigError) -> Self {
        aerospike_core::Error::Configuration(e.message)
    }
}

/// How the client authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Server-side user database; only the password hash is sent.
    #[default]
    Internal,
    /// External directory (LDAP); the clear password is sent too, so TLS
    /// is required.
    External,
    /// Client certificate; no password is sent.
    Pki,
}

/// TLS settings for node connections.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    enabled: bool,
    ca_cert_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    tls_name: Option<String>,
    skip_name_verification: bool,
}

impl TlsPolicy {
    /// Returns whether TLS is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the CA certificate path.
    pub fn ca_cert_path(&self) -> Option<&PathBuf> {
        self.ca_cert_path.as_ref()
    }

    /// Returns the client certificate path.
    pub fn client_cert_path(&self) -> Option<&PathBuf> {
        self.client_cert_path.as_ref()
    }

    /// Returns the client private key path.
    pub fn client_key_path(&self) -> Option<&PathBuf> {
        self.client_key_path.as_ref()
    }

    /// Returns the server name override used for certificate checks.
    pub fn tls_name(&self) -> Option<&str> {
        self.tls_name.as_deref()
    }

    /// Returns true if certificate names are not matched against the host.
    pub fn skip_name_verification(&self) -> bool {
        self.skip_name_verification
    }

    /// Returns true if a client certificate is configured.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            tls_name: None,
            skip_name_verification: false,
        }
    }
}

/// Builder for `TlsPolicy`.
#[derive(Debug, Clone, Default)]
pub struct TlsPolicyBuilder {
    enabled: Option<bool>,
    ca_cert_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    tls_name: Option<String>,
    skip_name_verification: Option<bool>,
}

impl TlsPolicyBuilder {
    /// Creates a new TLS policy builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables TLS.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Sets the CA certificate path and enables TLS.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled.get_or_insert(true);
        self
    }

    /// Sets the client certificate path.
    pub fn client_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    /// Sets the client private key path.
    pub fn client_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    /// Sets both client certificate and key paths.
    pub fn client_auth(self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.client_cert_path(cert_path).client_key_path(key_path)
    }

    /// Overrides the server name checked against certificates.
    pub fn tls_name(mut self, name: impl Into<String>) -> Self {
        self.tls_name = Some(name.into());
        self
    }

    /// Disables certificate name matching.
    pub fn skip_name_verification(mut self, skip: bool) -> Self {
        self.skip_name_verification = Some(skip);
        self
    }

    /// Builds the TLS policy.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if only one of the client certificate and key
    /// paths is set.
    pub fn build(self) -> Result<TlsPolicy, ConfigError> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::new(
                "both client_cert_path and client_key_path must be provided together",
            ));
        }

        Ok(TlsPolicy {
            enabled: self.enabled.unwrap_or(false),
            ca_cert_path: self.ca_cert_path,
            client_cert_path: self.client_cert_path,
            client_key_path: self.client_key_path,
            tls_name: self.tls_name,
            skip_name_verification: self.skip_name_verification.unwrap_or(false),
        })
    }
}

/// Cluster-wide client settings.
#[derive(Debug, Clone)]
pub struct ClientPolicy {
    user: Option<String>,
    password: Option<String>,
    auth_mode: AuthMode,
    cluster_name: Option<String>,
    tls: TlsPolicy,
    timeout: Duration,
    login_timeout: Duration,
    idle_timeout: Duration,
    tend_interval: Duration,
    min_connections_per_node: usize,
    connection_queue_size: usize,
    limit_connections_to_queue_size: bool,
    opening_connection_threshold: usize,
    max_error_rate: u32,
    error_rate_window: u32,
    use_services_alternate: bool,
    rack_aware: bool,
    rack_id: i32,
    ip_map: HashMap<String, String>,
    fail_if_not_connected: bool,
}

impl ClientPolicy {
    /// Creates a new builder.
    pub fn builder() -> ClientPolicyBuilder {
        ClientPolicyBuilder::new()
    }

    /// Returns the user name.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the clear password.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Returns true if a user is configured.
    pub fn requires_authentication(&self) -> bool {
        self.user.is_some() || self.auth_mode == AuthMode::Pki
    }

    /// Returns the authentication mode.
    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    /// Returns the expected cluster name.
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    /// Returns the TLS policy.
    pub fn tls(&self) -> &TlsPolicy {
        &self.tls
    }

    /// Returns the connect and info timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the login timeout.
    pub fn login_timeout(&self) -> Duration {
        self.login_timeout
    }

    /// Returns how long a pooled connection may sit idle.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the tend period.
    pub fn tend_interval(&self) -> Duration {
        self.tend_interval
    }

    /// Returns the number of connections kept open per node.
    pub fn min_connections_per_node(&self) -> usize {
        self.min_connections_per_node
    }

    /// Returns the per-node connection cap.
    pub fn connection_queue_size(&self) -> usize {
        self.connection_queue_size
    }

    /// Returns true if the queue size is a hard cap on open connections.
    pub fn limit_connections_to_queue_size(&self) -> bool {
        self.limit_connections_to_queue_size
    }

    /// Returns the cluster-wide cap on concurrent connects; zero is no cap.
    pub fn opening_connection_threshold(&self) -> usize {
        self.opening_connection_threshold
    }

    /// Returns the error budget per node per window; zero disables it.
    pub fn max_error_rate(&self) -> u32 {
        self.max_error_rate
    }

    /// Returns the error window length in tend ticks.
    pub fn error_rate_window(&self) -> u32 {
        self.error_rate_window
    }

    /// Returns true if alternate service addresses are used.
    pub fn use_services_alternate(&self) -> bool {
        self.use_services_alternate
    }

    /// Returns true if reads prefer nodes on the local rack.
    pub fn rack_aware(&self) -> bool {
        self.rack_aware
    }

    /// Returns the local rack id.
    pub fn rack_id(&self) -> i32 {
        self.rack_id
    }

    /// Returns the host rewrite table.
    pub fn ip_map(&self) -> &HashMap<String, String> {
        &self.ip_map
    }

    /// Returns true if boot fails when no seed is reachable.
    pub fn fail_if_not_connected(&self) -> bool {
        self.fail_if_not_connected
    }

    /// Returns the protocol suffix used for service and peer commands.
    pub(crate) fn service_suffix(&self) -> &'static str {
        match (self.tls.enabled(), self.use_services_alternate) {
            (false, false) => "clear-std",
            (true, false) => "tls-std",
            (false, true) => "clear-alt",
            (true, true) => "tls-alt",
        }
    }
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            auth_mode: AuthMode::Internal,
            cluster_name: None,
            tls: TlsPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tend_interval: DEFAULT_TEND_INTERVAL,
            min_connections_per_node: 0,
            connection_queue_size: DEFAULT_CONNECTION_QUEUE_SIZE,
            limit_connections_to_queue_size: true,
            opening_connection_threshold: 0,
            max_error_rate: DEFAULT_MAX_ERROR_RATE,
            error_rate_window: DEFAULT_ERROR_RATE_WINDOW,
            use_services_alternate: false,
            rack_aware: false,
            rack_id: 0,
            ip_map: HashMap::new(),
            fail_if_not_connected: true,
        }
    }
}

/// Builder for `ClientPolicy`.
#[derive(Debug, Clone, Default)]
pub struct ClientPolicyBuilder {
    user: Option<String>,
    password: Option<String>,
    auth_mode: Option<AuthMode>,
    cluster_name: Option<String>,
    tls: TlsPolicyBuilder,
    timeout: Option<Duration>,
    login_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    tend_interval: Option<Duration>,
    min_connections_per_node: Option<usize>,
    connection_queue_size: Option<usize>,
    limit_connections_to_queue_size: Option<bool>,
    opening_connection_threshold: Option<usize>,
    max_error_rate: Option<u32>,
    error_rate_window: Option<u32>,
    use_services_alternate: Option<bool>,
    rack_aware: Option<bool>,
    rack_id: Option<i32>,
    ip_map: HashMap<String, String>,
    fail_if_not_connected: Option<bool>,
}

impl ClientPolicyBuilder {
    /// Creates a new client policy builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user and password.
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the user name.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the authentication mode.
    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = Some(mode);
        self
    }

    /// Sets the expected cluster name; nodes reporting another name are
    /// rejected.
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    /// Configures TLS using a builder function.
    pub fn tls<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TlsPolicyBuilder) -> TlsPolicyBuilder,
    {
        self.tls = f(self.tls);
        self
    }

    /// Sets the connect and info timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the login timeout.
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = Some(timeout);
        self
    }

    /// Sets the idle timeout for pooled connections.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the tend period.
    pub fn tend_interval(mut self, interval: Duration) -> Self {
        self.tend_interval = Some(interval);
        self
    }

    /// Sets the number of connections kept open per node.
    pub fn min_connections_per_node(mut self, n: usize) -> Self {
        self.min_connections_per_node = Some(n);
        self
    }

    /// Sets the per-node connection cap.
    pub fn connection_queue_size(mut self, n: usize) -> Self {
        self.connection_queue_size = Some(n);
        self
    }

    /// Makes the queue size a hard cap on open connections.
    pub fn limit_connections_to_queue_size(mut self, limit: bool) -> Self {
        self.limit_connections_to_queue_size = Some(limit);
        self
    }

    /// Sets the cluster-wide cap on concurrent connects.
    pub fn opening_connection_threshold(mut self, n: usize) -> Self {
        self.opening_connection_threshold = Some(n);
        self
    }

    /// Sets the error budget per node per window.
    pub fn max_error_rate(mut self, rate: u32) -> Self {
        self.max_error_rate = Some(rate);
        self
    }

    /// Sets the error window length in tend ticks.
    pub fn error_rate_window(mut self, ticks: u32) -> Self {
        self.error_rate_window = Some(ticks);
        self
    }

    /// Uses alternate service addresses.
    pub fn use_services_alternate(mut self, alternate: bool) -> Self {
        self.use_services_alternate = Some(alternate);
        self
    }

    /// Enables rack-aware reads for the given local rack.
    pub fn rack_aware(mut self, rack_id: i32) -> Self {
        self.rack_aware = Some(true);
        self.rack_id = Some(rack_id);
        self
    }

    /// Rewrites a host reported by the server.
    pub fn map_ip(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.ip_map.insert(from.into(), to.into());
        self
    }

    /// Sets whether boot fails when no seed is reachable.
    pub fn fail_if_not_connected(mut self, fail: bool) -> Self {
        self.fail_if_not_connected = Some(fail);
        self
    }

    /// Builds the client policy, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `connection_queue_size` is zero
    /// - `min_connections_per_node` exceeds `connection_queue_size`
    /// - a password is set without a user
    /// - external authentication is requested without TLS
    /// - `error_rate_window` is zero
    pub fn build(self) -> Result<ClientPolicy, ConfigError> {
        let tls = self.tls.build()?;
        let auth_mode = self.auth_mode.unwrap_or_default();
        let connection_queue_size = self
            .connection_queue_size
            .unwrap_or(DEFAULT_CONNECTION_QUEUE_SIZE);
        let min_connections_per_node = self.min_connections_per_node.unwrap_or(0);
        let error_rate_window = self.error_rate_window.unwrap_or(DEFAULT_ERROR_RATE_WINDOW);

        if connection_queue_size == 0 {
            return Err(ConfigError::new("connection_queue_size must be positive"));
        }

        if min_connections_per_node > connection_queue_size {
            return Err(ConfigError::new(
                "min_connections_per_node must not exceed connection_queue_size",
            ));
        }

        if self.password.is_some() && self.user.is_none() {
            return Err(ConfigError::new("password requires a user"));
        }

        if auth_mode == AuthMode::External && !tls.enabled() {
            return Err(ConfigError::new(
                "external authentication sends the clear password and requires TLS",
            ));
        }

        if error_rate_window == 0 {
            return Err(ConfigError::new("error_rate_window must be at least 1"));
        }

        let tend_interval = self
            .tend_interval
            .unwrap_or(DEFAULT_TEND_INTERVAL)
            .max(MIN_TEND_INTERVAL);

        Ok(ClientPolicy {
            user: self.user,
            password: self.password,
            auth_mode,
            cluster_name: self.cluster_name,
            tls,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            login_timeout: self.login_timeout.unwrap_or(DEFAULT_LOGIN_TIMEOUT),
            idle_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            tend_interval,
            min_connections_per_node,
            connection_queue_size,
            limit_connections_to_queue_size: self.limit_connections_to_queue_size.unwrap_or(true),
            opening_connection_threshold: self.opening_connection_threshold.unwrap_or(0),
            max_error_rate: self.max_error_rate.unwrap_or(DEFAULT_MAX_ERROR_RATE),
            error_rate_window,
            use_services_alternate: self.use_services_alternate.unwrap_or(false),
            rack_aware: self.rack_aware.unwrap_or(false),
            rack_id: self.rack_id.unwrap_or(0),
            ip_map: self.ip_map,
            fail_if_not_connected: self.fail_if_not_connected.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_policy() {
        let policy = ClientPolicy::default();
        assert_eq!(policy.tend_interval(), Duration::from_secs(1));
        assert_eq!(policy.connection_queue_size(), 100);
        assert!(policy.fail_if_not_connected());
        assert!(!policy.requires_authentication());
        assert_eq!(policy.service_suffix(), "clear-std");
    }

    #[test]
    fn test_builder_credentials() {
        let policy = ClientPolicy::builder()
            .credentials("admin", "secret")
            .build()
            .unwrap();
        assert_eq!(policy.user(), Some("admin"));
        assert_eq!(policy.password(), Some("secret"));
        assert!(policy.requires_authentication());
    }

    #[test]
    fn test_password_without_user_fails() {
        let result = ClientPolicy::builder().password("secret").build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("password requires a user"));
    }

    #[test]
    fn test_min_connections_exceeding_queue_fails() {
        let result = ClientPolicy::builder()
            .connection_queue_size(4)
            .min_connections_per_node(5)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_queue_size_fails() {
        assert!(ClientPolicy::builder()
            .connection_queue_size(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_tend_interval_is_clamped() {
        let policy = ClientPolicy::builder()
            .tend_interval(Duration::from_millis(1))
            .build()
            .unwrap();
        assert_eq!(policy.tend_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_external_auth_requires_tls() {
        let result = ClientPolicy::builder()
            .credentials("ldap-user", "pw")
            .auth_mode(AuthMode::External)
            .build();
        assert!(result.is_err());

        let policy = ClientPolicy::builder()
            .credentials("ldap-user", "pw")
            .auth_mode(AuthMode::External)
            .tls(|t| t.ca_cert_path("/etc/ssl/ca.pem"))
            .build()
            .unwrap();
        assert!(policy.tls().enabled());
        assert_eq!(policy.service_suffix(), "tls-std");
    }

    #[test]
    fn test_tls_requires_cert_and_key_together() {
        let result = TlsPolicyBuilder::new()
            .enabled(true)
            .client_cert_path("/tmp/client.pem")
            .build();
        assert!(result.is_err());

        let tls = TlsPolicyBuilder::new()
            .client_auth("/tmp/client.pem", "/tmp/client.key")
            .build()
            .unwrap();
        assert!(tls.has_client_auth());
    }

    #[test]
    fn test_rack_aware_and_ip_map() {
        let policy = ClientPolicy::builder()
            .rack_aware(2)
            .map_ip("10.0.0.1", "192.168.1.1")
            .use_services_alternate(true)
            .build()
            .unwrap();
        assert!(policy.rack_aware());
        assert_eq!(policy.rack_id(), 2);
        assert_eq!(policy.ip_map()["10.0.0.1"], "192.168.1.1");
        assert_eq!(policy.service_suffix(), "clear-alt");
    }

    #[test]
    fn test_config_error_converts() {
        let err: aerospike_core::Error = ConfigError::new("bad").into();
        assert_eq!(err.to_string(), "configuration error: bad");
    }
}
