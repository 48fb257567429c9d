//! State shared by the cluster and every node it owns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use aerospike_core::{Error, Result};

use super::host::Host;
use crate::config::ClientPolicy;
use crate::connection::{BufferPool, ConnectOptions, Connection};
use crate::security::{admin, Credentials, Session};
#[cfg(feature = "tls")]
use crate::security::TlsContext;

/// Policy, credentials and connection settings handed to nodes.
#[derive(Debug)]
pub struct ClusterContext {
    policy: ClientPolicy,
    connect_options: ConnectOptions,
    credentials: RwLock<Option<Credentials>>,
    opening: AtomicUsize,
}

/// Releases an opening-connection slot on drop.
#[derive(Debug)]
pub struct OpeningPermit<'a> {
    counter: Option<&'a AtomicUsize>,
}

impl Drop for OpeningPermit<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl ClusterContext {
    /// Hashes credentials and builds the TLS connector.
    pub fn new(policy: ClientPolicy) -> Result<Self> {
        let credentials = Credentials::from_policy(&policy)?;

        #[cfg(feature = "tls")]
        let tls = if policy.tls().enabled() {
            Some(TlsContext::new(policy.tls())?)
        } else {
            None
        };
        #[cfg(not(feature = "tls"))]
        if policy.tls().enabled() {
            return Err(Error::Configuration(
                "TLS requested but the `tls` feature is disabled".to_string(),
            ));
        }

        let connect_options = ConnectOptions {
            timeout: policy.timeout(),
            idle_timeout: policy.idle_timeout(),
            buffers: Arc::new(BufferPool::default()),
            #[cfg(feature = "tls")]
            tls,
        };

        Ok(Self {
            policy,
            connect_options,
            credentials: RwLock::new(credentials),
            opening: AtomicUsize::new(0),
        })
    }

    /// Returns the client policy.
    pub fn policy(&self) -> &ClientPolicy {
        &self.policy
    }

    /// Returns the current credentials.
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the credentials used for new logins.
    pub fn set_credentials(&self, credentials: Credentials) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credentials);
    }

    /// Reserves a slot under the cluster-wide opening connection threshold.
    ///
    /// Returns `None` when the threshold is reached.
    pub fn try_open(&self) -> Option<OpeningPermit<'_>> {
        let threshold = self.policy.opening_connection_threshold();
        if threshold == 0 {
            return Some(OpeningPermit { counter: None });
        }
        let opening = self.opening.fetch_add(1, Ordering::AcqRel) + 1;
        let permit = OpeningPermit {
            counter: Some(&self.opening),
        };
        (opening <= threshold).then_some(permit)
    }

    /// Number of connections currently being opened.
    pub fn opening_count(&self) -> usize {
        self.opening.load(Ordering::Acquire)
    }

    /// Opens a connection without logging in.
    pub async fn connect(&self, address: SocketAddr, host: &Host) -> Result<Connection> {
        Connection::connect(
            address,
            &host.name,
            host.tls_name.as_deref(),
            &self.connect_options,
        )
        .await
    }

    /// Logs in on a fresh connection when credentials are configured.
    pub async fn login(&self, conn: &mut Connection) -> Result<Option<Session>> {
        let Some(credentials) = self.credentials() else {
            return Ok(None);
        };
        let timeout = self.policy.login_timeout();
        conn.set_timeout(Some(Instant::now() + timeout), timeout);
        let session = admin::login(conn, &credentials)
            .await
            .map_err(|e| match e {
                Error::Server { code, message } => {
                    Error::Authentication(format!("login as {} failed: {}: {}", credentials.user(), code, message))
                }
                other => other,
            })?;
        conn.set_timeout(None, std::time::Duration::ZERO);
        Ok(session)
    }
}
