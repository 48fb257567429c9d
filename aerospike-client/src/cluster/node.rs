//! A server node: identity, connection pool and tend state.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::instrument;

use aerospike_core::protocol::info;
use aerospike_core::{Error, Result, ResultCode};

use super::context::ClusterContext;
use super::host::Host;
use super::partition::PartitionMap;
use super::peers::{parse_peers, Peers};
use crate::config::AuthMode;
use crate::connection::{Connection, ConnectionPool};
use crate::security::{admin, Session};

/// Pause between pool polls while waiting for a connection.
const POOL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Wait applied when a caller passes no timeout.
const DEFAULT_WAIT: Duration = Duration::from_secs(1);

/// Server features the client cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(u32);

impl Features {
    /// Partition scans (`pscans`).
    pub const PARTITION_SCAN: u32 = 1;
    /// Query listing (`query-show`).
    pub const QUERY_SHOW: u32 = 1 << 1;

    /// Parses a `features` info reply.
    pub fn parse(reply: &str) -> Self {
        let mut bits = 0;
        for feature in reply.split(';').map(str::trim) {
            match feature {
                "pscans" => bits |= Self::PARTITION_SCAN,
                "query-show" => bits |= Self::QUERY_SHOW,
                _ => {}
            }
        }
        Self(bits)
    }

    /// Returns true if all of `flags` are set.
    pub fn contains(&self, flags: u32) -> bool {
        self.0 & flags == flags
    }
}

/// Everything learned about a node while validating it.
#[derive(Debug)]
pub struct NodeInfo {
    /// Node name.
    pub name: String,
    /// Host used to connect.
    pub host: Host,
    /// Resolved address of `host`.
    pub address: SocketAddr,
    /// Other names the node is known by.
    pub aliases: Vec<Host>,
    /// Supported features.
    pub features: Features,
    /// Session obtained while validating.
    pub session: Option<Session>,
    /// Validation connection, kept as the tend connection.
    pub conn: Option<Connection>,
}

/// A cluster node.
pub struct Node {
    context: Arc<ClusterContext>,
    name: String,
    host: Host,
    address: SocketAddr,
    aliases: Mutex<Vec<Host>>,
    features: Features,

    pool: ConnectionPool,
    connection_count: AtomicUsize,
    tend_conn: tokio::sync::Mutex<Option<Connection>>,
    session: tokio::sync::Mutex<Option<Session>>,

    racks: RwLock<HashMap<String, i32>>,
    peers_generation: AtomicI64,
    partition_generation: AtomicI64,
    rebalance_generation: AtomicI64,
    peers_count: AtomicUsize,
    partition_changed: AtomicBool,

    failures: AtomicU32,
    reference_count: AtomicUsize,
    error_count: AtomicU32,
    active: AtomicBool,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.host)
    }
}

impl Node {
    /// Creates a node from validation results.
    pub fn new(info: NodeInfo, context: Arc<ClusterContext>) -> Self {
        let policy = context.policy();
        let connection_count = usize::from(info.conn.is_some());
        Self {
            pool: ConnectionPool::new(policy.connection_queue_size()),
            name: info.name,
            host: info.host,
            address: info.address,
            aliases: Mutex::new(info.aliases),
            features: info.features,
            connection_count: AtomicUsize::new(connection_count),
            tend_conn: tokio::sync::Mutex::new(info.conn),
            session: tokio::sync::Mutex::new(info.session),
            racks: RwLock::new(HashMap::new()),
            peers_generation: AtomicI64::new(-1),
            partition_generation: AtomicI64::new(-2),
            rebalance_generation: AtomicI64::new(-1),
            peers_count: AtomicUsize::new(0),
            partition_changed: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            reference_count: AtomicUsize::new(0),
            error_count: AtomicU32::new(0),
            active: AtomicBool::new(true),
            context,
        }
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Resolved address of the primary host.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Other hosts this node answers on.
    pub fn aliases(&self) -> Vec<Host> {
        self.aliases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds an alias.
    pub fn add_alias(&self, host: Host) {
        let mut aliases = self.aliases.lock().unwrap_or_else(PoisonError::into_inner);
        if !aliases.contains(&host) {
            aliases.push(host);
        }
    }

    /// True once the node has a partition map and has not been removed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.partition_generation.load(Ordering::Acquire) >= -1
    }

    /// Marks the node inactive.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Returns true if the server supports partition scans.
    pub fn supports_partition_scan(&self) -> bool {
        self.features.contains(Features::PARTITION_SCAN)
    }

    /// Returns true if the server supports `query-show`.
    pub fn supports_query_show(&self) -> bool {
        self.features.contains(Features::QUERY_SHOW)
    }

    /// Consecutive failed refreshes.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Times other nodes referenced this node during the current tend.
    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    /// Counts a reference from a peer list.
    pub fn add_reference(&self) {
        self.reference_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Partition generation last applied.
    pub fn partition_generation(&self) -> i64 {
        self.partition_generation.load(Ordering::Acquire)
    }

    /// Peers generation last applied.
    pub fn peers_generation(&self) -> i64 {
        self.peers_generation.load(Ordering::Acquire)
    }

    /// True when the last refresh saw a new partition generation.
    pub fn partition_changed(&self) -> bool {
        self.partition_changed.load(Ordering::Acquire)
    }

    /// Clears per-tend state before a refresh.
    pub fn reset_tend_state(&self) {
        self.reference_count.store(0, Ordering::Release);
        self.partition_changed.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_partition_generation(&self, generation: i64) {
        self.partition_generation.store(generation, Ordering::Release);
    }

    // Connections

    /// Connections owned by this node, pooled or in use.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    /// Idle connections in the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.len()
    }

    /// Takes a pooled connection.
    ///
    /// When the pool is empty this fails with [`Error::PoolEmpty`] after
    /// starting a background connect, or with [`Error::PoolExhausted`] when
    /// the node is at its connection limit. Callers retry.
    pub fn get_connection(
        self: &Arc<Self>,
        hint: u8,
        deadline: Option<Instant>,
        socket_timeout: Duration,
    ) -> Result<Connection> {
        if !self.active.load(Ordering::Acquire) {
            return Err(self.not_available());
        }
        if let Some(conn) = self.poll_pool(hint, deadline, socket_timeout) {
            return Ok(conn);
        }

        match self.new_connection_allowed() {
            Ok(()) => {
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    match node.new_connection(false).await {
                        Ok(conn) => node.put_connection_with_hint(conn, hint),
                        Err(e) => {
                            tracing::debug!(node = %node.name, error = %e, "failed to open pooled connection")
                        }
                    }
                });
            }
            Err(Error::PoolExhausted(msg)) => return Err(Error::PoolExhausted(msg)),
            Err(_) => {}
        }
        Err(Error::PoolEmpty(format!("node {}", self.name)))
    }

    fn poll_pool(&self, hint: u8, deadline: Option<Instant>, socket_timeout: Duration) -> Option<Connection> {
        while let Some(mut conn) = self.pool.poll(hint) {
            if conn.is_connected() && !conn.is_idle() {
                conn.set_timeout(deadline, socket_timeout);
                return Some(conn);
            }
            self.close_connection(conn);
        }
        None
    }

    /// Waits up to `timeout` for a pooled connection, starting a connect
    /// first when the pool is empty.
    pub async fn wait_for_connection(self: &Arc<Self>, timeout: Duration) -> Result<Connection> {
        let timeout = if timeout.is_zero() { DEFAULT_WAIT } else { timeout };
        let deadline = Instant::now() + timeout;
        match self.get_connection(0, Some(deadline), timeout) {
            Ok(conn) => Ok(conn),
            Err(e @ (Error::PoolEmpty(_) | Error::PoolExhausted(_))) => {
                self.poll_connection(0, Some(deadline), timeout, timeout)
                    .await
                    .ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Polls the pool until a connection is returned or `wait` elapses.
    ///
    /// Never opens a connection itself; pair it with
    /// [`Node::get_connection`], which starts one.
    pub async fn poll_connection(
        &self,
        hint: u8,
        deadline: Option<Instant>,
        socket_timeout: Duration,
        wait: Duration,
    ) -> Option<Connection> {
        let until = Instant::now() + wait;
        while Instant::now() < until && self.active.load(Ordering::Acquire) {
            tokio::time::sleep(POOL_POLL_INTERVAL).await;
            if let Some(conn) = self.poll_pool(hint, deadline, socket_timeout) {
                return Some(conn);
            }
        }
        None
    }

    /// Returns a connection to the pool, closing it if the node is gone or
    /// the pool is full.
    pub fn put_connection(&self, conn: Connection) {
        self.put_connection_with_hint(conn, 0);
    }

    fn put_connection_with_hint(&self, mut conn: Connection, hint: u8) {
        conn.refresh();
        conn.set_timeout(None, Duration::ZERO);
        if !self.active.load(Ordering::Acquire) || !conn.is_connected() {
            self.close_connection(conn);
            return;
        }
        if let Err(conn) = self.pool.offer(conn, hint) {
            self.close_connection(conn);
        }
    }

    /// Closes a connection owned by this node.
    pub fn close_connection(&self, conn: Connection) {
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
        conn.close();
    }

    fn not_available(&self) -> Error {
        Error::client(
            ResultCode::ServerNotAvailable,
            format!("node {} is not active", self.name),
        )
    }

    fn new_connection_allowed(&self) -> Result<()> {
        if !self.active.load(Ordering::Acquire) {
            return Err(self.not_available());
        }
        let policy = self.context.policy();
        if policy.limit_connections_to_queue_size()
            && self.connection_count() >= policy.connection_queue_size()
        {
            return Err(Error::PoolExhausted(format!(
                "node {} has {} connections",
                self.name,
                self.connection_count()
            )));
        }
        let threshold = policy.opening_connection_threshold();
        if threshold > 0 && self.context.opening_count() >= threshold {
            return Err(Error::client(
                ResultCode::NoMoreConnections,
                "too many connections being opened",
            ));
        }
        Ok(())
    }

    /// Opens and authenticates a new connection counted against this node.
    async fn new_connection(&self, override_threshold: bool) -> Result<Connection> {
        if !self.active.load(Ordering::Acquire) {
            return Err(self.not_available());
        }

        let policy = self.context.policy();
        let count = self.connection_count.fetch_add(1, Ordering::AcqRel) + 1;
        if policy.limit_connections_to_queue_size() && count > policy.connection_queue_size() {
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::PoolExhausted(format!(
                "node {} reached {} connections",
                self.name,
                policy.connection_queue_size()
            )));
        }

        let _permit = if override_threshold {
            None
        } else {
            match self.context.try_open() {
                Some(permit) => Some(permit),
                None => {
                    self.connection_count.fetch_sub(1, Ordering::AcqRel);
                    return Err(Error::client(
                        ResultCode::NoMoreConnections,
                        "too many connections being opened",
                    ));
                }
            }
        };

        let mut conn = match self.context.connect(self.address, &self.host).await {
            Ok(conn) => conn,
            Err(e) => {
                self.increment_error_count();
                self.connection_count.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };

        if let Err(e) = self.authenticate(&mut conn).await {
            if e.is_network_error() {
                self.increment_error_count();
            }
            self.close_connection(conn);
            return Err(e);
        }
        Ok(conn)
    }

    /// Presents the session token, logging in once when it is missing or
    /// expired. Concurrent callers wait for that single login.
    async fn authenticate(&self, conn: &mut Connection) -> Result<()> {
        let Some(credentials) = self.context.credentials() else {
            return Ok(());
        };

        let token = {
            let mut session = self.session.lock().await;
            match session.as_ref() {
                Some(s) if !s.is_expired() => s.token.clone(),
                _ => {
                    *session = self.context.login(conn).await?;
                    return Ok(());
                }
            }
        };

        let timeout = self.context.policy().login_timeout();
        conn.set_timeout(Some(Instant::now() + timeout), timeout);
        admin::authenticate(conn, credentials.user(), &token).await?;
        conn.set_timeout(None, Duration::ZERO);
        Ok(())
    }

    /// Returns the session token when one is held and still valid.
    pub async fn session_token(&self) -> Option<Vec<u8>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| !s.is_expired())
            .map(|s| s.token.clone())
    }

    /// Opens connections so the node holds `count` more, bounded by the
    /// queue size. Zero fills the queue.
    #[instrument(name = "node.warm_up", skip(self), fields(node = %self.name))]
    pub async fn warm_up(&self, count: usize) -> Result<usize> {
        let capacity = self.context.policy().connection_queue_size();
        let room = capacity.saturating_sub(self.connection_count());
        let wanted = if count == 0 { room } else { count.min(room) };

        let results = futures::future::join_all((0..wanted).map(|_| self.new_connection(true))).await;

        let mut opened = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(conn) => {
                    opened += 1;
                    self.put_connection(conn);
                }
                Err(Error::PoolExhausted(_)) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::debug!(opened, wanted, "warmed up connections");
        match first_error {
            Some(e) if opened == 0 => Err(e),
            _ => Ok(opened),
        }
    }

    /// Tops the node up to `min_connections_per_node`.
    pub async fn fill_min_conns(&self) -> Result<usize> {
        let min = self.context.policy().min_connections_per_node();
        let missing = min.saturating_sub(self.connection_count());
        if missing == 0 {
            return Ok(0);
        }
        self.warm_up(missing).await
    }

    /// Closes pooled connections past their idle deadline.
    pub fn drop_idle_connections(&self) -> usize {
        let dropped = self.pool.drop_idle();
        let count = dropped.len();
        for conn in dropped {
            self.close_connection(conn);
        }
        count
    }

    // Error rate

    /// Counts a network or overload error when error throttling is on.
    pub fn increment_error_count(&self) {
        if self.context.policy().max_error_rate() > 0 {
            self.error_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Starts a new error rate window.
    pub fn reset_error_count(&self) {
        self.error_count.store(0, Ordering::Release);
    }

    /// Errors counted in the current window.
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Returns true while the node may accept commands.
    pub fn error_count_within_limit(&self) -> bool {
        let max = self.context.policy().max_error_rate();
        max == 0 || self.error_count() <= max
    }

    /// Fails with `MAX_ERROR_RATE` when the window is exhausted.
    pub fn validate_error_count(&self) -> Result<()> {
        if self.error_count_within_limit() {
            Ok(())
        } else {
            Err(Error::client(
                ResultCode::MaxErrorRate,
                format!("node {} exceeded its error rate", self.name),
            ))
        }
    }

    // Racks

    /// Rack of this node for a namespace.
    pub fn rack(&self, namespace: &str) -> Result<i32> {
        self.racks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .copied()
            .ok_or_else(|| {
                Error::client(
                    ResultCode::RackNotDefined,
                    format!("node {} has no rack for namespace {}", self.name, namespace),
                )
            })
    }

    /// Returns true if the node sits on `rack` for the namespace.
    pub fn has_rack(&self, namespace: &str, rack: i32) -> bool {
        self.rack(namespace).is_ok_and(|r| r == rack)
    }

    pub(crate) fn update_racks(&self, reply: &str) -> Result<()> {
        if reply.starts_with("ERROR") {
            return Err(Error::server(
                ResultCode::UnsupportedFeature,
                "racks are not supported by this server",
            ));
        }

        let mut racks = HashMap::new();
        for section in reply.split(';').filter(|s| !s.is_empty()) {
            let mut parts = section.split(':');
            let namespace = parts
                .next()
                .and_then(|p| p.strip_prefix("ns="))
                .ok_or_else(|| Error::Protocol(format!("invalid racks reply: {}", reply)))?;
            for part in parts {
                let Some((rack, nodes)) = part.split_once('=') else {
                    continue;
                };
                let rack_id: i32 = rack
                    .strip_prefix("rack_")
                    .and_then(|r| r.parse().ok())
                    .ok_or_else(|| Error::Protocol(format!("invalid rack `{}`", rack)))?;
                if nodes.split(',').any(|n| n == self.name) {
                    racks.insert(namespace.to_string(), rack_id);
                }
            }
        }

        *self.racks.write().unwrap_or_else(PoisonError::into_inner) = racks;
        Ok(())
    }

    // Info

    /// Sends info commands on the node's tend connection.
    ///
    /// The tend connection is created on demand and never lent to commands.
    pub async fn request_info<S: AsRef<str>>(
        self: &Arc<Self>,
        commands: &[S],
    ) -> Result<HashMap<String, String>> {
        let timeout = self.context.policy().timeout();
        let mut tend_conn = self.tend_conn.lock().await;
        let conn = self.init_tend_conn(&mut tend_conn, timeout).await?;

        match conn.request_info(commands).await {
            Ok(values) => Ok(values),
            Err(e) => {
                if let Some(conn) = tend_conn.take() {
                    self.close_connection(conn);
                }
                Err(e)
            }
        }
    }

    async fn init_tend_conn<'a>(
        self: &Arc<Self>,
        slot: &'a mut Option<Connection>,
        timeout: Duration,
    ) -> Result<&'a mut Connection> {
        if let Some(conn) = slot.take() {
            if conn.is_connected() {
                *slot = Some(conn);
            } else {
                self.close_connection(conn);
            }
        }

        let conn = match slot.take() {
            Some(conn) => conn,
            None if self.connection_count() == 0 => self.new_connection(true).await?,
            None => match self.pool.poll(0) {
                Some(conn) if conn.is_connected() => conn,
                Some(conn) => {
                    self.close_connection(conn);
                    self.new_connection(true).await?
                }
                None => self.new_connection(true).await?,
            },
        };

        let conn = slot.insert(conn);
        conn.set_timeout(Some(Instant::now() + timeout), timeout);
        Ok(conn)
    }

    /// Fetches the `statistics` reply as a map.
    pub async fn request_stats(self: &Arc<Self>) -> Result<HashMap<String, String>> {
        let values = self.request_info(&["statistics"]).await?;
        let stats = values.get("statistics").map(String::as_str).unwrap_or_default();
        info::check_response("statistics", stats)?;
        Ok(info::parse_name_value_list(stats, ';'))
    }

    /// Returns true when the node still has partitions to migrate.
    pub async fn migration_in_progress(self: &Arc<Self>) -> Result<bool> {
        let stats = self.request_stats().await?;
        Ok(stats
            .get("migrate_partitions_remaining")
            .is_some_and(|remaining| remaining != "0"))
    }

    /// Returns the cluster key the node reports once `namespace` is not
    /// migrating.
    pub async fn cluster_stable_key(self: &Arc<Self>, namespace: &str) -> Result<String> {
        let command = format!("cluster-stable:namespace={}", namespace);
        let values = self.request_info(&[command.as_str()]).await?;
        let key = values.get(&command).map(String::as_str).unwrap_or_default();
        info::check_response(&command, key)?;
        if key.is_empty() {
            return Err(Error::Protocol(format!("node {} sent an empty cluster key", self.name)));
        }
        Ok(key.to_string())
    }

    // Tend

    /// Refreshes generations, racks and the session.
    ///
    /// Runs once per tend. Failures are recorded on the node and returned.
    #[instrument(name = "node.refresh", skip(self, peers), fields(node = %self.name))]
    pub async fn refresh(self: &Arc<Self>, peers: &Peers) -> Result<()> {
        if !self.active.load(Ordering::Acquire) {
            return Ok(());
        }

        let rack_aware = self.context.policy().rack_aware();
        let mut commands = vec!["node", "peers-generation", "partition-generation"];
        if rack_aware {
            commands.push("rebalance-generation");
        }

        let result = async {
            let values = self.request_info(&commands).await?;
            self.verify_name(&values)?;
            self.verify_peers_generation(&values, peers)?;
            self.verify_partition_generation(&values)?;
            if rack_aware && self.verify_rebalance_generation(&values)? {
                let racks = self.request_info(&["racks:"]).await?;
                let reply = racks.get("racks:").map(String::as_str).unwrap_or_default();
                match self.update_racks(reply) {
                    Err(e) if e.matches(ResultCode::UnsupportedFeature) => return Err(e),
                    Err(e) => {
                        tracing::warn!(node = %self.name, error = %e, racks = reply, "failed to update rack info")
                    }
                    Ok(()) => {}
                }
            }
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = result {
            self.refresh_failed(&e);
            return Err(e);
        }

        self.failures.store(0, Ordering::Release);
        peers.increment_refresh_count();
        self.add_reference();

        if let Err(e) = self.refresh_session_token().await {
            tracing::warn!(node = %self.name, error = %e, "failed to refresh session token");
        }
        self.drop_idle_connections();
        if let Err(e) = self.fill_min_conns().await {
            tracing::debug!(node = %self.name, error = %e, "failed to fill minimum connections");
        }
        Ok(())
    }

    fn verify_name(&self, values: &HashMap<String, String>) -> Result<()> {
        let name = values
            .get("node")
            .ok_or_else(|| Error::InvalidNode(format!("node {} did not report its name", self.name)))?;
        if name != &self.name {
            self.deactivate();
            return Err(Error::InvalidNode(format!(
                "node name changed from {} to {}",
                self.name, name
            )));
        }
        Ok(())
    }

    fn generation(values: &HashMap<String, String>, command: &str) -> Result<i64> {
        values
            .get(command)
            .and_then(|g| g.trim().parse().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid {} reply: {:?}", command, values.get(command))))
    }

    fn verify_peers_generation(&self, values: &HashMap<String, String>, peers: &Peers) -> Result<()> {
        let generation = Self::generation(values, "peers-generation")?;
        let current = self.peers_generation();
        if current != generation {
            if current > generation {
                tracing::info!(node = %self.name, from = current, to = generation, "peers generation went backwards, the node may have restarted");
            }
            peers.set_gen_changed();
        }
        Ok(())
    }

    fn verify_partition_generation(&self, values: &HashMap<String, String>) -> Result<()> {
        let generation = Self::generation(values, "partition-generation")?;
        if self.partition_generation() != generation {
            self.partition_changed.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn verify_rebalance_generation(&self, values: &HashMap<String, String>) -> Result<bool> {
        let generation = Self::generation(values, "rebalance-generation")?;
        Ok(self.rebalance_generation.load(Ordering::Acquire) != generation
            && {
                self.rebalance_generation.store(generation, Ordering::Release);
                true
            })
    }

    fn refresh_failed(&self, error: &Error) {
        self.peers_generation.store(-1, Ordering::Release);
        self.partition_generation.store(-1, Ordering::Release);
        if self.context.policy().rack_aware() {
            self.rebalance_generation.store(-1, Ordering::Release);
        }
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(node = %self, failures, error = %error, "node refresh failed");
    }

    async fn refresh_session_token(self: &Arc<Self>) -> Result<()> {
        if self.context.policy().auth_mode() == AuthMode::Pki {
            return Ok(());
        }
        let horizon = Instant::now() + self.context.policy().tend_interval();
        let due = self
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.expiration)
            .is_some_and(|at| horizon >= at);
        if !due {
            return Ok(());
        }

        let timeout = self.context.policy().login_timeout();
        let mut tend_conn = self.tend_conn.lock().await;
        let conn = self.init_tend_conn(&mut tend_conn, timeout).await?;
        match self.context.login(conn).await {
            Ok(session) => {
                tracing::debug!(node = %self.name, "session token refreshed");
                *self.session.lock().await = session;
                Ok(())
            }
            Err(e) => {
                if let Some(conn) = tend_conn.take() {
                    self.close_connection(conn);
                }
                Err(e)
            }
        }
    }

    /// Fetches the node's peer list into `peers`.
    pub async fn refresh_peers(self: &Arc<Self>, peers: &Peers) {
        if self.failures() > 0 || !self.active.load(Ordering::Acquire) {
            return;
        }

        let command = format!("peers-{}", self.context.policy().service_suffix());
        let result = async {
            let values = self.request_info(&[command.as_str()]).await?;
            let reply = values.get(&command).map(String::as_str).unwrap_or_default();
            parse_peers(reply, self.context.policy().ip_map())
        }
        .await;

        match result {
            Ok(list) => {
                tracing::debug!(node = %self.name, peers = list.peers.len(), generation = list.generation, "refreshed peers");
                peers.add_peers(list.peers);
                self.peers_generation
                    .store(i64::from(list.generation), Ordering::Release);
                self.peers_count.store(peers.peer_count(), Ordering::Release);
                peers.increment_refresh_count();
            }
            Err(e) => self.refresh_failed(&e),
        }
    }

    /// Fetches the node's replica bitmaps into `map`.
    ///
    /// Returns the partition generation the replies belong to. The caller
    /// commits it with [`Node::commit_partition_generation`] once the map
    /// is published.
    ///
    /// Skipped for nodes that failed this tend, and for a node that sees
    /// no peers while others do, so a node isolated from the cluster cannot
    /// claim every partition.
    pub async fn refresh_partitions(
        self: &Arc<Self>,
        peers: &Peers,
        map: &Mutex<PartitionMap>,
        freshly_added: bool,
    ) -> Option<i64> {
        if !freshly_added
            && (self.failures() > 0
                || !self.active.load(Ordering::Acquire)
                || (self.peers_count.load(Ordering::Acquire) == 0 && peers.refresh_count() > 1))
        {
            return None;
        }

        let result = async {
            let values = self
                .request_info(&["partition-generation", "replicas"])
                .await?;
            let generation = Self::generation(&values, "partition-generation")?;
            let reply = values.get("replicas").map(String::as_str).unwrap_or_default();
            info::check_response("replicas", reply)?;
            map.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply_replicas(self, reply)?;
            Ok::<_, Error>(generation)
        }
        .await;

        match result {
            Ok(generation) => Some(generation),
            Err(e) => {
                self.refresh_failed(&e);
                None
            }
        }
    }

    /// Records the partition generation of a published map.
    pub(crate) fn commit_partition_generation(&self, generation: i64) {
        self.partition_generation.store(generation, Ordering::Release);
        self.partition_changed.store(true, Ordering::Release);
    }

    /// Keeps the generation stale so the next tend fetches replicas again.
    /// A node that never had one becomes active at -1.
    pub(crate) fn defer_partition_generation(&self) {
        self.partition_generation.fetch_max(-1, Ordering::AcqRel);
    }

    /// Deactivates the node and closes every connection.
    pub async fn close(&self) {
        self.deactivate();
        if let Some(conn) = self.tend_conn.lock().await.take() {
            self.close_connection(conn);
        }
        for conn in self.pool.drain() {
            self.close_connection(conn);
        }
        tracing::debug!(node = %self.name, "node closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{mock_node, node_at, test_node, InfoServer, MockInfo};
    use crate::config::ClientPolicy;

    #[test]
    fn test_features_parse() {
        let features = Features::parse("peers;pscans;float;query-show");
        assert!(features.contains(Features::PARTITION_SCAN));
        assert!(features.contains(Features::QUERY_SHOW));
        assert!(!Features::parse("peers").contains(Features::PARTITION_SCAN));
    }

    #[test]
    fn test_new_node_is_inactive_until_partitions_known() {
        let node = test_node("A");
        assert!(node.is_active());
        node.set_partition_generation(-2);
        assert!(!node.is_active());
    }

    #[test]
    fn test_racks_parse() {
        let node = test_node("BB9");
        node.update_racks("ns=test:rack_1=AA1,BB9:rack_2=CC3;ns=bar:rack_2=BB9;")
            .unwrap();
        assert_eq!(node.rack("test").unwrap(), 1);
        assert!(node.has_rack("bar", 2));
        assert_eq!(
            node.rack("other").unwrap_err().result_code(),
            ResultCode::RackNotDefined
        );

        let err = node.update_racks("ERROR::unknown command").unwrap_err();
        assert_eq!(err.result_code(), ResultCode::UnsupportedFeature);
    }

    #[test]
    fn test_error_rate() {
        let policy = ClientPolicy::builder().max_error_rate(2).build().unwrap();
        let node = crate::cluster::testing::test_node_with_policy("A", policy);
        node.increment_error_count();
        node.increment_error_count();
        assert!(node.error_count_within_limit());
        node.increment_error_count();
        assert!(!node.error_count_within_limit());
        assert_eq!(
            node.validate_error_count().unwrap_err().result_code(),
            ResultCode::MaxErrorRate
        );
        node.reset_error_count();
        assert!(node.validate_error_count().is_ok());
    }

    #[test]
    fn test_error_rate_disabled() {
        let policy = ClientPolicy::builder().max_error_rate(0).build().unwrap();
        let node = crate::cluster::testing::test_node_with_policy("A", policy);
        for _ in 0..100 {
            node.increment_error_count();
        }
        assert_eq!(node.error_count(), 0);
        assert!(node.error_count_within_limit());
    }

    #[tokio::test]
    async fn test_empty_pool_spawns_connect_then_serves() {
        let node = mock_node("A", MockInfo::default()).await;
        let err = node.get_connection(0, None, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::PoolEmpty(_)));

        let conn = node.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        assert!(node.connection_count() >= 1);
        node.put_connection(conn);
        assert!(node.idle_connections() >= 1);
        assert!(node.get_connection(0, None, Duration::ZERO).is_ok());
    }

    #[tokio::test]
    async fn test_pool_cap_reports_exhausted() {
        let policy = ClientPolicy::builder()
            .connection_queue_size(1)
            .build()
            .unwrap();
        let node = crate::cluster::testing::mock_node_with_policy("A", MockInfo::default(), policy).await;
        let conn = node.wait_for_connection(Duration::from_secs(2)).await.unwrap();
        let err = node.get_connection(0, None, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        node.close_connection(conn);
        assert_eq!(node.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_warm_up_respects_queue_size() {
        let policy = ClientPolicy::builder()
            .connection_queue_size(3)
            .build()
            .unwrap();
        let node = crate::cluster::testing::mock_node_with_policy("A", MockInfo::default(), policy).await;
        assert_eq!(node.warm_up(10).await.unwrap(), 3);
        assert_eq!(node.connection_count(), 3);
        assert_eq!(node.warm_up(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_detects_generation_changes() {
        let node = mock_node("A", MockInfo::default()).await;
        let peers = Peers::new();
        node.refresh(&peers).await.unwrap();
        assert!(peers.gen_changed());
        assert!(node.partition_changed());
        assert_eq!(node.failures(), 0);
        assert_eq!(node.reference_count(), 1);
        assert_eq!(peers.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_name_mismatch_deactivates() {
        let node = mock_node(
            "A",
            MockInfo {
                name: "B".into(),
                ..MockInfo::default()
            },
        )
        .await;
        let err = node.refresh(&Peers::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidNode(_)));
        assert!(!node.is_active());
        assert_eq!(node.failures(), 1);
        assert_eq!(node.partition_generation(), -1);
    }

    #[tokio::test]
    async fn test_refresh_partitions_and_peers() {
        let node = mock_node("A", MockInfo::default()).await;
        let peers = Peers::new();
        let map = Mutex::new(PartitionMap::new());
        assert_eq!(node.refresh_partitions(&peers, &map, true).await, Some(1));
        assert_eq!(node.partition_generation(), 0);
        map.lock().unwrap().validate().unwrap();

        node.refresh_peers(&peers).await;
        assert_eq!(node.peers_generation(), 1);
        assert_eq!(peers.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_partitions_failure_yields_nothing() {
        let node = mock_node(
            "A",
            MockInfo {
                replicas: "test:0,1,AAAA".into(),
                ..MockInfo::default()
            },
        )
        .await;
        let map = Mutex::new(PartitionMap::new());
        assert_eq!(node.refresh_partitions(&Peers::new(), &map, true).await, None);
        assert_eq!(node.partition_generation(), -1);
        assert_eq!(node.failures(), 1);
    }

    #[test]
    fn test_commit_and_defer_partition_generation() {
        let node = test_node("A");
        node.set_partition_generation(-2);
        node.defer_partition_generation();
        assert_eq!(node.partition_generation(), -1);
        assert!(node.is_active());

        node.commit_partition_generation(9);
        assert_eq!(node.partition_generation(), 9);
        assert!(node.partition_changed());
        node.defer_partition_generation();
        assert_eq!(node.partition_generation(), 9);
    }

    #[tokio::test]
    async fn test_expired_session_logs_in_once() {
        let server = InfoServer::start(MockInfo::named("A")).await;
        let policy = ClientPolicy::builder()
            .credentials("admin", "admin")
            .build()
            .unwrap();
        let node = node_at("A", server.addr, policy);
        *node.session.lock().await = Some(Session {
            token: b"stale".to_vec(),
            expiration: Some(Instant::now()),
        });

        assert_eq!(node.warm_up(4).await.unwrap(), 4);
        let info = server.info();
        assert_eq!(info.logins, 1);
        assert_eq!(info.authentications, 3);
        assert_eq!(node.session_token().await, Some(b"token-1".to_vec()));

        node.warm_up(1).await.unwrap();
        assert_eq!(server.info().logins, 1);
        assert_eq!(server.info().authentications, 4);
    }

    #[tokio::test]
    async fn test_migration_in_progress() {
        let node = mock_node(
            "A",
            MockInfo {
                statistics: "cluster_size=1;migrate_partitions_remaining=12".into(),
                ..MockInfo::default()
            },
        )
        .await;
        assert!(node.migration_in_progress().await.unwrap());

        let idle = mock_node("B", MockInfo::default()).await;
        assert!(!idle.migration_in_progress().await.unwrap());
    }

    #[tokio::test]
    async fn test_close_drains_pool() {
        let node = mock_node("A", MockInfo::default()).await;
        node.warm_up(2).await.unwrap();
        node.close().await;
        assert!(!node.is_active());
        assert_eq!(node.idle_connections(), 0);
        assert_eq!(node.connection_count(), 0);
        let err = node.get_connection(0, None, Duration::ZERO).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ServerNotAvailable);
    }
}
