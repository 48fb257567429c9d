//! Cluster membership, the tend loop and partition map publication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::instrument;

use aerospike_core::{Error, Result, ResultCode};

use super::context::ClusterContext;
use super::host::Host;
use super::node::Node;
use super::node_validator::NodeValidator;
use super::partition::{Partition, PartitionMap, Router};
use super::peers::Peers;
use crate::command::{self, Command};
use crate::config::ClientPolicy;
use crate::security::Credentials;

/// Consecutive failures after which a node is dropped when no node answers.
const MAX_SILENT_FAILURES: u32 = 5;

/// Pause between polls in [`Cluster::wait_until_migration_is_finished`].
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The client's view of a cluster.
///
/// Built by [`Cluster::new`], which seeds and tends until the node list is
/// stable, then tends in the background every `tend_interval`.
#[derive(Debug)]
pub struct Cluster {
    context: Arc<ClusterContext>,
    seeds: RwLock<Vec<Host>>,
    nodes: RwLock<Arc<Vec<Arc<Node>>>>,
    aliases: RwLock<HashMap<Host, Arc<Node>>>,
    partition_map: RwLock<Arc<PartitionMap>>,
    node_index: AtomicUsize,
    replica_index: AtomicUsize,
    tend_count: AtomicU64,
    tend_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Cluster {
    /// Connects to the seeds and starts the tend loop.
    ///
    /// # Errors
    ///
    /// Fails when no seed is given, when credentials or TLS settings are
    /// invalid, and, if `fail_if_not_connected` is set, when no node could
    /// be reached before `timeout`.
    pub async fn new(policy: ClientPolicy, seeds: Vec<Host>) -> Result<Arc<Self>> {
        if seeds.is_empty() {
            return Err(Error::InvalidArgument("at least one seed host is required".into()));
        }
        let seeds = default_tls_names(&policy, seeds);
        let fail_if_not_connected = policy.fail_if_not_connected();
        let context = Arc::new(ClusterContext::new(policy)?);
        let (shutdown, _) = watch::channel(false);

        let cluster = Arc::new(Self {
            context,
            seeds: RwLock::new(seeds),
            nodes: RwLock::new(Arc::new(Vec::new())),
            aliases: RwLock::new(HashMap::new()),
            partition_map: RwLock::new(Arc::new(PartitionMap::new())),
            node_index: AtomicUsize::new(0),
            replica_index: AtomicUsize::new(0),
            tend_count: AtomicU64::new(0),
            tend_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown,
        });

        if let Err(e) = cluster.wait_till_stabilized().await {
            if fail_if_not_connected {
                cluster.close().await;
                return Err(e);
            }
            tracing::warn!(error = %e, "cluster did not stabilize");
        }

        if fail_if_not_connected && !cluster.is_connected() {
            cluster.close().await;
            return Err(Error::Connection(format!(
                "failed to connect to any seed: {}",
                cluster.seed_list()
            )));
        }

        cluster.spawn_tend_task();
        tracing::info!(nodes = cluster.nodes().len(), "connected to cluster");
        Ok(cluster)
    }

    /// Returns the shared cluster context.
    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    /// Returns the client policy.
    pub fn policy(&self) -> &ClientPolicy {
        self.context.policy()
    }

    fn seed_list(&self) -> String {
        self.seeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Tends until the node count stops changing.
    async fn wait_till_stabilized(&self) -> Result<()> {
        let timeout = self.policy().timeout();
        let stabilize = async {
            let mut count = None;
            loop {
                if let Err(e) = self.tend().await {
                    if matches!(e, Error::Authentication(_))
                        || e.matches(ResultCode::NotAuthenticated)
                        || e.matches(ResultCode::ClusterNameMismatch)
                    {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, "tend failed while connecting");
                }

                let nodes = self.nodes().len();
                if count == Some(nodes) {
                    return Ok(());
                }
                count = Some(nodes);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };

        tokio::time::timeout(timeout, stabilize)
            .await
            .map_err(|_| Error::Timeout(format!("connecting to the cluster timed out after {:?}", timeout)))?
    }

    fn spawn_tend_task(self: &Arc<Self>) {
        let cluster: Weak<Self> = Arc::downgrade(self);
        let tend_interval = self.policy().tend_interval();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(tend_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cluster) = cluster.upgrade() else {
                            break;
                        };
                        let started = Instant::now();
                        if let Err(e) = cluster.tend().await {
                            tracing::warn!(error = %e, "cluster tend failed");
                        }
                        let elapsed = started.elapsed();
                        if elapsed > tend_interval {
                            tracing::warn!(?elapsed, ?tend_interval, "tend took longer than the tend interval");
                        }
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            tracing::debug!("tend task shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Runs one tend pass.
    ///
    /// Refreshes every node, discovers peers, rebuilds the partition map
    /// when any node reports a new partition generation, and drops nodes
    /// that are gone.
    #[instrument(name = "cluster.tend", skip(self), fields(tend = self.tend_count.load(Ordering::Relaxed)))]
    pub async fn tend(&self) -> Result<()> {
        let _guard = self.tend_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.nodes().is_empty() {
            self.seed_nodes().await?;
        }

        let nodes = self.nodes();
        let count_before = nodes.len();
        let peers = Peers::new();
        for node in nodes.iter() {
            node.reset_tend_state();
        }

        join_all(nodes.iter().map(|node| {
            let peers = &peers;
            async move {
                if let Err(e) = node.refresh(peers).await {
                    tracing::debug!(node = %node, error = %e, "node refresh failed");
                }
            }
        }))
        .await;

        if peers.gen_changed() || peers.peer_count() != count_before {
            peers.reset_refresh_count();
            join_all(nodes.iter().map(|node| node.refresh_peers(&peers))).await;
        }

        self.discover_peers(&peers).await;
        let staged = peers.take_nodes();

        let changed: Vec<&Arc<Node>> = nodes.iter().filter(|n| n.partition_changed()).collect();
        let mut working = None;
        if !staged.is_empty() || !changed.is_empty() {
            let previous = self.partition_map();
            let map = Mutex::new((*previous).clone());
            let added = join_all(staged.iter().map(|n| n.refresh_partitions(&peers, &map, true))).await;
            let refreshed = join_all(changed.iter().map(|n| n.refresh_partitions(&peers, &map, false))).await;
            let mut map = map.into_inner().unwrap_or_else(PoisonError::into_inner);

            let rejected = map.retain_valid(&previous);
            for (namespace, e) in &rejected {
                tracing::warn!(namespace = %namespace, error = %e, "partition table is incomplete, keeping the previous one");
            }
            let generations = staged
                .iter()
                .zip(added)
                .chain(changed.iter().copied().zip(refreshed))
                .filter_map(|(node, generation)| Some((node, generation?)));
            for (node, generation) in generations {
                if rejected.is_empty() {
                    node.commit_partition_generation(generation);
                } else {
                    node.defer_partition_generation();
                }
            }
            working = Some(map);
        }

        if peers.gen_changed() {
            let remove = self.find_nodes_to_remove(&nodes, peers.refresh_count(), working.as_ref());
            if !remove.is_empty() {
                let map = working.get_or_insert_with(|| (*self.partition_map()).clone());
                map.remove_nodes(&remove);
                self.remove_nodes(&remove).await;
            }
        }

        if !staged.is_empty() {
            self.add_nodes(staged);
        }

        if let Some(map) = working {
            if let Err(e) = map.validate() {
                tracing::debug!(error = %e, "partition map has slots of removed nodes");
            }
            *self
                .partition_map
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        }

        let tend_count = self.tend_count.fetch_add(1, Ordering::AcqRel) + 1;
        let count_after = self.nodes().len();
        if count_after != count_before {
            tracing::info!(before = count_before, after = count_after, "cluster size changed");
        }

        let window = u64::from(self.policy().error_rate_window());
        if self.policy().max_error_rate() > 0 && window > 0 && tend_count % window == 0 {
            for node in self.nodes().iter() {
                node.reset_error_count();
            }
        }

        Ok(())
    }

    /// Validates the seeds and adds every distinct node found.
    async fn seed_nodes(&self) -> Result<()> {
        let seeds = self
            .seeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let validator = NodeValidator::new(&self.context);

        let results = join_all(seeds.iter().map(|seed| validator.validate_seed(seed))).await;

        let mut found: Vec<Arc<Node>> = Vec::new();
        let mut errors = Vec::new();
        for (seed, result) in seeds.iter().zip(results) {
            match result {
                Ok(mut info) => {
                    if found.iter().any(|n| n.name() == info.name) {
                        if let Some(conn) = info.conn.take() {
                            conn.close();
                        }
                        continue;
                    }
                    tracing::debug!(seed = %seed, node = %info.name, "seed validated");
                    found.push(Arc::new(Node::new(info, Arc::clone(&self.context))));
                }
                Err(e) => {
                    tracing::warn!(seed = %seed, error = %e, "seed failed validation");
                    errors.push((seed, e));
                }
            }
        }

        if found.is_empty() {
            if let Some(pos) = errors.iter().position(|(_, e)| {
                matches!(e, Error::Authentication(_)) || e.matches(ResultCode::ClusterNameMismatch)
            }) {
                return Err(errors.swap_remove(pos).1);
            }
            let detail = errors
                .iter()
                .map(|(seed, e)| format!("{}: {}", seed, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::InvalidNode(format!("failed to connect to hosts: {}", detail)));
        }

        self.add_nodes(found);
        Ok(())
    }

    /// Validates advertised peers that are not yet cluster members.
    async fn discover_peers(&self, peers: &Peers) {
        let validator = NodeValidator::new(&self.context);
        for peer in peers.peers() {
            if self.peer_exists(peers, &peer.node_name) {
                continue;
            }

            for host in &peer.hosts {
                match validator.validate_peer(host).await {
                    Ok(mut info) => {
                        if info.name != peer.node_name {
                            tracing::warn!(peer = %peer.node_name, actual = %info.name, host = %host, "peer node name differs from the node at its address");
                            if self.peer_exists(peers, &info.name) {
                                if let Some(conn) = info.conn.take() {
                                    conn.close();
                                }
                                break;
                            }
                        }
                        tracing::debug!(node = %info.name, host = %host, "discovered node");
                        peers.add_node(Arc::new(Node::new(info, Arc::clone(&self.context))));
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer.node_name, host = %host, error = %e, "peer host failed validation");
                        peers.fail(host.clone());
                    }
                }
            }
        }
    }

    fn peer_exists(&self, peers: &Peers, name: &str) -> bool {
        let node = self
            .nodes()
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .or_else(|| peers.node_by_name(name));
        match node {
            Some(node) => {
                node.add_reference();
                true
            }
            None => false,
        }
    }

    fn find_nodes_to_remove(
        &self,
        nodes: &[Arc<Node>],
        refresh_count: usize,
        working: Option<&PartitionMap>,
    ) -> Vec<Arc<Node>> {
        let snapshot = self.partition_map();
        let map = working.unwrap_or(&snapshot);

        nodes
            .iter()
            .filter(|node| {
                if !node.is_active() {
                    return true;
                }
                if refresh_count == 0 && node.failures() >= MAX_SILENT_FAILURES {
                    return true;
                }
                if nodes.len() > 1 && refresh_count >= 1 && node.reference_count() == 0 {
                    return node.failures() > 0 || !map.contains_node(node);
                }
                false
            })
            .cloned()
            .collect()
    }

    fn add_nodes(&self, added: Vec<Arc<Node>>) {
        {
            let mut aliases = self.aliases.write().unwrap_or_else(PoisonError::into_inner);
            for node in &added {
                for alias in node.aliases() {
                    aliases.insert(alias, Arc::clone(node));
                }
                tracing::info!(node = %node, "added node");
            }
        }

        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(nodes.len() + added.len());
        next.extend(nodes.iter().cloned());
        next.extend(added);
        *nodes = Arc::new(next);
    }

    async fn remove_nodes(&self, removed: &[Arc<Node>]) {
        {
            let mut aliases = self.aliases.write().unwrap_or_else(PoisonError::into_inner);
            aliases.retain(|_, node| !removed.iter().any(|r| Arc::ptr_eq(r, node)));

            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            let next: Vec<Arc<Node>> = nodes
                .iter()
                .filter(|n| !removed.iter().any(|r| Arc::ptr_eq(r, n)))
                .cloned()
                .collect();
            *nodes = Arc::new(next);
        }

        for node in removed {
            tracing::info!(node = %node, failures = node.failures(), "removed node");
            node.close().await;
        }
    }

    /// Snapshot of the current nodes.
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        Arc::clone(&self.nodes.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Names of the current nodes.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes().iter().map(|n| n.name().to_string()).collect()
    }

    /// Looks a node up by name.
    pub fn get_node_by_name(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes()
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| Error::InvalidNode(format!("node {} not found in cluster", name)))
    }

    /// Looks a node up by one of its addresses.
    pub fn get_node_by_host(&self, host: &Host) -> Option<Arc<Node>> {
        self.aliases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .cloned()
    }

    /// Returns an active node, rotating through the node list.
    pub fn get_random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes();
        for _ in 0..nodes.len() {
            let index = self.node_index.fetch_add(1, Ordering::Relaxed) % nodes.len();
            let node = &nodes[index];
            if node.is_active() {
                return Ok(Arc::clone(node));
            }
        }
        Err(Error::client(ResultCode::InvalidNodeError, "cluster is empty"))
    }

    /// Returns the current partition map snapshot.
    pub fn partition_map(&self) -> Arc<PartitionMap> {
        Arc::clone(&self.partition_map.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Picks the node serving `partition` under its replica policy.
    pub fn node_for(&self, partition: &mut Partition) -> Result<Arc<Node>> {
        let map = self.partition_map();
        let policy = self.policy();
        partition.node(&Router {
            map: &map,
            rack_id: policy.rack_aware().then(|| policy.rack_id()),
            replica_index: &self.replica_index,
        })
    }

    /// True while the client has at least one active node.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.nodes().iter().any(|n| n.is_active())
    }

    /// True when connected and every partition has a master.
    pub fn healthy(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::client(ResultCode::InvalidNodeError, "cluster is empty"));
        }
        self.partition_map().validate()
    }

    /// Number of completed tend passes.
    pub fn tend_count(&self) -> u64 {
        self.tend_count.load(Ordering::Acquire)
    }

    /// Adds seeds used when every node is lost.
    pub fn add_seeds(&self, hosts: impl IntoIterator<Item = Host>) {
        let hosts = default_tls_names(self.policy(), hosts.into_iter().collect());
        let mut seeds = self.seeds.write().unwrap_or_else(PoisonError::into_inner);
        for host in hosts {
            if !seeds.contains(&host) {
                seeds.push(host);
            }
        }
    }

    /// Current seed hosts.
    pub fn seeds(&self) -> Vec<Host> {
        self.seeds.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sends info commands to any active node.
    pub async fn request_info<S: AsRef<str>>(&self, commands: &[S]) -> Result<HashMap<String, String>> {
        self.get_random_node()?.request_info(commands).await
    }

    /// Runs `command` through the retry loop against this cluster.
    pub async fn execute<C: Command + ?Sized>(&self, command: &mut C) -> Result<()> {
        command::execute(self, command).await
    }

    /// Returns the cluster key once every active node agrees on it for
    /// `namespace`.
    ///
    /// # Errors
    ///
    /// `QueryAborted` when nodes report different keys, which means the
    /// cluster is changing.
    pub async fn cluster_stable_key(&self, namespace: &str) -> Result<String> {
        let nodes = self.nodes();
        let active: Vec<&Arc<Node>> = nodes.iter().filter(|n| n.is_active()).collect();
        if active.is_empty() {
            return Err(Error::client(ResultCode::InvalidNodeError, "cluster is empty"));
        }
        let keys = join_all(active.iter().map(|n| n.cluster_stable_key(namespace))).await;
        let mut stable: Option<String> = None;
        for (node, key) in active.iter().zip(keys) {
            let key = key?;
            match &stable {
                None => stable = Some(key),
                Some(expected) if *expected != key => {
                    return Err(Error::client(
                        ResultCode::QueryAborted,
                        format!(
                            "cluster is not stable: node {} reports key {}, expected {}",
                            node.name(),
                            key,
                            expected
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
        stable.ok_or_else(|| Error::client(ResultCode::InvalidNodeError, "cluster is empty"))
    }

    /// Fails with `QueryAborted` when the cluster key of `namespace` is no
    /// longer `expected`.
    pub async fn verify_cluster_key(&self, namespace: &str, expected: &str) -> Result<()> {
        let key = self.cluster_stable_key(namespace).await?;
        if key != expected {
            return Err(Error::client(
                ResultCode::QueryAborted,
                format!("cluster key changed from {} to {}", expected, key),
            ));
        }
        Ok(())
    }

    /// True when `namespace` runs in strong consistency mode.
    pub fn is_strong_consistency(&self, namespace: &str) -> bool {
        self.partition_map()
            .get(namespace)
            .is_some_and(|p| p.sc_mode)
    }

    /// Opens connections on every node. Zero fills each node's queue.
    pub async fn warm_up(&self, count: usize) -> Result<usize> {
        let nodes = self.nodes();
        let results = join_all(nodes.iter().map(|n| n.warm_up(count))).await;
        let mut total = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(opened) => total += opened,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if total == 0 => Err(e),
            _ => Ok(total),
        }
    }

    /// Returns true when any active node is migrating partitions.
    pub async fn migration_in_progress(&self, timeout: Duration) -> Result<bool> {
        let nodes = self.nodes();
        let check = async {
            let results = join_all(
                nodes
                    .iter()
                    .filter(|n| n.is_active())
                    .map(|n| n.migration_in_progress()),
            )
            .await;
            for result in results {
                if result? {
                    return Ok(true);
                }
            }
            Ok(false)
        };
        tokio::time::timeout(timeout, check)
            .await
            .map_err(|_| Error::Timeout(format!("migration check timed out after {:?}", timeout)))?
    }

    /// Polls until no node is migrating or `timeout` passes.
    pub async fn wait_until_migration_is_finished(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "migrations did not finish within {:?}",
                    timeout
                )));
            }
            if !self.migration_in_progress(remaining).await? {
                return Ok(());
            }
            tokio::time::sleep(MIGRATION_POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// Uses a new password for later logins when `user` is the client's user.
    pub fn change_password(&self, user: &str, password: &str) -> Result<()> {
        match self.context.credentials() {
            Some(current) if current.user() == user => {
                let credentials = Credentials::new(user, password, self.policy().auth_mode())?;
                self.context.set_credentials(credentials);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// True once [`Cluster::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops tending and closes every node.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        let _guard = self.tend_lock.lock().await;

        let nodes = std::mem::take(&mut *self.nodes.write().unwrap_or_else(PoisonError::into_inner));
        self.aliases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self
            .partition_map
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(PartitionMap::new());

        join_all(nodes.iter().map(|n| n.close())).await;
        tracing::info!(nodes = nodes.len(), "cluster closed");
    }
}

/// Fills in TLS names for seeds when TLS is on.
fn default_tls_names(policy: &ClientPolicy, seeds: Vec<Host>) -> Vec<Host> {
    if !policy.tls().enabled() {
        return seeds;
    }
    seeds
        .into_iter()
        .map(|mut host| {
            if host.tls_name.is_none() {
                let name = policy
                    .tls()
                    .tls_name()
                    .or(policy.cluster_name())
                    .unwrap_or(&host.name)
                    .to_string();
                host.tls_name = Some(name);
            }
            host
        })
        .collect()
}
