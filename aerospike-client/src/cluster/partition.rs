//! Partition map: per-namespace replica tables and replica selection.
//!
//! Tend builds a new [`PartitionMap`] from `replicas` info replies and
//! publishes it as an immutable snapshot. Commands route through a
//! [`Partition`] handle that remembers how far it has walked the replica
//! rows, so retries land on a different node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use aerospike_core::protocol::PARTITIONS;
use aerospike_core::{Error, Key, Result, ResultCode};

use super::node::Node;
use crate::policy::{ReadModeSC, Replica};

const BITMAP_SIZE: usize = PARTITIONS / 8;

/// Replica table of one namespace.
#[derive(Debug, Clone)]
pub struct Partitions {
    /// `replicas[row][partition]`; row 0 is the master.
    pub replicas: Vec<Vec<Option<Arc<Node>>>>,
    /// Highest regime seen per partition.
    pub regimes: Vec<u32>,
    /// Strong consistency namespace.
    pub sc_mode: bool,
}

impl Partitions {
    /// Creates an empty table with the given replication factor.
    pub fn new(replica_count: usize) -> Self {
        Self {
            replicas: vec![vec![None; PARTITIONS]; replica_count],
            regimes: vec![0; PARTITIONS],
            sc_mode: false,
        }
    }

    fn resize(&mut self, replica_count: usize) {
        self.replicas
            .resize_with(replica_count, || vec![None; PARTITIONS]);
    }

    /// Checks that every partition has a master.
    pub fn validate(&self, namespace: &str) -> Result<()> {
        let invalid = |what: String| {
            Error::client(
                ResultCode::InvalidClusterPartitionMap,
                format!("namespace {}: {}", namespace, what),
            )
        };

        if self.regimes.len() != PARTITIONS {
            return Err(invalid(format!("{} regimes", self.regimes.len())));
        }
        let master = self
            .replicas
            .first()
            .ok_or_else(|| invalid("no replica rows".to_string()))?;
        for (row, nodes) in self.replicas.iter().enumerate() {
            if nodes.len() != PARTITIONS {
                return Err(invalid(format!("replica row {} has {} entries", row, nodes.len())));
            }
        }
        if let Some(pid) = master.iter().position(Option::is_none) {
            return Err(invalid(format!("partition {} has no master", pid)));
        }
        Ok(())
    }
}

/// Namespace to replica table mapping.
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    namespaces: HashMap<String, Partitions>,
}

impl PartitionMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table of a namespace.
    pub fn get(&self, namespace: &str) -> Option<&Partitions> {
        self.namespaces.get(namespace)
    }

    /// Returns the known namespaces.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Returns true if no namespace is mapped.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Validates every namespace.
    pub fn validate(&self) -> Result<()> {
        for (namespace, partitions) in &self.namespaces {
            partitions.validate(namespace)?;
        }
        Ok(())
    }

    /// Puts back the `previous` table of every namespace that fails
    /// validation. Namespaces `previous` lacks are dropped instead.
    /// Returns the rejected namespaces with their validation errors.
    pub fn retain_valid(&mut self, previous: &PartitionMap) -> Vec<(String, Error)> {
        let mut rejected = Vec::new();
        self.namespaces
            .retain(|namespace, partitions| match partitions.validate(namespace) {
                Ok(()) => true,
                Err(e) => {
                    rejected.push((namespace.clone(), e));
                    false
                }
            });
        for (namespace, _) in &rejected {
            if let Some(old) = previous.namespaces.get(namespace) {
                self.namespaces.insert(namespace.clone(), old.clone());
            }
        }
        rejected
    }

    /// Applies a `replicas` reply reported by `node`.
    ///
    /// Format: `ns:regime,count,bitmap0,...,bitmapN;ns2:...` where each
    /// bitmap is base64 and bit `p` (most significant bit first) marks
    /// partition `p` as held by the node in that replica row. A partition
    /// is only claimed when the reported regime is not older than the one
    /// already recorded.
    pub fn apply_replicas(&mut self, node: &Arc<Node>, reply: &str) -> Result<()> {
        let parse_error =
            |what: &str| Error::Protocol(format!("invalid replicas reply: {}: {}", what, reply));

        for entry in reply.trim().split(';').filter(|e| !e.is_empty()) {
            let (namespace, rest) = entry
                .split_once(':')
                .ok_or_else(|| parse_error("missing namespace"))?;
            let mut parts = rest.split(',');
            let regime: u32 = parts
                .next()
                .and_then(|r| r.parse().ok())
                .ok_or_else(|| parse_error("bad regime"))?;
            let replica_count: usize = parts
                .next()
                .and_then(|r| r.parse().ok())
                .ok_or_else(|| parse_error("bad replica count"))?;
            let bitmaps: Vec<&str> = parts.collect();
            if bitmaps.len() != replica_count {
                return Err(parse_error("bitmap count does not match replica count"));
            }

            let partitions = self
                .namespaces
                .entry(namespace.to_string())
                .or_insert_with(|| Partitions::new(replica_count));
            if partitions.replicas.len() != replica_count {
                partitions.resize(replica_count);
            }
            if regime != 0 {
                partitions.sc_mode = true;
            }

            for (row, encoded) in bitmaps.into_iter().enumerate() {
                let bitmap = STANDARD
                    .decode(encoded)
                    .map_err(|e| parse_error(&format!("bad bitmap: {}", e)))?;
                if bitmap.len() < BITMAP_SIZE {
                    return Err(parse_error("short bitmap"));
                }

                for pid in 0..PARTITIONS {
                    if bitmap[pid >> 3] & (0x80 >> (pid & 7)) == 0 {
                        continue;
                    }
                    if regime < partitions.regimes[pid] {
                        continue;
                    }
                    partitions.regimes[pid] = regime;
                    let slot = &mut partitions.replicas[row][pid];
                    if !slot.as_ref().is_some_and(|n| Arc::ptr_eq(n, node)) {
                        *slot = Some(Arc::clone(node));
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns true if any replica slot points at `node`.
    pub fn contains_node(&self, node: &Arc<Node>) -> bool {
        self.namespaces.values().any(|p| {
            p.replicas
                .iter()
                .flatten()
                .flatten()
                .any(|n| Arc::ptr_eq(n, node))
        })
    }

    /// Clears every replica slot held by one of `nodes`.
    pub fn remove_nodes(&mut self, nodes: &[Arc<Node>]) {
        for partitions in self.namespaces.values_mut() {
            for slot in partitions.replicas.iter_mut().flatten() {
                if slot
                    .as_ref()
                    .is_some_and(|n| nodes.iter().any(|r| Arc::ptr_eq(n, r)))
                {
                    *slot = None;
                }
            }
        }
    }

    /// Groups the namespace's partitions by master node.
    pub fn partitions_by_master(&self, namespace: &str) -> Result<Vec<(Arc<Node>, Vec<u16>)>> {
        let partitions = self.get(namespace).ok_or_else(|| invalid_namespace(namespace))?;
        let mut grouped: Vec<(Arc<Node>, Vec<u16>)> = Vec::new();
        let master = partitions
            .replicas
            .first()
            .ok_or_else(|| invalid_partition_node(namespace, 0))?;
        for (pid, slot) in master.iter().enumerate() {
            let node = slot
                .as_ref()
                .filter(|n| n.is_active())
                .ok_or_else(|| invalid_partition_node(namespace, pid))?;
            match grouped.iter_mut().find(|(n, _)| Arc::ptr_eq(n, node)) {
                Some((_, pids)) => pids.push(pid as u16),
                None => grouped.push((Arc::clone(node), vec![pid as u16])),
            }
        }
        Ok(grouped)
    }
}

fn invalid_namespace(namespace: &str) -> Error {
    Error::client(
        ResultCode::InvalidNamespace,
        format!("namespace `{}` is not in the partition map", namespace),
    )
}

fn invalid_partition_node(namespace: &str, pid: usize) -> Error {
    Error::InvalidNode(format!(
        "no active node for partition {} of namespace {}",
        pid, namespace
    ))
}

/// Routing context supplied by the cluster.
#[derive(Debug)]
pub struct Router<'a> {
    /// Current partition map snapshot.
    pub map: &'a PartitionMap,
    /// Local rack when rack aware.
    pub rack_id: Option<i32>,
    /// Shared round-robin counter for master/prole reads.
    pub replica_index: &'a AtomicUsize,
}

/// Routing state of one command.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Namespace of the key.
    pub namespace: String,
    /// Partition id in `0..4096`.
    pub partition_id: usize,
    replica: Replica,
    sequence: usize,
    linearize: bool,
}

impl Partition {
    /// Routing for a read.
    pub fn for_read(key: &Key, replica: Replica, read_mode_sc: ReadModeSC) -> Self {
        Self {
            namespace: key.namespace().to_string(),
            partition_id: key.partition_id(),
            replica,
            sequence: 0,
            linearize: read_mode_sc == ReadModeSC::Linearize,
        }
    }

    /// Routing for a write: master first, walking replicas on retry.
    pub fn for_write(key: &Key) -> Self {
        Self {
            namespace: key.namespace().to_string(),
            partition_id: key.partition_id(),
            replica: Replica::Sequence,
            sequence: 0,
            linearize: false,
        }
    }

    /// Routing for a specific partition of a scan.
    pub fn for_partition(namespace: &str, partition_id: usize) -> Self {
        Self {
            namespace: namespace.to_string(),
            partition_id,
            replica: Replica::Sequence,
            sequence: 0,
            linearize: false,
        }
    }

    /// Advances the replica walk before a retry.
    ///
    /// A client timeout keeps the same replica unless reads are
    /// linearized, since the node may still be healthy.
    pub fn prepare_retry(&mut self, is_client_timeout: bool) {
        if !is_client_timeout || self.linearize {
            self.sequence = self.sequence.wrapping_add(1);
        }
    }

    /// Selects the node for the next attempt.
    pub fn node(&mut self, router: &Router<'_>) -> Result<Arc<Node>> {
        let partitions = router
            .map
            .get(&self.namespace)
            .ok_or_else(|| invalid_namespace(&self.namespace))?;
        let pid = self.partition_id;
        let rows = &partitions.replicas;
        let active = |row: usize| {
            rows[row][pid]
                .as_ref()
                .filter(|n| n.is_active())
                .cloned()
        };

        let chosen = match self.replica {
            Replica::Master => active(0),
            Replica::MasterProles => (0..rows.len()).find_map(|_| {
                let row = router.replica_index.fetch_add(1, Ordering::Relaxed) % rows.len();
                active(row)
            }),
            Replica::Sequence => self.sequence_node(rows.len(), &active),
            Replica::PreferRack => match router.rack_id {
                Some(rack) => self.rack_node(rows.len(), rack, &active),
                None => self.sequence_node(rows.len(), &active),
            },
        };

        chosen
            .or_else(|| (0..rows.len()).find_map(&active))
            .ok_or_else(|| invalid_partition_node(&self.namespace, pid))
    }

    fn sequence_node(
        &mut self,
        rows: usize,
        active: &impl Fn(usize) -> Option<Arc<Node>>,
    ) -> Option<Arc<Node>> {
        for _ in 0..rows {
            if let Some(node) = active(self.sequence % rows) {
                return Some(node);
            }
            self.sequence = self.sequence.wrapping_add(1);
        }
        None
    }

    fn rack_node(
        &mut self,
        rows: usize,
        rack: i32,
        active: &impl Fn(usize) -> Option<Arc<Node>>,
    ) -> Option<Arc<Node>> {
        let mut fallback = None;
        let mut seq = self.sequence;
        for _ in 0..rows {
            if let Some(node) = active(seq % rows) {
                if node.has_rack(&self.namespace, rack) {
                    self.sequence = seq;
                    return Some(node);
                }
                fallback.get_or_insert(node);
            }
            seq = seq.wrapping_add(1);
        }
        fallback
    }
}
