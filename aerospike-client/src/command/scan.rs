//! Partition scans with per-partition resume.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::stream::{self, StreamExt};
use tracing::instrument;

use aerospike_core::protocol::{FieldType, DIGEST_SIZE, INFO1_NOBINDATA, INFO1_READ, PARTITIONS};
use aerospike_core::{Error, Key, Record, Result, ResultCode};

use super::buffer::{parse_bins, parse_fields, parse_header, skip_bins, Estimate, RequestWriter};
use super::command::{execute, read_body, Command};
use super::recordset::{RecordSender, Recordset};
use super::Bins;
use crate::cluster::{Cluster, Node, Partition};
use crate::connection::Connection;
use crate::policy::{BasePolicy, ScanPolicy};

/// Progress of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    /// Partition id.
    pub id: u16,
    /// Digest of the last record received, to resume after.
    pub digest: Option<[u8; DIGEST_SIZE]>,
    done: bool,
    retry: bool,
}

impl PartitionStatus {
    fn new(id: u16) -> Self {
        Self {
            id,
            digest: None,
            done: false,
            retry: false,
        }
    }
}

/// Partitions assigned to one node for one scan round.
#[derive(Debug, Clone)]
pub struct NodePartitions {
    /// Node that masters the partitions.
    pub node: Arc<Node>,
    /// Partitions, sorted by id.
    pub partitions: Vec<PartitionStatus>,
    /// Records this node may return; zero is unbounded.
    pub record_max: u64,
    /// Records received so far.
    pub record_count: u64,
}

impl NodePartitions {
    fn find(&mut self, id: u16) -> Option<&mut PartitionStatus> {
        self.partitions
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(move |i| &mut self.partitions[i])
    }

    fn partition_done(&mut self, id: u16, ok: bool) {
        if let Some(part) = self.find(id) {
            if ok {
                part.done = true;
            } else {
                part.retry = true;
            }
        }
    }

    fn record_received(&mut self, key: &Key) {
        self.record_count += 1;
        let id = key.partition_id() as u16;
        let digest = *key.digest();
        if let Some(part) = self.find(id) {
            part.digest = Some(digest);
        }
    }
}

/// Tracks which partitions of a scan are finished across retry rounds.
#[derive(Debug)]
pub struct PartitionTracker {
    namespace: String,
    partitions: Vec<PartitionStatus>,
    max_records: u64,
    record_count: u64,
    iteration: u32,
}

impl PartitionTracker {
    /// Tracks every partition of `namespace`.
    pub fn all(namespace: &str, max_records: u64) -> Self {
        Self::for_ids(namespace, 0..PARTITIONS as u16, max_records)
    }

    /// Tracks the given partitions of `namespace`.
    pub fn for_ids(namespace: &str, ids: impl IntoIterator<Item = u16>, max_records: u64) -> Self {
        let mut partitions: Vec<PartitionStatus> = ids.into_iter().map(PartitionStatus::new).collect();
        partitions.sort_by_key(|p| p.id);
        partitions.dedup_by_key(|p| p.id);
        Self {
            namespace: namespace.to_string(),
            partitions,
            max_records,
            record_count: 0,
            iteration: 0,
        }
    }

    /// Namespace being scanned.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Records received across every round.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Partitions not yet finished.
    pub fn pending(&self) -> usize {
        self.partitions.iter().filter(|p| !p.done).count()
    }

    /// True when every partition is done or the record limit is reached.
    pub fn is_complete(&self) -> bool {
        (self.max_records > 0 && self.record_count >= self.max_records) || self.pending() == 0
    }

    /// Groups unfinished partitions by their current master.
    ///
    /// Partitions without an active master are left for the next round.
    pub fn assign(&self, cluster: &Cluster) -> Vec<NodePartitions> {
        let mut groups: Vec<NodePartitions> = Vec::new();
        for part in self.partitions.iter().filter(|p| !p.done) {
            let mut route = Partition::for_partition(&self.namespace, part.id as usize);
            let node = match cluster.node_for(&mut route) {
                Ok(node) => node,
                Err(e) => {
                    tracing::debug!(partition = part.id, error = %e, "partition has no node");
                    continue;
                }
            };
            let mut status = part.clone();
            status.retry = false;
            match groups.iter_mut().find(|g| Arc::ptr_eq(&g.node, &node)) {
                Some(group) => group.partitions.push(status),
                None => groups.push(NodePartitions {
                    node,
                    partitions: vec![status],
                    record_max: 0,
                    record_count: 0,
                }),
            }
        }

        if self.max_records > 0 && !groups.is_empty() {
            let remaining = self.max_records.saturating_sub(self.record_count);
            let per_node = remaining.div_ceil(groups.len() as u64).max(1);
            for group in &mut groups {
                group.record_max = per_node;
            }
        }
        groups
    }

    /// Folds a node's round back in.
    ///
    /// After a clean finish, partitions the node did not flag for retry are
    /// done, unless the node stopped at its record limit, in which case only
    /// partitions it marked done count. After a failure every partition is
    /// retried from its last digest.
    pub fn complete(&mut self, round: NodePartitions, succeeded: bool) {
        self.record_count += round.record_count;
        let capped = round.record_max > 0 && round.record_count >= round.record_max;
        for status in round.partitions {
            let Ok(i) = self.partitions.binary_search_by_key(&status.id, |p| p.id) else {
                continue;
            };
            let part = &mut self.partitions[i];
            part.digest = status.digest;
            part.done = status.done || (succeeded && !capped && !status.retry);
        }
    }

    /// Starts another round; fails once `max_retries` rounds were used.
    fn next_round(&mut self, max_retries: u32) -> Result<()> {
        self.iteration += 1;
        if self.iteration > max_retries {
            return Err(Error::client(
                ResultCode::PartitionUnavailable,
                format!(
                    "{} partitions of namespace {} unavailable after {} rounds",
                    self.pending(),
                    self.namespace,
                    self.iteration
                ),
            ));
        }
        Ok(())
    }
}

/// Scans a node's share of partitions.
#[derive(Debug)]
pub struct ScanCommand<'a> {
    policy: &'a ScanPolicy,
    namespace: &'a str,
    set_name: &'a str,
    bins: &'a Bins,
    task_id: u64,
    round: NodePartitions,
    sender: &'a RecordSender,
}

impl<'a> ScanCommand<'a> {
    pub(crate) fn new(
        policy: &'a ScanPolicy,
        namespace: &'a str,
        set_name: &'a str,
        bins: &'a Bins,
        task_id: u64,
        round: NodePartitions,
        sender: &'a RecordSender,
    ) -> Self {
        Self {
            policy,
            namespace,
            set_name,
            bins,
            task_id,
            round,
            sender,
        }
    }

    /// Partition progress after the command ran.
    pub fn into_round(self) -> NodePartitions {
        self.round
    }
}

#[async_trait]
impl Command for ScanCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let (resumed, fresh): (Vec<&PartitionStatus>, Vec<&PartitionStatus>) =
            self.round.partitions.iter().partition(|p| p.digest.is_some());
        let bin_names: &[String] = if self.policy.include_bin_data {
            self.bins.names()
        } else {
            &[]
        };

        let mut estimate = Estimate::new();
        if !self.namespace.is_empty() {
            estimate.field(self.namespace.len());
        }
        if !self.set_name.is_empty() {
            estimate.field(self.set_name.len());
        }
        let filter_exp = estimate.filter(&self.policy.base)?;
        if !fresh.is_empty() {
            estimate.field(fresh.len() * 2);
        }
        if !resumed.is_empty() {
            estimate.field(resumed.len() * DIGEST_SIZE);
        }
        if self.round.record_max > 0 {
            estimate.field(8);
        }
        if self.policy.records_per_second > 0 {
            estimate.field(4);
        }
        estimate.field(4);
        estimate.field(8);
        for name in bin_names {
            estimate.bin_name(name)?;
        }

        let mut read_attr = INFO1_READ;
        if !self.policy.include_bin_data || matches!(self.bins, Bins::None) {
            read_attr |= INFO1_NOBINDATA;
        }

        let mut writer = RequestWriter::begin(buf, &estimate);
        writer.header(
            &self.policy.base,
            read_attr,
            0,
            estimate.fields,
            bin_names.len() as u16,
        );
        if !self.namespace.is_empty() {
            writer.field_str(self.namespace, FieldType::Namespace);
        }
        if !self.set_name.is_empty() {
            writer.field_str(self.set_name, FieldType::Table);
        }
        writer.filter(filter_exp.as_ref());
        if !fresh.is_empty() {
            writer.field_header(fresh.len() * 2, FieldType::PidArray);
            for part in &fresh {
                writer.buf().put_u16_le(part.id);
            }
        }
        if !resumed.is_empty() {
            writer.field_header(resumed.len() * DIGEST_SIZE, FieldType::DigestArray);
            for digest in resumed.iter().filter_map(|p| p.digest.as_ref()) {
                writer.buf().put_slice(digest);
            }
        }
        if self.round.record_max > 0 {
            writer.field_u64(self.round.record_max, FieldType::ScanMaxRecords);
        }
        if self.policy.records_per_second > 0 {
            writer.field_u32(self.policy.records_per_second, FieldType::RecordsPerSecond);
        }
        let socket_timeout = self.policy.base.effective_socket_timeout().as_millis();
        writer.field_u32(socket_timeout.min(u32::MAX as u128) as u32, FieldType::ScanTimeout);
        writer.field_u64(self.task_id, FieldType::TranId);
        for name in bin_names {
            writer.read_bin(name);
        }
        writer.finish();
        Ok(())
    }

    fn get_node(&mut self, _cluster: &Cluster) -> Result<Arc<Node>> {
        Ok(Arc::clone(&self.round.node))
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        let header_only = !self.policy.include_bin_data || matches!(self.bins, Bins::None);
        loop {
            let mut body = read_body(conn).await?;
            while body.has_remaining() {
                let header = parse_header(&mut body)?;
                let code = header.result();

                if header.is_partition_done() {
                    parse_fields(&mut body, header.field_count)?;
                    skip_bins(&mut body, header.op_count)?;
                    self.round
                        .partition_done(header.generation as u16, code == ResultCode::Ok);
                    continue;
                }
                if header.is_last() {
                    return match code {
                        ResultCode::Ok | ResultCode::KeyNotFoundError => Ok(()),
                        code => Err(Error::server(code, format!("scan {}", self.namespace))),
                    };
                }
                match code {
                    ResultCode::Ok => {}
                    ResultCode::KeyNotFoundError | ResultCode::FilteredOut => {
                        parse_fields(&mut body, header.field_count)?;
                        skip_bins(&mut body, header.op_count)?;
                        continue;
                    }
                    code => return Err(Error::server(code, format!("scan {}", self.namespace))),
                }

                let mut fields = parse_fields(&mut body, header.field_count)?;
                if fields.namespace.is_none() {
                    fields.namespace = Some(self.namespace.to_string());
                }
                let key = fields.into_key()?;
                let bins = if header_only {
                    skip_bins(&mut body, header.op_count)?;
                    Default::default()
                } else {
                    parse_bins(&mut body, header.op_count)?
                };

                if self.sender.is_cancelled() {
                    return Err(self.sender.terminated_error());
                }
                self.round.record_received(&key);
                let record = Record::new(Some(key), bins, header.generation, header.expiration);
                self.sender.send(record).await?;
            }
        }
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

/// Errors after which a partition round is worth repeating.
fn retryable(error: &Error) -> bool {
    error.is_network_error()
        || matches!(error, Error::PoolEmpty(_) | Error::PoolExhausted(_))
        || error.matches(ResultCode::ServerNotAvailable)
        || error.matches(ResultCode::PartitionUnavailable)
        || error.matches(ResultCode::MaxErrorRate)
}

/// Scans the tracker's partitions until all are done, retrying unfinished
/// partitions on their current masters.
#[allow(clippy::too_many_arguments)]
#[instrument(name = "command.scan", skip_all, fields(namespace = %tracker.namespace(), task_id = task_id))]
pub(crate) async fn scan_partitions(
    cluster: &Cluster,
    policy: &ScanPolicy,
    set_name: &str,
    bins: &Bins,
    tracker: &mut PartitionTracker,
    task_id: u64,
    sender: &RecordSender,
) -> Result<()> {
    let namespace = tracker.namespace().to_string();
    let expected = if policy.fail_on_cluster_change || cluster.is_strong_consistency(&namespace) {
        Some(cluster.cluster_stable_key(&namespace).await?)
    } else {
        None
    };
    loop {
        let rounds = tracker.assign(cluster);
        let parallel = match policy.max_concurrent_nodes {
            0 => rounds.len().max(1),
            n => n,
        };
        tracing::debug!(nodes = rounds.len(), pending = tracker.pending(), "scan round");

        let ns = namespace.as_str();
        let results: Vec<(NodePartitions, Result<()>)> = stream::iter(rounds)
            .map(|round| async move {
                let mut command = ScanCommand::new(policy, ns, set_name, bins, task_id, round, sender);
                let result = execute(cluster, &mut command).await;
                (command.into_round(), result)
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        for (round, result) in results {
            match result {
                Ok(()) => tracker.complete(round, true),
                Err(_) if sender.is_cancelled() => return Err(sender.terminated_error()),
                Err(e) if retryable(&e) => {
                    tracing::debug!(node = %round.node, error = %e, "scan round failed, partitions will resume");
                    tracker.complete(round, false);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(expected) = &expected {
            cluster.verify_cluster_key(&namespace, expected).await?;
        }
        if tracker.is_complete() {
            return Ok(());
        }
        if sender.is_cancelled() {
            return Err(sender.terminated_error());
        }
        tracker.next_round(policy.base.max_retries)?;
        if !policy.base.sleep_between_retries.is_zero() {
            tokio::time::sleep(policy.base.sleep_between_retries).await;
        }
    }
}

/// Starts a scan of every partition of `namespace` in a background task.
pub fn scan_all(
    cluster: Arc<Cluster>,
    policy: ScanPolicy,
    namespace: &str,
    set_name: &str,
    bins: Bins,
) -> Recordset {
    let task_id = rand::random::<u64>();
    let (recordset, sender) =
        Recordset::channel(policy.record_queue_size, task_id, ResultCode::ScanTerminated);
    let mut tracker = PartitionTracker::all(namespace, policy.max_records);
    let set_name = set_name.to_string();

    tokio::spawn(async move {
        let result =
            scan_partitions(&cluster, &policy, &set_name, &bins, &mut tracker, task_id, &sender).await;
        match result {
            Ok(()) => tracing::debug!(task_id, records = tracker.record_count(), "scan finished"),
            Err(e) => sender.fail(e).await,
        }
    });
    recordset
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerospike_core::protocol::MessageHeader;
    use crate::cluster::testing;

    fn round(node: Arc<Node>, ids: &[u16]) -> NodePartitions {
        NodePartitions {
            node,
            partitions: ids.iter().copied().map(PartitionStatus::new).collect(),
            record_max: 0,
            record_count: 0,
        }
    }

    #[test]
    fn test_tracker_completes_after_clean_round() {
        let node = testing::test_node("A");
        let mut tracker = PartitionTracker::for_ids("test", [3, 1, 2, 1], 0);
        assert_eq!(tracker.pending(), 3);

        let mut r = round(node, &[1, 2, 3]);
        r.partition_done(2, false);
        tracker.complete(r, true);
        assert_eq!(tracker.pending(), 1);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn test_failed_round_keeps_resume_digest() {
        let node = testing::test_node("A");
        let key = Key::new("test", "", 7).unwrap();
        let pid = key.partition_id() as u16;
        let mut tracker = PartitionTracker::for_ids("test", [pid], 0);

        let mut r = round(node, &[pid]);
        r.record_received(&key);
        tracker.complete(r, false);
        assert_eq!(tracker.pending(), 1);
        assert_eq!(tracker.record_count(), 1);
        assert_eq!(tracker.partitions[0].digest, Some(*key.digest()));
    }

    #[test]
    fn test_max_records_completes() {
        let node = testing::test_node("A");
        let mut tracker = PartitionTracker::for_ids("test", [1, 2], 1);
        let mut r = round(node, &[1, 2]);
        r.record_max = 1;
        r.record_count = 1;
        tracker.complete(r, true);
        assert!(tracker.is_complete());
        assert_eq!(tracker.pending(), 2);
    }

    #[test]
    fn test_retry_rounds_are_bounded() {
        let mut tracker = PartitionTracker::for_ids("test", [1], 0);
        assert!(tracker.next_round(1).is_ok());
        let err = tracker.next_round(1).unwrap_err();
        assert!(err.matches(ResultCode::PartitionUnavailable));
    }

    #[test]
    fn test_scan_request_fields() {
        let node = testing::test_node("A");
        let key = Key::new("test", "", 7).unwrap();
        let mut r = round(node, &[1, 2]);
        r.partitions.push(PartitionStatus {
            id: 9,
            digest: Some(*key.digest()),
            done: false,
            retry: false,
        });
        r.record_max = 10;

        let policy = ScanPolicy::default();
        let bins = Bins::from(["a"]);
        let (_rs, sender) = Recordset::channel(1, 5, ResultCode::ScanTerminated);
        let mut command = ScanCommand::new(&policy, "test", "s", &bins, 5, r, &sender);
        let mut buf = BytesMut::new();
        command.write_buffer(&mut buf).unwrap();

        let header = MessageHeader::read_from(&mut &buf[8..]).unwrap();
        // namespace, set, pids, digests, max records, timeout, task id
        assert_eq!(header.field_count, 7);
        assert_eq!(header.op_count, 1);
        assert_eq!(header.info1, INFO1_READ);

        let mut body = &buf[30..];
        body.advance(5 + 4);
        body.advance(5 + 1);
        assert_eq!(body.get_u32(), 5);
        assert_eq!(body.get_u8(), FieldType::PidArray as u8);
        assert_eq!(body.get_u16_le(), 1);
        assert_eq!(body.get_u16_le(), 2);
        assert_eq!(body.get_u32() as usize, DIGEST_SIZE + 1);
        assert_eq!(body.get_u8(), FieldType::DigestArray as u8);
    }
}
