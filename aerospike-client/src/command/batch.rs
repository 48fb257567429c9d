//! Batch reads: keys grouped by master node, one request per node.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::instrument;

use aerospike_core::protocol::{
    FieldType, MessageHeader, DIGEST_SIZE, FIELD_HEADER_SIZE, INFO1_BATCH, INFO1_GET_ALL,
    INFO1_NOBINDATA, INFO1_READ,
};
use aerospike_core::{Error, Key, Record, Result, ResultCode};

use super::buffer::{parse_bins, parse_fields, parse_header, skip_bins, Estimate, RequestWriter};
use super::command::{execute, read_body, Command};
use super::Bins;
use crate::cluster::{Cluster, Node, Partition};
use crate::connection::Connection;
use crate::policy::{BasePolicy, BatchPolicy};

/// Keys of one batch that share a master node, as offsets into the
/// caller's key slice.
#[derive(Debug, Clone)]
pub struct BatchNode {
    /// Node serving the keys.
    pub node: Arc<Node>,
    /// Offsets of the keys in the original request.
    pub offsets: Vec<usize>,
}

impl BatchNode {
    /// Groups `keys` by the node their partition routes to.
    pub fn group(cluster: &Cluster, policy: &BasePolicy, keys: &[Key]) -> Result<Vec<BatchNode>> {
        let mut groups: Vec<BatchNode> = Vec::new();
        for (offset, key) in keys.iter().enumerate() {
            let mut partition = Partition::for_read(key, policy.replica, policy.read_mode_sc);
            let node = cluster.node_for(&mut partition)?;
            match groups.iter_mut().find(|g| Arc::ptr_eq(&g.node, &node)) {
                Some(group) => group.offsets.push(offset),
                None => groups.push(BatchNode {
                    node,
                    offsets: vec![offset],
                }),
            }
        }
        Ok(groups)
    }
}

fn same_entry(prev: &Key, key: &Key, send_set_name: bool) -> bool {
    prev.namespace() == key.namespace() && (!send_set_name || prev.set_name() == key.set_name())
}

/// Encodes a batch index request for the keys at `offsets`.
///
/// Consecutive keys with the same namespace (and set, when sent) are
/// flagged as repeats and carry only their digest.
fn write_batch(
    buf: &mut BytesMut,
    policy: &BatchPolicy,
    keys: &[Key],
    offsets: &[usize],
    read_attr: u8,
    bin_names: &[String],
) -> Result<()> {
    let mut estimate = Estimate::new();
    let filter_exp = estimate.filter(&policy.base)?;
    let mut body = FIELD_HEADER_SIZE + 4 + 1;
    let mut prev: Option<&Key> = None;
    for &offset in offsets {
        let key = &keys[offset];
        body += 4 + DIGEST_SIZE + 1;
        if prev.is_some_and(|p| same_entry(p, key, policy.send_set_name)) {
            continue;
        }
        body += 1 + 2 + 2 + FIELD_HEADER_SIZE + key.namespace().len();
        if policy.send_set_name {
            body += FIELD_HEADER_SIZE + key.set_name().len();
        }
        for name in bin_names {
            estimate.bin_name(name)?;
        }
        prev = Some(key);
    }
    estimate.size += body;

    let field_type = if policy.send_set_name {
        FieldType::BatchIndexWithSet
    } else {
        FieldType::BatchIndex
    };

    let mut writer = RequestWriter::begin(buf, &estimate);
    writer.header(&policy.base, read_attr | INFO1_BATCH, 0, estimate.fields + 1, 0);
    writer.filter(filter_exp.as_ref());

    let field_offset = writer.buf().len();
    writer.field_header(0, field_type);
    writer.buf().put_u32(offsets.len() as u32);
    writer.buf().put_u8(u8::from(policy.allow_inline));

    let mut prev: Option<&Key> = None;
    for &offset in offsets {
        let key = &keys[offset];
        writer.buf().put_u32(offset as u32);
        writer.buf().put_slice(key.digest());
        if prev.is_some_and(|p| same_entry(p, key, policy.send_set_name)) {
            writer.buf().put_u8(1);
            continue;
        }
        writer.buf().put_u8(0);
        writer.buf().put_u8(read_attr);
        writer.buf().put_u16(if policy.send_set_name { 2 } else { 1 });
        writer.buf().put_u16(bin_names.len() as u16);
        writer.field_str(key.namespace(), FieldType::Namespace);
        if policy.send_set_name {
            writer.field_str(key.set_name(), FieldType::Table);
        }
        for name in bin_names {
            writer.read_bin(name);
        }
        prev = Some(key);
    }

    let buf = writer.buf();
    let field_size = (buf.len() - field_offset - 4) as u32;
    buf[field_offset..field_offset + 4].copy_from_slice(&field_size.to_be_bytes());
    writer.finish();
    Ok(())
}

/// Reads a batch reply stream, handing each record's batch index, header
/// result and body to `on_record` until the last message.
async fn read_batch_stream<F>(conn: &mut Connection, key_count: usize, mut on_record: F) -> Result<()>
where
    F: FnMut(usize, &MessageHeader, &mut Bytes) -> Result<()>,
{
    loop {
        let mut body = read_body(conn).await?;
        while body.has_remaining() {
            let header = parse_header(&mut body)?;
            let code = header.result();
            if !code.is_batch_tolerated() {
                return Err(Error::server(code, "batch aborted by server"));
            }
            if header.is_last() {
                return Ok(());
            }
            let index = header.timeout as usize;
            if index >= key_count {
                conn.invalidate();
                return Err(Error::Protocol(format!(
                    "batch index {} out of range for {} keys",
                    index, key_count
                )));
            }
            on_record(index, &header, &mut body)?;
        }
    }
}

/// Reads a batch of records from one node.
#[derive(Debug)]
pub struct BatchReadCommand<'a> {
    policy: &'a BatchPolicy,
    keys: &'a [Key],
    bins: &'a Bins,
    batch: BatchNode,
    records: Vec<(usize, Option<Record>)>,
}

impl<'a> BatchReadCommand<'a> {
    /// Creates the command for one node's share of `keys`.
    pub fn new(policy: &'a BatchPolicy, keys: &'a [Key], bins: &'a Bins, batch: BatchNode) -> Self {
        Self {
            policy,
            keys,
            bins,
            records: Vec::with_capacity(batch.offsets.len()),
            batch,
        }
    }

    /// Records read, paired with their key offsets.
    pub fn into_records(self) -> Vec<(usize, Option<Record>)> {
        self.records
    }
}

#[async_trait]
impl Command for BatchReadCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let read_attr = match self.bins {
            Bins::All => INFO1_READ | INFO1_GET_ALL,
            Bins::None => INFO1_READ | INFO1_NOBINDATA,
            Bins::Some(_) => INFO1_READ,
        };
        write_batch(
            buf,
            self.policy,
            self.keys,
            &self.batch.offsets,
            read_attr,
            self.bins.names(),
        )
    }

    fn get_node(&mut self, _cluster: &Cluster) -> Result<Arc<Node>> {
        Ok(Arc::clone(&self.batch.node))
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        self.records.clear();
        let keys = self.keys;
        let header_only = matches!(self.bins, Bins::None);
        let records = &mut self.records;
        read_batch_stream(conn, keys.len(), |index, header, body| {
            parse_fields(body, header.field_count)?;
            if header.result() != ResultCode::Ok {
                skip_bins(body, header.op_count)?;
                records.push((index, None));
                return Ok(());
            }
            let bins = if header_only {
                skip_bins(body, header.op_count)?;
                Default::default()
            } else {
                parse_bins(body, header.op_count)?
            };
            records.push((
                index,
                Some(Record::new(
                    Some(keys[index].clone()),
                    bins,
                    header.generation,
                    header.expiration,
                )),
            ));
            Ok(())
        })
        .await
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

/// Checks existence of a batch of keys on one node.
#[derive(Debug)]
pub struct BatchExistsCommand<'a> {
    policy: &'a BatchPolicy,
    keys: &'a [Key],
    batch: BatchNode,
    found: Vec<(usize, bool)>,
}

impl<'a> BatchExistsCommand<'a> {
    /// Creates the command for one node's share of `keys`.
    pub fn new(policy: &'a BatchPolicy, keys: &'a [Key], batch: BatchNode) -> Self {
        Self {
            policy,
            keys,
            found: Vec::with_capacity(batch.offsets.len()),
            batch,
        }
    }

    /// Existence flags, paired with their key offsets.
    pub fn into_results(self) -> Vec<(usize, bool)> {
        self.found
    }
}

#[async_trait]
impl Command for BatchExistsCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        write_batch(
            buf,
            self.policy,
            self.keys,
            &self.batch.offsets,
            INFO1_READ | INFO1_NOBINDATA,
            &[],
        )
    }

    fn get_node(&mut self, _cluster: &Cluster) -> Result<Arc<Node>> {
        Ok(Arc::clone(&self.batch.node))
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        self.found.clear();
        let found = &mut self.found;
        read_batch_stream(conn, self.keys.len(), |index, header, body| {
            parse_fields(body, header.field_count)?;
            skip_bins(body, header.op_count)?;
            found.push((index, header.result() == ResultCode::Ok));
            Ok(())
        })
        .await
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

fn concurrency(concurrent_nodes: usize, nodes: usize) -> usize {
    match concurrent_nodes {
        0 => nodes.max(1),
        n => n,
    }
}

/// Reads `keys` in as many requests as there are nodes involved.
///
/// Results are in key order; a missing or filtered record is `None`.
#[instrument(name = "command.batch_get", skip_all, fields(keys = keys.len()))]
pub async fn batch_get(
    cluster: &Cluster,
    policy: &BatchPolicy,
    keys: &[Key],
    bins: &Bins,
) -> Result<Vec<Option<Record>>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let groups = BatchNode::group(cluster, &policy.base, keys)?;
    let parallel = concurrency(policy.concurrent_nodes, groups.len());
    tracing::debug!(nodes = groups.len(), parallel, "dispatching batch read");

    let commands: Vec<BatchReadCommand<'_>> = stream::iter(groups)
        .map(|batch| async move {
            let mut command = BatchReadCommand::new(policy, keys, bins, batch);
            execute(cluster, &mut command).await?;
            Ok::<_, Error>(command)
        })
        .buffer_unordered(parallel)
        .try_collect()
        .await?;

    let mut records: Vec<Option<Record>> = vec![None; keys.len()];
    for command in commands {
        for (index, record) in command.into_records() {
            records[index] = record;
        }
    }
    Ok(records)
}

/// Checks existence of `keys`, in key order.
#[instrument(name = "command.batch_exists", skip_all, fields(keys = keys.len()))]
pub async fn batch_exists(cluster: &Cluster, policy: &BatchPolicy, keys: &[Key]) -> Result<Vec<bool>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let groups = BatchNode::group(cluster, &policy.base, keys)?;
    let parallel = concurrency(policy.concurrent_nodes, groups.len());

    let commands: Vec<BatchExistsCommand<'_>> = stream::iter(groups)
        .map(|batch| async move {
            let mut command = BatchExistsCommand::new(policy, keys, batch);
            execute(cluster, &mut command).await?;
            Ok::<_, Error>(command)
        })
        .buffer_unordered(parallel)
        .try_collect()
        .await?;

    let mut found = vec![false; keys.len()];
    for command in commands {
        for (index, exists) in command.into_results() {
            found[index] = exists;
        }
    }
    Ok(found)
}
