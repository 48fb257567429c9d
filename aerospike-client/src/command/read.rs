//! Single-key reads: whole records, selected bins, metadata and existence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;

use aerospike_core::protocol::{INFO1_GET_ALL, INFO1_NOBINDATA, INFO1_READ};
use aerospike_core::{Error, Key, Record, Result, ResultCode};

use super::buffer::{parse_bins, parse_fields, Estimate, RequestWriter};
use super::command::{read_message, Command};
use super::Bins;
use crate::cluster::{Cluster, Node, Partition};
use crate::connection::Connection;
use crate::policy::BasePolicy;

/// Reads a record, some of its bins or only its metadata.
#[derive(Debug)]
pub struct ReadCommand<'a> {
    policy: &'a BasePolicy,
    key: &'a Key,
    bins: &'a Bins,
    partition: Partition,
    record: Option<Record>,
}

impl<'a> ReadCommand<'a> {
    /// Creates a read of `bins` from `key`.
    pub fn new(policy: &'a BasePolicy, key: &'a Key, bins: &'a Bins) -> Self {
        Self {
            policy,
            key,
            bins,
            partition: Partition::for_read(key, policy.replica, policy.read_mode_sc),
            record: None,
        }
    }

    /// The record read, or `None` when the key does not exist.
    pub fn into_record(self) -> Option<Record> {
        self.record
    }
}

#[async_trait]
impl Command for ReadCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        self.policy
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let mut estimate = Estimate::new();
        estimate.key(self.key, false)?;
        let filter = estimate.filter(self.policy)?;
        match self.bins {
            Bins::All => {}
            Bins::None => estimate.bin_name("")?,
            Bins::Some(names) => {
                for name in names {
                    estimate.bin_name(name)?;
                }
            }
        }

        let mut writer = RequestWriter::begin(buf, &estimate);
        match self.bins {
            Bins::All => {
                writer.header(self.policy, INFO1_READ | INFO1_GET_ALL, 0, estimate.fields, 0);
                writer.key(self.key, false)?;
                writer.filter(filter.as_ref());
            }
            Bins::None => {
                writer.header(self.policy, INFO1_READ | INFO1_NOBINDATA, 0, estimate.fields, 1);
                writer.key(self.key, false)?;
                writer.filter(filter.as_ref());
                writer.read_bin("");
            }
            Bins::Some(names) => {
                writer.header(self.policy, INFO1_READ, 0, estimate.fields, names.len() as u16);
                writer.key(self.key, false)?;
                writer.filter(filter.as_ref());
                for name in names {
                    writer.read_bin(name);
                }
            }
        }
        writer.finish();
        Ok(())
    }

    fn get_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        cluster.node_for(&mut self.partition)
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        let (header, mut body) = read_message(conn).await?;
        match header.result() {
            ResultCode::Ok => {
                parse_fields(&mut body, header.field_count)?;
                let bins = if matches!(self.bins, Bins::None) {
                    HashMap::new()
                } else {
                    parse_bins(&mut body, header.op_count)?
                };
                self.record = Some(Record::new(
                    Some(self.key.clone()),
                    bins,
                    header.generation,
                    header.expiration,
                ));
                Ok(())
            }
            ResultCode::KeyNotFoundError => {
                self.record = None;
                Ok(())
            }
            code => Err(Error::server(code, format!("read {}", self.key))),
        }
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        self.partition.prepare_retry(is_client_timeout);
    }
}

/// Checks whether a record exists without reading it.
#[derive(Debug)]
pub struct ExistsCommand<'a> {
    policy: &'a BasePolicy,
    key: &'a Key,
    partition: Partition,
    exists: bool,
}

impl<'a> ExistsCommand<'a> {
    /// Creates an existence check for `key`.
    pub fn new(policy: &'a BasePolicy, key: &'a Key) -> Self {
        Self {
            policy,
            key,
            partition: Partition::for_read(key, policy.replica, policy.read_mode_sc),
            exists: false,
        }
    }

    /// True if the record exists.
    pub fn exists(&self) -> bool {
        self.exists
    }
}

#[async_trait]
impl Command for ExistsCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        self.policy
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let mut estimate = Estimate::new();
        estimate.key(self.key, false)?;
        let filter = estimate.filter(self.policy)?;
        let mut writer = RequestWriter::begin(buf, &estimate);
        writer.header(self.policy, INFO1_READ | INFO1_NOBINDATA, 0, estimate.fields, 0);
        writer.key(self.key, false)?;
        writer.filter(filter.as_ref());
        writer.finish();
        Ok(())
    }

    fn get_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        cluster.node_for(&mut self.partition)
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        let (header, _) = read_message(conn).await?;
        match header.result() {
            ResultCode::Ok => self.exists = true,
            ResultCode::KeyNotFoundError => self.exists = false,
            code => return Err(Error::server(code, format!("exists {}", self.key))),
        }
        Ok(())
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        self.partition.prepare_retry(is_client_timeout);
    }
}
