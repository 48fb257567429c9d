//! Single-key writes, deletes and touches.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;

use aerospike_core::protocol::{INFO2_DELETE, INFO2_WRITE};
use aerospike_core::{Bin, Error, Key, Operation, OperationType, Result, ResultCode};

use super::buffer::{Estimate, RequestWriter};
use super::command::{read_message, Command};
use crate::cluster::{Cluster, Node, Partition};
use crate::connection::Connection;
use crate::policy::{BasePolicy, WritePolicy};

/// Writes bins with one operation code: put, append, prepend or add.
#[derive(Debug)]
pub struct WriteCommand<'a> {
    policy: &'a WritePolicy,
    key: &'a Key,
    bins: &'a [Bin],
    op_type: OperationType,
    partition: Partition,
}

impl<'a> WriteCommand<'a> {
    /// Creates a write of `bins` to `key`.
    ///
    /// `op_type` must be one of `Write`, `Append`, `Prepend` or `Add`.
    pub fn new(policy: &'a WritePolicy, key: &'a Key, bins: &'a [Bin], op_type: OperationType) -> Self {
        Self {
            policy,
            key,
            bins,
            op_type,
            partition: Partition::for_write(key),
        }
    }
}

#[async_trait]
impl Command for WriteCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        if !matches!(
            self.op_type,
            OperationType::Write | OperationType::Append | OperationType::Prepend | OperationType::Add
        ) {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not a bin write",
                self.op_type
            )));
        }

        let send_key = self.policy.base.send_key;
        let mut estimate = Estimate::new();
        estimate.key(self.key, send_key)?;
        let filter = estimate.filter(&self.policy.base)?;
        for bin in self.bins {
            estimate.bin(bin)?;
        }

        let mut writer = RequestWriter::begin(buf, &estimate);
        writer.write_header(self.policy, 0, INFO2_WRITE, estimate.fields, self.bins.len() as u16);
        writer.key(self.key, send_key)?;
        writer.filter(filter.as_ref());
        for bin in self.bins {
            writer.bin(bin, self.op_type)?;
        }
        writer.finish();
        Ok(())
    }

    fn get_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        cluster.node_for(&mut self.partition)
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        let (header, _) = read_message(conn).await?;
        match header.result() {
            ResultCode::Ok => Ok(()),
            code => Err(Error::server(code, format!("write {}", self.key))),
        }
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        self.partition.prepare_retry(is_client_timeout);
    }

    fn is_write(&self) -> bool {
        true
    }
}

/// Deletes a record, reporting whether it existed.
#[derive(Debug)]
pub struct DeleteCommand<'a> {
    policy: &'a WritePolicy,
    key: &'a Key,
    partition: Partition,
    existed: bool,
}

impl<'a> DeleteCommand<'a> {
    /// Creates a delete of `key`.
    pub fn new(policy: &'a WritePolicy, key: &'a Key) -> Self {
        Self {
            policy,
            key,
            partition: Partition::for_write(key),
            existed: false,
        }
    }

    /// True if the record existed before the delete.
    pub fn existed(&self) -> bool {
        self.existed
    }
}

#[async_trait]
impl Command for DeleteCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let mut estimate = Estimate::new();
        estimate.key(self.key, false)?;
        let filter = estimate.filter(&self.policy.base)?;
        let mut writer = RequestWriter::begin(buf, &estimate);
        writer.write_header(self.policy, 0, INFO2_WRITE | INFO2_DELETE, estimate.fields, 0);
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
            ResultCode::Ok => self.existed = true,
            ResultCode::KeyNotFoundError => self.existed = false,
            code => return Err(Error::server(code, format!("delete {}", self.key))),
        }
        Ok(())
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        self.partition.prepare_retry(is_client_timeout);
    }

    fn is_write(&self) -> bool {
        true
    }
}

/// Resets a record's time to live.
#[derive(Debug)]
pub struct TouchCommand<'a> {
    policy: &'a WritePolicy,
    key: &'a Key,
    partition: Partition,
}

impl<'a> TouchCommand<'a> {
    /// Creates a touch of `key`.
    pub fn new(policy: &'a WritePolicy, key: &'a Key) -> Self {
        Self {
            policy,
            key,
            partition: Partition::for_write(key),
        }
    }
}

#[async_trait]
impl Command for TouchCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let send_key = self.policy.base.send_key;
        let touch = Operation::touch();
        let mut estimate = Estimate::new();
        estimate.key(self.key, send_key)?;
        let filter = estimate.filter(&self.policy.base)?;
        estimate.operation(&touch)?;

        let mut writer = RequestWriter::begin(buf, &estimate);
        writer.write_header(self.policy, 0, INFO2_WRITE, estimate.fields, 1);
        writer.key(self.key, send_key)?;
        writer.filter(filter.as_ref());
        writer.operation(&touch)?;
        writer.finish();
        Ok(())
    }

    fn get_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        cluster.node_for(&mut self.partition)
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        let (header, _) = read_message(conn).await?;
        match header.result() {
            ResultCode::Ok => Ok(()),
            code => Err(Error::server(code, format!("touch {}", self.key))),
        }
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        self.partition.prepare_retry(is_client_timeout);
    }

    fn is_write(&self) -> bool {
        true
    }
}
