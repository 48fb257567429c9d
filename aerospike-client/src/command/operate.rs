//! Multi-operation requests on one record and record UDF calls.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;

use aerospike_core::protocol::{
    FieldType, INFO1_GET_ALL, INFO1_NOBINDATA, INFO1_READ, INFO2_DELETE, INFO2_RESPOND_ALL_OPS,
    INFO2_WRITE,
};
use aerospike_core::{Error, Key, Operation, OperationType, Record, Result, ResultCode, Value};

use super::buffer::{parse_bins, parse_fields, Estimate, RequestWriter};
use super::command::{read_message, Command};
use crate::cluster::{Cluster, Node, Partition};
use crate::connection::Connection;
use crate::policy::{BasePolicy, WritePolicy};

const SUCCESS_BIN: &str = "SUCCESS";
const FAILURE_BIN: &str = "FAILURE";

/// Attributes derived from an operation list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct OperateAttrs {
    read_attr: u8,
    write_attr: u8,
    has_write: bool,
}

fn operate_attrs(ops: &[Operation], respond_per_each_op: bool) -> OperateAttrs {
    let mut attrs = OperateAttrs::default();
    let mut read_bin = false;
    let mut read_header = false;

    for op in ops {
        match op.op_type {
            OperationType::Read => {
                if op.is_header_only() {
                    attrs.read_attr |= INFO1_READ;
                    read_header = true;
                } else if op.bin_name.is_empty() {
                    attrs.read_attr |= INFO1_READ | INFO1_GET_ALL;
                } else {
                    attrs.read_attr |= INFO1_READ;
                    read_bin = true;
                }
            }
            OperationType::CdtRead
            | OperationType::BitRead
            | OperationType::HllRead
            | OperationType::ExpRead => {
                attrs.read_attr |= INFO1_READ;
                read_bin = true;
            }
            OperationType::Delete => {
                attrs.write_attr |= INFO2_WRITE | INFO2_DELETE;
                attrs.has_write = true;
            }
            _ => {
                attrs.write_attr |= INFO2_WRITE;
                attrs.has_write = true;
            }
        }
    }

    if read_header && !read_bin {
        attrs.read_attr |= INFO1_NOBINDATA;
    }
    if respond_per_each_op {
        attrs.write_attr |= INFO2_RESPOND_ALL_OPS;
    }
    attrs
}

/// Runs several operations on one record in a single round trip.
///
/// Routed as a write when any operation changes the record, as a read
/// otherwise.
#[derive(Debug)]
pub struct OperateCommand<'a> {
    policy: &'a WritePolicy,
    key: &'a Key,
    ops: &'a [Operation],
    attrs: OperateAttrs,
    partition: Partition,
    record: Option<Record>,
}

impl<'a> OperateCommand<'a> {
    /// Creates an operate request; fails when `ops` is empty.
    pub fn new(policy: &'a WritePolicy, key: &'a Key, ops: &'a [Operation]) -> Result<Self> {
        if ops.is_empty() {
            return Err(Error::InvalidArgument(
                "operate requires at least one operation".to_string(),
            ));
        }
        let attrs = operate_attrs(ops, policy.respond_per_each_op);
        let partition = if attrs.has_write {
            Partition::for_write(key)
        } else {
            Partition::for_read(key, policy.base.replica, policy.base.read_mode_sc)
        };
        Ok(Self {
            policy,
            key,
            ops,
            attrs,
            partition,
            record: None,
        })
    }

    /// The resulting record, or `None` when the key does not exist.
    pub fn into_record(self) -> Option<Record> {
        self.record
    }
}

#[async_trait]
impl Command for OperateCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let send_key = self.attrs.has_write && self.policy.base.send_key;
        let mut estimate = Estimate::new();
        estimate.key(self.key, send_key)?;
        let filter = estimate.filter(&self.policy.base)?;
        for op in self.ops {
            estimate.operation(op)?;
        }

        let op_count = self.ops.len() as u16;
        let mut writer = RequestWriter::begin(buf, &estimate);
        if self.attrs.write_attr != 0 {
            writer.write_header(
                self.policy,
                self.attrs.read_attr,
                self.attrs.write_attr,
                estimate.fields,
                op_count,
            );
        } else {
            writer.header(
                &self.policy.base,
                self.attrs.read_attr,
                0,
                estimate.fields,
                op_count,
            );
        }
        writer.key(self.key, send_key)?;
        writer.filter(filter.as_ref());
        for op in self.ops {
            writer.operation(op)?;
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
                let bins = parse_bins(&mut body, header.op_count)?;
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
            code => Err(Error::server(code, format!("operate {}", self.key))),
        }
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        self.partition.prepare_retry(is_client_timeout);
    }

    fn is_write(&self) -> bool {
        self.attrs.has_write
    }
}

/// Runs a registered UDF against one record.
#[derive(Debug)]
pub struct ExecuteUdfCommand<'a> {
    policy: &'a WritePolicy,
    key: &'a Key,
    package: &'a str,
    function: &'a str,
    args: Value,
    partition: Partition,
    result: Option<Value>,
}

impl<'a> ExecuteUdfCommand<'a> {
    /// Creates a call of `package.function(args)` on `key`.
    pub fn new(
        policy: &'a WritePolicy,
        key: &'a Key,
        package: &'a str,
        function: &'a str,
        args: &[Value],
    ) -> Self {
        Self {
            policy,
            key,
            package,
            function,
            args: Value::List(args.to_vec()),
            partition: Partition::for_write(key),
            result: None,
        }
    }

    /// The value the function returned, if any.
    pub fn into_result(self) -> Option<Value> {
        self.result
    }
}

#[async_trait]
impl Command for ExecuteUdfCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let send_key = self.policy.base.send_key;
        let args_size = self.args.estimate_size()?;
        let mut estimate = Estimate::new();
        estimate.key(self.key, send_key)?;
        let filter = estimate.filter(&self.policy.base)?;
        estimate.field(self.package.len());
        estimate.field(self.function.len());
        estimate.field(args_size);

        let mut writer = RequestWriter::begin(buf, &estimate);
        writer.write_header(self.policy, 0, INFO2_WRITE, estimate.fields, 0);
        writer.key(self.key, send_key)?;
        writer.filter(filter.as_ref());
        writer.field_str(self.package, FieldType::UdfPackageName);
        writer.field_str(self.function, FieldType::UdfFunction);
        writer.field_header(args_size, FieldType::UdfArglist);
        self.args.write_to(writer.buf())?;
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
                let mut bins = parse_bins(&mut body, header.op_count)?;
                if let Some(failure) = bins.remove(FAILURE_BIN) {
                    return Err(Error::server(
                        ResultCode::UdfBadResponse,
                        format!("{}.{}: {}", self.package, self.function, udf_message(&failure)),
                    ));
                }
                self.result = bins.remove(SUCCESS_BIN);
                Ok(())
            }
            ResultCode::UdfBadResponse => {
                parse_fields(&mut body, header.field_count)?;
                let mut bins = parse_bins(&mut body, header.op_count).unwrap_or_default();
                let detail = bins
                    .remove(FAILURE_BIN)
                    .map(|v| udf_message(&v))
                    .unwrap_or_else(|| "no failure message".to_string());
                Err(Error::server(
                    ResultCode::UdfBadResponse,
                    format!("{}.{}: {}", self.package, self.function, detail),
                ))
            }
            code => Err(Error::server(
                code,
                format!("udf {}.{} on {}", self.package, self.function, self.key),
            )),
        }
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        self.partition.prepare_retry(is_client_timeout);
    }

    fn is_write(&self) -> bool {
        true
    }
}

fn udf_message(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => format!("{:?}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerospike_core::protocol::MessageHeader;
    use aerospike_core::Bin;

    fn header_of(buf: &BytesMut) -> MessageHeader {
        MessageHeader::read_from(&mut &buf[8..]).unwrap()
    }

    #[test]
    fn test_read_only_ops_route_as_read() {
        let attrs = operate_attrs(&[Operation::get_bin("a")], false);
        assert_eq!(attrs.read_attr, INFO1_READ);
        assert_eq!(attrs.write_attr, 0);
        assert!(!attrs.has_write);
    }

    #[test]
    fn test_get_all_and_header_flags() {
        let attrs = operate_attrs(&[Operation::get()], false);
        assert_eq!(attrs.read_attr, INFO1_READ | INFO1_GET_ALL);

        let attrs = operate_attrs(&[Operation::get_header()], false);
        assert_eq!(attrs.read_attr, INFO1_READ | INFO1_NOBINDATA);

        let attrs = operate_attrs(&[Operation::get_header(), Operation::get_bin("a")], false);
        assert_eq!(attrs.read_attr, INFO1_READ);
    }

    #[test]
    fn test_mixed_ops_are_a_write() {
        let ops = [Operation::add(Bin::new("n", 1)), Operation::get_bin("n")];
        let attrs = operate_attrs(&ops, true);
        assert!(attrs.has_write);
        assert_eq!(attrs.write_attr, INFO2_WRITE | INFO2_RESPOND_ALL_OPS);
        assert_eq!(attrs.read_attr, INFO1_READ);
    }

    #[test]
    fn test_delete_op_sets_delete_flag() {
        let attrs = operate_attrs(&[Operation::delete()], false);
        assert_eq!(attrs.write_attr, INFO2_WRITE | INFO2_DELETE);
    }

    #[test]
    fn test_empty_ops_rejected() {
        let key = Key::new("test", "", 1).unwrap();
        let policy = WritePolicy::default();
        assert!(OperateCommand::new(&policy, &key, &[]).is_err());
    }

    #[test]
    fn test_operate_request_counts() {
        let key = Key::new("test", "s", 1).unwrap();
        let policy = WritePolicy::default();
        let ops = [Operation::put(Bin::new("a", 1)), Operation::get()];
        let mut command = OperateCommand::new(&policy, &key, &ops).unwrap();
        assert!(command.is_write());

        let mut buf = BytesMut::new();
        command.write_buffer(&mut buf).unwrap();
        let header = header_of(&buf);
        assert_eq!(header.op_count, 2);
        assert_eq!(header.info1, INFO1_READ | INFO1_GET_ALL);
        assert_eq!(header.info2, INFO2_WRITE);
    }

    #[test]
    fn test_udf_request_fields() {
        let key = Key::new("test", "s", 1).unwrap();
        let policy = WritePolicy::default();
        let mut command =
            ExecuteUdfCommand::new(&policy, &key, "pkg", "fn1", &[Value::from(7)]);
        let mut buf = BytesMut::new();
        command.write_buffer(&mut buf).unwrap();
        let header = header_of(&buf);
        // namespace, set, digest, package, function, args
        assert_eq!(header.field_count, 6);
        assert_eq!(header.op_count, 0);
        assert!(buf.windows(3).any(|w| w == b"pkg"));
        assert!(buf.windows(3).any(|w| w == b"fn1"));
    }
}
