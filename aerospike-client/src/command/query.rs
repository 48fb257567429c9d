//! Secondary index queries.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::instrument;

use aerospike_core::bin::validate_bin_name;
use aerospike_core::protocol::{FieldType, ParticleType, INFO1_NOBINDATA, INFO1_READ};
use aerospike_core::{Error, Record, Result, ResultCode, Value};

use super::buffer::{parse_bins, parse_fields, parse_header, skip_bins, Estimate, RequestWriter};
use super::command::{execute, read_body, Command};
use super::recordset::{RecordSender, Recordset};
use super::Bins;
use crate::cluster::{Cluster, Node};
use crate::connection::Connection;
use crate::policy::{BasePolicy, QueryPolicy};

/// UDF_OP value for an aggregation whose results stream back.
const UDF_OP_AGGREGATE: u8 = 1;

/// How an indexed bin's collection is searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IndexCollectionType {
    /// Plain bin value.
    #[default]
    Default = 0,
    /// List elements.
    List = 1,
    /// Map keys.
    MapKeys = 2,
    /// Map values.
    MapValues = 3,
}

/// A secondary index predicate: equality or an inclusive range.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    bin_name: String,
    collection: IndexCollectionType,
    particle_type: ParticleType,
    begin: Value,
    end: Value,
}

impl Filter {
    /// Matches records whose bin equals `value`.
    pub fn equal(bin_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::contains(bin_name, IndexCollectionType::Default, value)
    }

    /// Matches records whose integer bin is within `begin..=end`.
    pub fn range(bin_name: impl Into<String>, begin: i64, end: i64) -> Self {
        Self::contains_range(bin_name, IndexCollectionType::Default, begin, end)
    }

    /// Matches records whose collection contains `value`.
    pub fn contains(
        bin_name: impl Into<String>,
        collection: IndexCollectionType,
        value: impl Into<Value>,
    ) -> Self {
        let value = value.into();
        Self {
            bin_name: bin_name.into(),
            collection,
            particle_type: value.particle_type(),
            begin: value.clone(),
            end: value,
        }
    }

    /// Matches records whose collection holds an integer in `begin..=end`.
    pub fn contains_range(
        bin_name: impl Into<String>,
        collection: IndexCollectionType,
        begin: i64,
        end: i64,
    ) -> Self {
        Self {
            bin_name: bin_name.into(),
            collection,
            particle_type: ParticleType::Integer,
            begin: Value::Int(begin),
            end: Value::Int(end),
        }
    }

    /// Indexed bin.
    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    /// Collection searched.
    pub fn collection_type(&self) -> IndexCollectionType {
        self.collection
    }

    fn estimate_size(&self) -> Result<usize> {
        Ok(self.bin_name.len() + 10 + self.begin.estimate_size()? + self.end.estimate_size()?)
    }

    // name length, name, particle type, then begin and end each prefixed
    // with their length
    fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.bin_name.len() as u8);
        buf.put_slice(self.bin_name.as_bytes());
        buf.put_u8(self.particle_type as u8);
        for value in [&self.begin, &self.end] {
            buf.put_u32(value.estimate_size()? as u32);
            value.write_to(buf)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_bin_name(&self.bin_name)?;
        match self.particle_type {
            ParticleType::Integer | ParticleType::String | ParticleType::Blob | ParticleType::GeoJson => Ok(()),
            other => Err(Error::InvalidArgument(format!(
                "{:?} values cannot be used in an index filter",
                other
            ))),
        }
    }
}

/// A UDF run over the query results on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Registered package.
    pub package: String,
    /// Function in the package.
    pub function: String,
    /// Arguments.
    pub args: Vec<Value>,
}

/// What a query selects.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Namespace to query.
    pub namespace: String,
    /// Set to query; empty for the whole namespace.
    pub set_name: String,
    /// Index to use; the server picks one from the filter when unset.
    pub index_name: Option<String>,
    /// Bins returned.
    pub bins: Bins,
    /// Index predicate; without one every record of the set matches.
    pub filter: Option<Filter>,
    /// Optional server-side aggregation.
    pub aggregate: Option<Aggregate>,
    /// Task id; random when unset.
    pub task_id: Option<u64>,
}

impl Statement {
    /// Selects `bins` from every record of `set_name`.
    pub fn new(namespace: impl Into<String>, set_name: impl Into<String>, bins: Bins) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            index_name: None,
            bins,
            filter: None,
            aggregate: None,
            task_id: None,
        }
    }

    /// Restricts the query with an index predicate.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Names the index to use.
    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = Some(index_name.into());
        self
    }

    /// Runs `package.function(args)` over the results on the server.
    pub fn with_aggregate(
        mut self,
        package: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        self.aggregate = Some(Aggregate {
            package: package.into(),
            function: function.into(),
            args,
        });
        self
    }

    /// Sets the task id sent to the server.
    pub fn with_task_id(mut self, task_id: u64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::InvalidArgument("query namespace is empty".to_string()));
        }
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        for name in self.bins.names() {
            validate_bin_name(name)?;
        }
        Ok(())
    }
}

/// Runs a statement on one node.
#[derive(Debug)]
pub struct QueryCommand<'a> {
    policy: &'a QueryPolicy,
    statement: &'a Statement,
    task_id: u64,
    node: Arc<Node>,
    partitions: Vec<u16>,
    sender: &'a RecordSender,
}

impl<'a> QueryCommand<'a> {
    pub(crate) fn new(
        policy: &'a QueryPolicy,
        statement: &'a Statement,
        task_id: u64,
        node: Arc<Node>,
        partitions: Vec<u16>,
        sender: &'a RecordSender,
    ) -> Self {
        Self {
            policy,
            statement,
            task_id,
            node,
            partitions,
            sender,
        }
    }

    fn header_only(&self) -> bool {
        !self.policy.include_bin_data || matches!(self.statement.bins, Bins::None)
    }
}

#[async_trait]
impl Command for QueryCommand<'_> {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn write_buffer(&mut self, buf: &mut BytesMut) -> Result<()> {
        let st = self.statement;
        let bin_names: &[String] = if self.policy.include_bin_data {
            st.bins.names()
        } else {
            &[]
        };
        // with a filter the bin names travel in QUERY_BINLIST, otherwise as
        // read operations
        let binlist = st.filter.is_some() && !bin_names.is_empty();
        let read_ops: &[String] = if binlist { &[] } else { bin_names };
        let args = st
            .aggregate
            .as_ref()
            .map(|a| Value::List(a.args.clone()));

        let mut estimate = Estimate::new();
        estimate.field(st.namespace.len());
        if !st.set_name.is_empty() {
            estimate.field(st.set_name.len());
        }
        if let Some(index) = &st.index_name {
            estimate.field(index.len());
        }
        estimate.field(8);
        let filter_exp = estimate.filter(&self.policy.base)?;
        if let Some(filter) = &st.filter {
            if filter.collection != IndexCollectionType::Default {
                estimate.field(1);
            }
            estimate.field(1 + filter.estimate_size()?);
            if binlist {
                estimate.field(1 + bin_names.iter().map(|n| n.len() + 1).sum::<usize>());
            }
        }
        if !self.partitions.is_empty() {
            estimate.field(self.partitions.len() * 2);
        }
        if self.policy.max_records > 0 {
            estimate.field(8);
        }
        if self.policy.records_per_second > 0 {
            estimate.field(4);
        }
        estimate.field(4);
        if let (Some(aggregate), Some(args)) = (&st.aggregate, &args) {
            estimate.field(1);
            estimate.field(aggregate.package.len());
            estimate.field(aggregate.function.len());
            estimate.field(args.estimate_size()?);
        }
        for name in read_ops {
            estimate.bin_name(name)?;
        }

        let mut read_attr = INFO1_READ;
        if self.header_only() {
            read_attr |= INFO1_NOBINDATA;
        }

        let mut writer = RequestWriter::begin(buf, &estimate);
        writer.header(&self.policy.base, read_attr, 0, estimate.fields, read_ops.len() as u16);
        writer.field_str(&st.namespace, FieldType::Namespace);
        if !st.set_name.is_empty() {
            writer.field_str(&st.set_name, FieldType::Table);
        }
        if let Some(index) = &st.index_name {
            writer.field_str(index, FieldType::IndexName);
        }
        writer.field_u64(self.task_id, FieldType::TranId);
        writer.filter(filter_exp.as_ref());
        if let Some(filter) = &st.filter {
            if filter.collection != IndexCollectionType::Default {
                writer.field_header(1, FieldType::IndexType);
                writer.buf().put_u8(filter.collection as u8);
            }
            writer.field_header(1 + filter.estimate_size()?, FieldType::IndexRange);
            writer.buf().put_u8(1);
            filter.write_to(writer.buf())?;
            if binlist {
                let size = 1 + bin_names.iter().map(|n| n.len() + 1).sum::<usize>();
                writer.field_header(size, FieldType::QueryBinlist);
                writer.buf().put_u8(bin_names.len() as u8);
                for name in bin_names {
                    writer.buf().put_u8(name.len() as u8);
                    writer.buf().put_slice(name.as_bytes());
                }
            }
        }
        if !self.partitions.is_empty() {
            writer.field_header(self.partitions.len() * 2, FieldType::PidArray);
            for pid in &self.partitions {
                writer.buf().put_u16_le(*pid);
            }
        }
        if self.policy.max_records > 0 {
            writer.field_u64(self.policy.max_records, FieldType::ScanMaxRecords);
        }
        if self.policy.records_per_second > 0 {
            writer.field_u32(self.policy.records_per_second, FieldType::RecordsPerSecond);
        }
        let socket_timeout = self.policy.base.effective_socket_timeout().as_millis();
        writer.field_u32(socket_timeout.min(u32::MAX as u128) as u32, FieldType::ScanTimeout);
        if let (Some(aggregate), Some(args)) = (&st.aggregate, &args) {
            writer.field_header(1, FieldType::UdfOp);
            writer.buf().put_u8(UDF_OP_AGGREGATE);
            writer.field_str(&aggregate.package, FieldType::UdfPackageName);
            writer.field_str(&aggregate.function, FieldType::UdfFunction);
            writer.field_header(args.estimate_size()?, FieldType::UdfArglist);
            args.write_to(writer.buf())?;
        }
        for name in read_ops {
            writer.read_bin(name);
        }
        writer.finish();
        Ok(())
    }

    fn get_node(&mut self, _cluster: &Cluster) -> Result<Arc<Node>> {
        Ok(Arc::clone(&self.node))
    }

    async fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        let header_only = self.header_only();
        loop {
            let mut body = read_body(conn).await?;
            while body.has_remaining() {
                let header = parse_header(&mut body)?;
                let code = header.result();

                if header.is_partition_done() {
                    parse_fields(&mut body, header.field_count)?;
                    skip_bins(&mut body, header.op_count)?;
                    continue;
                }
                if header.is_last() {
                    return match code {
                        ResultCode::Ok | ResultCode::KeyNotFoundError => Ok(()),
                        code => Err(Error::server(
                            code,
                            format!("query on {}", self.statement.namespace),
                        )),
                    };
                }
                match code {
                    ResultCode::Ok => {}
                    ResultCode::KeyNotFoundError | ResultCode::FilteredOut => {
                        parse_fields(&mut body, header.field_count)?;
                        skip_bins(&mut body, header.op_count)?;
                        continue;
                    }
                    code => {
                        return Err(Error::server(
                            code,
                            format!("query on {}", self.statement.namespace),
                        ))
                    }
                }

                let mut fields = parse_fields(&mut body, header.field_count)?;
                // aggregation results carry no digest
                let key = if fields.digest.is_some() {
                    if fields.namespace.is_none() {
                        fields.namespace = Some(self.statement.namespace.clone());
                    }
                    Some(fields.into_key()?)
                } else {
                    None
                };
                let bins = if header_only {
                    skip_bins(&mut body, header.op_count)?;
                    Default::default()
                } else {
                    parse_bins(&mut body, header.op_count)?
                };

                if self.sender.is_cancelled() {
                    return Err(self.sender.terminated_error());
                }
                let record = Record::new(key, bins, header.generation, header.expiration);
                self.sender.send(record).await?;
            }
        }
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

/// Runs the statement on every node that masters partitions of its
/// namespace.
#[instrument(name = "command.query", skip_all, fields(namespace = %statement.namespace, task_id = task_id))]
async fn run_query(
    cluster: &Cluster,
    policy: &QueryPolicy,
    statement: &Statement,
    task_id: u64,
    sender: &RecordSender,
) -> Result<()> {
    let ns = statement.namespace.as_str();
    let expected = if policy.fail_on_cluster_change || cluster.is_strong_consistency(ns) {
        Some(cluster.cluster_stable_key(ns).await?)
    } else {
        None
    };
    let expected = expected.as_deref();

    let groups = cluster.partition_map().partitions_by_master(ns)?;
    let parallel = match policy.max_concurrent_nodes {
        0 => groups.len().max(1),
        n => n,
    };
    tracing::debug!(nodes = groups.len(), "dispatching query");

    stream::iter(groups)
        .map(|(node, partitions)| async move {
            let mut command =
                QueryCommand::new(policy, statement, task_id, Arc::clone(&node), partitions, sender);
            execute(cluster, &mut command).await?;
            if let Some(expected) = expected {
                let key = node.cluster_stable_key(ns).await?;
                if key != expected {
                    return Err(Error::client(
                        ResultCode::QueryAborted,
                        format!("cluster key changed from {} to {} during query", expected, key),
                    ));
                }
            }
            Ok(())
        })
        .buffer_unordered(parallel)
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}

/// Starts `statement` in a background task.
///
/// # Errors
///
/// Fails before starting when the statement is invalid.
pub fn query(cluster: Arc<Cluster>, policy: QueryPolicy, statement: Statement) -> Result<Recordset> {
    statement.validate()?;
    let task_id = statement.task_id.unwrap_or_else(rand::random::<u64>);
    let (recordset, sender) =
        Recordset::channel(policy.record_queue_size, task_id, ResultCode::QueryTerminated);

    tokio::spawn(async move {
        if let Err(e) = run_query(&cluster, &policy, &statement, task_id, &sender).await {
            if !sender.is_cancelled() {
                sender.fail(e).await;
            }
        }
    });
    Ok(recordset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerospike_core::protocol::MessageHeader;
    use crate::cluster::testing;

    #[test]
    fn test_range_filter_layout() {
        let filter = Filter::range("age", 10, 20);
        let mut buf = BytesMut::new();
        filter.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), filter.estimate_size().unwrap());

        let mut b = &buf[..];
        assert_eq!(b.get_u8(), 3);
        b.advance(3);
        assert_eq!(b.get_u8(), ParticleType::Integer as u8);
        assert_eq!(b.get_u32(), 8);
        assert_eq!(b.get_i64(), 10);
        assert_eq!(b.get_u32(), 8);
        assert_eq!(b.get_i64(), 20);
    }

    #[test]
    fn test_equal_string_filter() {
        let filter = Filter::equal("name", "bob");
        assert_eq!(filter.particle_type, ParticleType::String);
        assert_eq!(filter.collection_type(), IndexCollectionType::Default);
        assert!(filter.validate().is_ok());
        assert!(Filter::equal("x", 1.5).validate().is_err());
    }

    #[test]
    fn test_statement_requires_namespace() {
        assert!(Statement::new("", "s", Bins::All).validate().is_err());
        assert!(Statement::new("test", "", Bins::All).validate().is_ok());
    }

    #[test]
    fn test_filtered_query_sends_binlist() {
        let statement = Statement::new("test", "s", Bins::from(["a", "bb"]))
            .with_filter(Filter::contains("tags", IndexCollectionType::List, "x"))
            .with_index_name("idx");
        let policy = QueryPolicy::default();
        let (_rs, sender) = Recordset::channel(1, 3, ResultCode::QueryTerminated);
        let mut command =
            QueryCommand::new(&policy, &statement, 3, testing::test_node("A"), vec![], &sender);

        let mut buf = BytesMut::new();
        command.write_buffer(&mut buf).unwrap();
        let header = MessageHeader::read_from(&mut &buf[8..]).unwrap();
        // namespace, set, index, task id, index type, range, bin list, timeout
        assert_eq!(header.field_count, 8);
        assert_eq!(header.op_count, 0);
        assert!(buf.windows(3).any(|w| w == b"idx"));
    }

    #[test]
    fn test_unfiltered_query_reads_bins_as_ops() {
        let statement = Statement::new("test", "s", Bins::from(["a"]));
        let policy = QueryPolicy::default();
        let (_rs, sender) = Recordset::channel(1, 3, ResultCode::QueryTerminated);
        let mut command =
            QueryCommand::new(&policy, &statement, 3, testing::test_node("A"), vec![1, 2], &sender);

        let mut buf = BytesMut::new();
        command.write_buffer(&mut buf).unwrap();
        let header = MessageHeader::read_from(&mut &buf[8..]).unwrap();
        // namespace, set, task id, pids, timeout
        assert_eq!(header.field_count, 5);
        assert_eq!(header.op_count, 1);
    }
}
