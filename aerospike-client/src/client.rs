//! Client entry point.

use std::collections::HashMap;
use std::sync::Arc;

use aerospike_core::{Bin, Key, OperationType, Operation, Record, Result, Value};

use crate::cluster::{Cluster, Host};
use crate::command::{
    self, Bins, DeleteCommand, ExecuteUdfCommand, ExistsCommand, OperateCommand, ReadCommand,
    Recordset, Statement, TouchCommand, WriteCommand,
};
use crate::config::ClientPolicy;
use crate::policy::{BasePolicy, BatchPolicy, QueryPolicy, ScanPolicy, WritePolicy};

/// Connects to an Aerospike cluster and runs commands against it.
///
/// The client is cheap to clone; clones share the cluster and its
/// connection pools.
///
/// # Example
///
/// ```ignore
/// use aerospike_client::{Bin, Client, ClientPolicy, Host, Key, WritePolicy};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let policy = ClientPolicy::builder().build()?;
///     let client = Client::new(policy, vec![Host::new("127.0.0.1", 3000)]).await?;
///
///     let key = Key::new("test", "users", "alice")?;
///     client.put(&WritePolicy::default(), &key, &[Bin::new("age", 31)]).await?;
///     let record = client.get(&Default::default(), &key, Default::default()).await?;
///     println!("{:?}", record);
///
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    cluster: Arc<Cluster>,
}

impl Client {
    /// Seeds the cluster from `hosts` and starts tending it.
    ///
    /// # Errors
    ///
    /// Fails when the policy is invalid or, with `fail_if_not_connected`,
    /// when no seed could be reached.
    pub async fn new(policy: ClientPolicy, hosts: Vec<Host>) -> Result<Self> {
        let cluster = Cluster::new(policy, hosts).await?;
        Ok(Self { cluster })
    }

    /// Loads a configuration file and connects to the hosts it lists.
    #[cfg(feature = "config-file")]
    pub async fn from_config_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let (policy, hosts) = crate::config_file::load_config(path)?;
        Self::new(policy, hosts).await
    }

    /// The underlying cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// True while at least one node is active.
    pub fn is_connected(&self) -> bool {
        self.cluster.is_connected()
    }

    /// Names of the active nodes.
    pub fn node_names(&self) -> Vec<String> {
        self.cluster.node_names()
    }

    /// Writes `bins` to the record at `key`.
    pub async fn put(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, bins, OperationType::Write).await
    }

    /// Appends string or blob values to existing bins.
    pub async fn append(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, bins, OperationType::Append).await
    }

    /// Prepends string or blob values to existing bins.
    pub async fn prepend(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, bins, OperationType::Prepend).await
    }

    /// Adds integer or float values to existing bins.
    pub async fn add(&self, policy: &WritePolicy, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, bins, OperationType::Add).await
    }

    async fn write(&self, policy: &WritePolicy, key: &Key, bins: &[Bin], op_type: OperationType) -> Result<()> {
        let mut command = WriteCommand::new(policy, key, bins, op_type);
        self.cluster.execute(&mut command).await
    }

    /// Reads the record at `key`; `None` when it does not exist.
    pub async fn get(&self, policy: &BasePolicy, key: &Key, bins: Bins) -> Result<Option<Record>> {
        let mut command = ReadCommand::new(policy, key, &bins);
        self.cluster.execute(&mut command).await?;
        Ok(command.into_record())
    }

    /// Reads generation and expiration without bin data.
    pub async fn get_header(&self, policy: &BasePolicy, key: &Key) -> Result<Option<Record>> {
        self.get(policy, key, Bins::None).await
    }

    /// Checks whether the record at `key` exists.
    pub async fn exists(&self, policy: &BasePolicy, key: &Key) -> Result<bool> {
        let mut command = ExistsCommand::new(policy, key);
        self.cluster.execute(&mut command).await?;
        Ok(command.exists())
    }

    /// Resets the record's time to live.
    pub async fn touch(&self, policy: &WritePolicy, key: &Key) -> Result<()> {
        let mut command = TouchCommand::new(policy, key);
        self.cluster.execute(&mut command).await
    }

    /// Deletes the record; returns whether it existed.
    pub async fn delete(&self, policy: &WritePolicy, key: &Key) -> Result<bool> {
        let mut command = DeleteCommand::new(policy, key);
        self.cluster.execute(&mut command).await?;
        Ok(command.existed())
    }

    /// Applies `ops` to one record atomically.
    pub async fn operate(&self, policy: &WritePolicy, key: &Key, ops: &[Operation]) -> Result<Option<Record>> {
        let mut command = OperateCommand::new(policy, key, ops)?;
        self.cluster.execute(&mut command).await?;
        Ok(command.into_record())
    }

    /// Runs a registered UDF on one record and returns its result.
    pub async fn execute_udf(
        &self,
        policy: &WritePolicy,
        key: &Key,
        package: &str,
        function: &str,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let mut command = ExecuteUdfCommand::new(policy, key, package, function, args);
        self.cluster.execute(&mut command).await?;
        Ok(command.into_result())
    }

    /// Reads many records; results follow the order of `keys`.
    pub async fn batch_get(&self, policy: &BatchPolicy, keys: &[Key], bins: Bins) -> Result<Vec<Option<Record>>> {
        command::batch_get(&self.cluster, policy, keys, &bins).await
    }

    /// Checks existence of many records, in key order.
    pub async fn batch_exists(&self, policy: &BatchPolicy, keys: &[Key]) -> Result<Vec<bool>> {
        command::batch_exists(&self.cluster, policy, keys).await
    }

    /// Streams every record of `set_name`, or of the whole namespace when
    /// the set name is empty.
    pub fn scan_all(&self, policy: ScanPolicy, namespace: &str, set_name: &str, bins: Bins) -> Recordset {
        command::scan_all(Arc::clone(&self.cluster), policy, namespace, set_name, bins)
    }

    /// Streams the records matched by `statement`.
    pub fn query(&self, policy: QueryPolicy, statement: Statement) -> Result<Recordset> {
        command::query(Arc::clone(&self.cluster), policy, statement)
    }

    /// Sends info commands to a random node.
    pub async fn request_info<S: AsRef<str>>(&self, commands: &[S]) -> Result<HashMap<String, String>> {
        self.cluster.request_info(commands).await
    }

    /// Stops tending and closes every connection.
    pub async fn close(&self) {
        self.cluster.close().await;
    }
}
