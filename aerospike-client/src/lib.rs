//! Async Rust client for [Aerospike](https://aerospike.com/), the distributed key-value database.
//!
//! The client discovers the cluster from one or more seed hosts, keeps a
//! partition map current by tending every node in the background, and routes
//! each command straight to the node that owns its key. Every operation is an
//! `async fn` built on [Tokio](https://tokio.rs/).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use aerospike_client::{Bin, Bins, Client, ClientPolicy, Host, Key, WritePolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let policy = ClientPolicy::builder().build()?;
//!     let client = Client::new(policy, vec![Host::new("127.0.0.1", 3000)]).await?;
//!
//!     let key = Key::new("test", "users", "alice")?;
//!     client.put(&WritePolicy::default(), &key, &[Bin::new("age", 31)]).await?;
//!
//!     let record = client.get(&Default::default(), &key, Bins::All).await?;
//!     println!("{:?}", record.and_then(|r| r.bin("age").cloned()));
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Commands
//!
//! | Operation | Method |
//! |-----------|--------|
//! | Write, append, prepend, add | [`Client::put`], [`Client::append`], [`Client::prepend`], [`Client::add`] |
//! | Read | [`Client::get`], [`Client::get_header`], [`Client::exists`] |
//! | Touch, delete | [`Client::touch`], [`Client::delete`] |
//! | Multi-op | [`Client::operate`] |
//! | UDF | [`Client::execute_udf`] |
//! | Batch | [`Client::batch_get`], [`Client::batch_exists`] |
//! | Streaming | [`Client::scan_all`], [`Client::query`] return a [`Recordset`] |
//!
//! # Feature Flags
//!
//! | Flag | Purpose |
//! |------|---------|
//! | `tls` | TLS connections via `rustls` |
//! | `config-file` | Load [`ClientPolicy`] from YAML or TOML |

#![warn(missing_docs)]

mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod config_file;
pub mod connection;
pub mod policy;
pub mod security;

pub use aerospike_core as core;
pub use aerospike_core::{
    Bin, CdtContext, Error, ExpType, Expression, Key, Operation, OperationType, Record, Result,
    ResultCode, ReturnType, Value,
};
pub use client::Client;
pub use cluster::{Cluster, Host, Node, NodeValidator, Partition, PartitionMap};
pub use command::{Aggregate, Bins, Filter, IndexCollectionType, Recordset, Statement};
pub use config::{AuthMode, ClientPolicy, ClientPolicyBuilder, ConfigError, TlsPolicy, TlsPolicyBuilder};
pub use config_file::FileConfig;
pub use connection::{Connection, ConnectionPool};
pub use policy::{
    AdminPolicy, BasePolicy, BatchPolicy, CommitLevel, Expiration, GenerationPolicy, InfoPolicy,
    QueryPolicy, ReadModeAP, ReadModeSC, ReadPolicy, RecordExistsAction, Replica, ScanPolicy,
    WritePolicy,
};
pub use security::{hash_password, Credentials};
