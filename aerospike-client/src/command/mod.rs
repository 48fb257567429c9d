//! Commands: request encoding, reply decoding and the retry loop.
//!
//! Every command implements [`Command`] and is driven by [`execute`]. Scans
//! and queries stream records through a [`Recordset`].

pub mod buffer;
#[allow(clippy::module_inception)]
mod command;
mod batch;
mod operate;
mod query;
mod read;
mod recordset;
mod scan;
mod write;

pub use batch::{batch_exists, batch_get, BatchExistsCommand, BatchNode, BatchReadCommand};
pub use command::{execute, Command};
pub use operate::{ExecuteUdfCommand, OperateCommand};
pub use query::{query, Aggregate, Filter, IndexCollectionType, QueryCommand, Statement};
pub use read::{ExistsCommand, ReadCommand};
pub use recordset::Recordset;
pub use scan::{scan_all, NodePartitions, PartitionStatus, PartitionTracker, ScanCommand};
pub use write::{DeleteCommand, TouchCommand, WriteCommand};

/// Which bins a read returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Bins {
    /// Every bin.
    #[default]
    All,
    /// Metadata only: generation and expiration.
    None,
    /// The named bins.
    Some(Vec<String>),
}

impl Bins {
    /// Bin names to request, empty for `All` and `None`.
    pub fn names(&self) -> &[String] {
        match self {
            Bins::Some(names) => names,
            _ => &[],
        }
    }
}

impl From<&[&str]> for Bins {
    fn from(names: &[&str]) -> Self {
        Bins::Some(names.iter().map(|n| n.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Bins {
    fn from(names: [&str; N]) -> Self {
        Bins::Some(names.iter().map(|n| n.to_string()).collect())
    }
}

impl From<Vec<String>> for Bins {
    fn from(names: Vec<String>) -> Self {
        Bins::Some(names)
    }
}
