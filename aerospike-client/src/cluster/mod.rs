//! Cluster discovery, node management and partition routing.

#[allow(clippy::module_inception)]
mod cluster;
mod context;
mod host;
mod node;
mod node_validator;
mod partition;
mod peers;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::Cluster;
pub use context::{ClusterContext, OpeningPermit};
pub use host::Host;
pub use node::{Features, Node, NodeInfo};
pub use node_validator::NodeValidator;
pub use partition::{Partition, PartitionMap, Partitions, Router};
pub use peers::{parse_peers, Peer, PeerList, Peers};
