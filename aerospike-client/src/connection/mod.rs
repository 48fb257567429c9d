//! Node connections, the per-node pool and the shared buffer free list.

pub mod buffer_pool;
mod connection;
pub mod pool;

pub use buffer_pool::BufferPool;
pub use connection::{ConnectOptions, Connection, ConnectionId};
pub use pool::ConnectionPool;
