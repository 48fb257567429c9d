//! Bucketed pool of idle connections for one node.
//!
//! Commands pass a one-byte hint that picks the starting bucket, so
//! concurrent callers mostly contend on different locks. Each bucket is a
//! LIFO stack: the most recently used connection is handed out first and the
//! oldest ones drift to the back where idle pruning finds them.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use super::connection::Connection;

/// Idle connection pool with a fixed total capacity.
#[derive(Debug)]
pub struct ConnectionPool {
    buckets: Vec<Mutex<VecDeque<Connection>>>,
    bucket_capacity: usize,
}

impl ConnectionPool {
    /// Creates a pool holding up to `capacity` idle connections, split into
    /// one bucket per available core.
    pub fn new(capacity: usize) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_buckets(capacity, cores)
    }

    /// Creates a pool with an explicit bucket count.
    pub fn with_buckets(capacity: usize, buckets: usize) -> Self {
        let capacity = capacity.max(1);
        let buckets = buckets.clamp(1, capacity);
        let bucket_capacity = capacity.div_ceil(buckets);
        Self {
            buckets: (0..buckets)
                .map(|_| Mutex::new(VecDeque::with_capacity(bucket_capacity)))
                .collect(),
            bucket_capacity,
        }
    }

    fn bucket(&self, index: usize) -> std::sync::MutexGuard<'_, VecDeque<Connection>> {
        self.buckets[index % self.buckets.len()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the most recently used connection, starting at the hinted bucket.
    pub fn poll(&self, hint: u8) -> Option<Connection> {
        let start = hint as usize;
        (0..self.buckets.len()).find_map(|i| self.bucket(start + i).pop_front())
    }

    /// Returns a connection to the pool.
    ///
    /// Hands the connection back when every bucket is full so the caller
    /// can close it.
    pub fn offer(&self, conn: Connection, hint: u8) -> Result<(), Connection> {
        let start = hint as usize;
        for i in 0..self.buckets.len() {
            let mut bucket = self.bucket(start + i);
            if bucket.len() < self.bucket_capacity {
                bucket.push_front(conn);
                return Ok(());
            }
        }
        Err(conn)
    }

    /// Removes connections past their idle deadline and returns them.
    pub fn drop_idle(&self) -> Vec<Connection> {
        let mut dropped = Vec::new();
        for i in 0..self.buckets.len() {
            let mut bucket = self.bucket(i);
            while bucket.back().is_some_and(|c| c.is_idle() || !c.is_connected()) {
                if let Some(conn) = bucket.pop_back() {
                    dropped.push(conn);
                }
            }
        }
        dropped
    }

    /// Empties the pool.
    pub fn drain(&self) -> Vec<Connection> {
        let mut all = Vec::new();
        for i in 0..self.buckets.len() {
            all.extend(self.bucket(i).drain(..));
        }
        all
    }

    /// Returns the number of idle connections.
    pub fn len(&self) -> usize {
        (0..self.buckets.len()).map(|i| self.bucket(i).len()).sum()
    }

    /// Returns true when no connection is pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.bucket_capacity * self.buckets.len()
    }
}
