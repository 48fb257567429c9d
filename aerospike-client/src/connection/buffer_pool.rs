//! Shared free list of connection data buffers.

use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;

/// Capacity of a fresh connection buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffers larger than this are dropped instead of being recycled.
const MAX_RECYCLED_SIZE: usize = 1024 * 1024;

/// Free list of buffers handed to connections and returned on close.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_free: usize,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool keeping at most `max_free` idle buffers.
    pub fn new(max_free: usize) -> Self {
        Self::with_buffer_size(max_free, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a pool whose fresh buffers have the given capacity.
    pub fn with_buffer_size(max_free: usize, buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_free,
            buffer_size,
        }
    }

    /// Takes a cleared buffer, allocating when the free list is empty.
    pub fn take(&self) -> BytesMut {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        recycled.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Returns a buffer to the free list.
    pub fn give(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RECYCLED_SIZE {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_free {
            free.push(buf);
        }
    }

    /// Returns the number of idle buffers.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256)
    }
}
