//! Pooled frame buffers.
//!
//! Links read and build frames at a high rate; the pool recycles the backing
//! allocations instead of hitting the allocator per frame. Buffers are
//! shelved by size because each link sizes its buffers to the expected
//! maximum frame of its transport.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Buffers kept per size class; anything beyond this is dropped.
const MAX_SHELF: usize = 32;

/// A concurrent pool of fixed-size byte buffers.
#[derive(Debug, Default)]
pub struct FramePool {
    shelves: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
}

impl FramePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get a zero-initialized buffer of exactly `size` bytes. The buffer
    /// returns to the pool when the [`PooledBuf`] is dropped.
    pub fn get(self: &Arc<Self>, size: usize) -> PooledBuf {
        let recycled = self.shelves.lock().get_mut(&size).and_then(Vec::pop);
        let data = match recycled {
            Some(mut buf) => {
                buf.iter_mut().for_each(|b| *b = 0);
                buf
            }
            None => vec![0u8; size],
        };
        PooledBuf {
            data,
            pool: Arc::downgrade(self),
        }
    }

    fn put(&self, data: Vec<u8>) {
        let mut shelves = self.shelves.lock();
        let shelf = shelves.entry(data.len()).or_default();
        if shelf.len() < MAX_SHELF {
            shelf.push(data);
        }
    }

    #[cfg(test)]
    fn shelved(&self, size: usize) -> usize {
        self.shelves.lock().get(&size).map_or(0, Vec::len)
    }
}

/// A buffer on loan from a [`FramePool`]. Ownership is linear: whoever holds
/// the buffer last drops it, which hands it back to the pool.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Weak<FramePool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.put(std::mem::take(&mut self.data));
        }
    }
}
