//! Pooled buffers and their owner handles.
//!
//! * `GeneBufMut` is the exclusive, writable phase of a rented buffer. It implements `BufMut`
//!    so frames can be serialized into it directly.
//! * `GeneOwner` is the frozen, shareable phase. Sharing increments a reference count, and
//!    the buffer goes back to the pool when the last owner is dropped. The contents can not be
//!    modified any more once a buffer is frozen.

use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use bytes::buf::UninitSlice;
use bytes::Bytes;
use crate::buffers::gene_pool::GenePool;

pub struct PooledBlock {
    data: Vec<u8>,
    len: usize,
    class_idx: Option<usize>,
    pool: Arc<GenePool>,
}

impl PooledBlock {
    pub(crate) fn new(data: Vec<u8>, class_idx: Option<usize>, pool: Arc<GenePool>) -> PooledBlock {
        PooledBlock {
            data,
            len: 0,
            class_idx,
            pool,
        }
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        self.pool.return_to_pool(std::mem::take(&mut self.data), self.class_idx);
    }
}

pub struct GeneBufMut(PooledBlock);

impl GeneBufMut {
    pub(crate) fn new(block: PooledBlock) -> GeneBufMut {
        GeneBufMut(block)
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.0.data.len()
    }

    /// The entire underlying buffer, for receiving a datagram into it
    pub fn as_full_mut(&mut self) -> &mut [u8] {
        &mut self.0.data
    }

    /// Sets the number of valid bytes after data was written through `as_full_mut()`
    pub fn set_filled(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.0.len = len;
    }

    /// Makes the buffer immutable and shareable
    pub fn freeze(self) -> GeneOwner {
        GeneOwner(Arc::new(self.0))
    }
}

impl AsRef<[u8]> for GeneBufMut {
    fn as_ref(&self) -> &[u8] {
        &self.0.data[..self.0.len]
    }
}

impl AsMut<[u8]> for GeneBufMut {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0.data[..self.0.len]
    }
}

impl Debug for GeneBufMut {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

unsafe impl bytes::BufMut for GeneBufMut {
    fn remaining_mut(&self) -> usize {
        self.0.data.len() - self.0.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.0.len + cnt <= self.0.data.len());
        self.0.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.0.data[self.0.len..])
    }
}

/// A shared, immutable pooled buffer
#[derive(Clone)]
pub struct GeneOwner(Arc<PooledBlock>);

impl GeneOwner {
    pub fn share(&self) -> GeneOwner {
        self.clone()
    }

    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// A zero-copy `Bytes` view of part of the buffer that keeps the buffer rented while it is
    ///  alive
    pub fn to_bytes(&self, offset: usize) -> Bytes {
        Bytes::from_owner(self.share()).slice(offset..)
    }
}

impl Deref for GeneOwner {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0.data[..self.0.len]
    }
}

impl AsRef<[u8]> for GeneOwner {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Debug for GeneOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}
