//! Fixed-size buffer pages.
//!
//! A [`MemNode`] holds one page worth of a buffered object. Pages fill
//! sequentially: the producer appends into the last node until it reaches
//! capacity, then a new node is started. A node's byte range never moves
//! once created, which is what lets the swap-out driver write whole pages
//! at page-aligned file offsets.

use bytes::{Bytes, BytesMut};

/// Default page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// One page of buffered object data.
#[derive(Debug)]
pub struct MemNode {
    start: u64,
    buf: BytesMut,
    capacity: usize,
}

impl MemNode {
    /// Create an empty node covering bytes starting at `start`.
    pub fn new(start: u64, capacity: usize) -> Self {
        Self {
            start,
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Append up to the remaining capacity from `data`, returning how many
    /// bytes were taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.capacity - self.buf.len());
        self.buf.extend_from_slice(&data[..take]);
        take
    }

    /// First byte offset covered by this node.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last byte currently held.
    pub fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the node holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the node has reached its capacity.
    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    /// An owned copy of the node's bytes, for handing to the disk layer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// The node's bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }
}
