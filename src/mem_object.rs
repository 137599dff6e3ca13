//! The buffered representation of a cache entry's bytes.

use crate::disk::IoState;
use crate::page::MemNode;
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Memoized swap-out admission decision.
///
/// `Undecided` means the checks may be repeated as more information
/// arrives; `Possible` and `Impossible` are final for the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapDecision {
    /// Not enough information yet; ask again later.
    #[default]
    Undecided,
    /// Swap-out is allowed.
    Possible,
    /// Swap-out will never happen for this entry.
    Impossible,
}

/// Swap-out progress attached to a [`MemObject`].
#[derive(Default)]
pub(crate) struct SwapOutState {
    /// Bytes already handed to the disk I/O session.
    pub queue_offset: u64,
    /// The open disk I/O session, if any.
    pub sio: Option<Rc<RefCell<IoState>>>,
    /// Memoized admission decision.
    pub decision: SwapDecision,
}

/// The in-memory bytes of one cache entry, as a run of fixed-size pages.
///
/// Pages cover the contiguous range `[inmem_lo, end_offset)`. The low-water
/// mark rises when pages are trimmed (their bytes are on disk and no reader
/// still needs them); the high-water mark rises as the producer appends.
pub struct MemObject {
    page_size: usize,
    nodes: VecDeque<MemNode>,
    inmem_lo: u64,
    end_off: u64,
    /// Final object size, known once the producer completes.
    pub(crate) object_size: Option<u64>,
    /// Producer's size estimate (Content-Length analog), if any.
    pub(crate) expected_size: Option<u64>,
    /// Length of the serialized metadata header on disk.
    pub(crate) swap_hdr_sz: u64,
    pub(crate) swapout: SwapOutState,
}

impl MemObject {
    /// Create an empty object buffering in pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0);
        Self {
            page_size,
            nodes: VecDeque::new(),
            inmem_lo: 0,
            end_off: 0,
            object_size: None,
            expected_size: None,
            swap_hdr_sz: 0,
            swapout: SwapOutState::default(),
        }
    }

    /// Rebuild a complete object from its body bytes (memory tier hits,
    /// disk read-backs).
    pub fn from_bytes(body: &[u8], page_size: usize) -> Self {
        let mut mem = Self::new(page_size);
        mem.append(body);
        mem.object_size = Some(body.len() as u64);
        mem
    }

    /// Append producer bytes at the high-water mark.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let need_node = match self.nodes.back() {
                Some(node) => node.is_full(),
                None => true,
            };
            if need_node {
                self.nodes.push_back(MemNode::new(self.end_off, self.page_size));
            }
            let node = self.nodes.back_mut().unwrap();
            let taken = node.append(data);
            self.end_off += taken as u64;
            data = &data[taken..];
        }
    }

    /// Append producer bytes at `offset`, which may lie beyond the
    /// high-water mark (out-of-order arrival, e.g. range fills). Bytes
    /// between the old high-water mark and `offset` stay missing, leaving
    /// the buffered range non-contiguous until they arrive.
    pub fn append_at(&mut self, offset: u64, data: &[u8]) {
        if offset == self.end_off {
            self.append(data);
            return;
        }
        assert!(offset > self.end_off, "overlapping write");
        self.nodes.push_back(MemNode::new(offset, self.page_size));
        self.end_off = offset;
        self.append(data);
    }

    /// The page size in use.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// High-water mark: bytes received so far.
    pub fn end_offset(&self) -> u64 {
        self.end_off
    }

    /// Low-water mark: earliest byte still buffered.
    pub fn inmem_lo(&self) -> u64 {
        self.inmem_lo
    }

    /// Swap-out cursor: bytes already handed to the disk session.
    pub fn swap_out_cursor(&self) -> u64 {
        self.swapout.queue_offset
    }

    /// The memoized admission decision.
    pub fn swap_decision(&self) -> SwapDecision {
        self.swapout.decision
    }

    /// Buffered bytes not yet handed to the disk session.
    pub fn available_for_swap_out(&self) -> u64 {
        debug_assert!(self.swapout.queue_offset <= self.end_off);
        self.end_off - self.swapout.queue_offset
    }

    /// Whether the buffered range has no gaps.
    ///
    /// Appends cannot create gaps, but trimming moves the low-water mark;
    /// a gap here means bytes below the swap-out start are already gone.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = self.inmem_lo;
        for node in &self.nodes {
            if node.start() != expected {
                return false;
            }
            expected = node.end();
        }
        expected == self.end_off
    }

    /// The node containing `offset`, if still buffered.
    pub(crate) fn node_containing(&self, offset: u64) -> Option<&MemNode> {
        self.nodes
            .iter()
            .find(|n| n.start() <= offset && offset < n.end())
    }

    /// Drop whole pages below `offset`, raising the low-water mark.
    pub(crate) fn trim_to(&mut self, offset: u64) {
        while let Some(front) = self.nodes.front() {
            if front.is_empty() || front.end() > offset {
                break;
            }
            let node = self.nodes.pop_front().unwrap();
            self.inmem_lo = node.end();
        }
    }

    /// Copy the full body out, if every byte is still buffered.
    pub fn to_bytes(&self) -> Option<Bytes> {
        if self.inmem_lo != 0 || !self.is_contiguous() {
            return None;
        }
        let mut out = BytesMut::with_capacity(self.end_off as usize);
        for node in &self.nodes {
            out.extend_from_slice(node.data());
        }
        Some(out.freeze())
    }
}
