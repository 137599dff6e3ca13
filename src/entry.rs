//! Cache entries.
//!
//! A [`StoreEntry`] is one cached response, possibly still arriving. The
//! producer appends bytes and eventually marks the entry complete or
//! aborted; the swap-out driver moves the bytes to disk; readers attach as
//! clients. Entries are shared as [`EntryRef`] and referenced weakly from
//! I/O callbacks, which check reachability before touching them.

use crate::disk::SwapLocation;
use crate::key::StoreKey;
use crate::mem_object::MemObject;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Shared handle to a cache entry.
pub type EntryRef = Rc<RefCell<StoreEntry>>;

/// Disk persistence state of an entry.
///
/// Transitions only follow `None → Writing → {Done, None}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapStatus {
    /// Not on disk and not being written.
    #[default]
    None,
    /// A disk session is open and owned exclusively by this entry.
    Writing,
    /// The object is durable on disk; size and location are fixed.
    Done,
}

/// Whether the producer is still appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreStatus {
    /// More data may arrive.
    #[default]
    Pending,
    /// The producer has finished (or the entry was aborted).
    Ok,
}

/// What a reader needs from the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Served from the in-memory pages.
    Mem,
    /// Requires disk-resident data (memory was already trimmed).
    Disk,
}

/// One attached reader.
#[derive(Debug)]
struct StoreClient {
    kind: ClientKind,
    copy_offset: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct EntryFlags {
    special: bool,
    release_requested: bool,
    aborted: bool,
}

/// One cached response (or in-flight fetch).
pub struct StoreEntry {
    key: StoreKey,
    pub(crate) mem: MemObject,
    pub(crate) swap_status: SwapStatus,
    store_status: StoreStatus,
    flags: EntryFlags,
    cacheable: bool,
    swap: Option<SwapLocation>,
    pub(crate) swap_file_sz: u64,
    clients: Vec<StoreClient>,
}

impl StoreEntry {
    /// Create an empty entry for a response that is starting to arrive.
    pub fn new(key: StoreKey, page_size: usize) -> Self {
        Self {
            key,
            mem: MemObject::new(page_size),
            swap_status: SwapStatus::None,
            store_status: StoreStatus::Pending,
            flags: EntryFlags::default(),
            cacheable: true,
            swap: None,
            swap_file_sz: 0,
            clients: Vec::new(),
        }
    }

    /// Rebuild a complete entry from body bytes (memory tier hit or disk
    /// read-back).
    pub fn from_cached(key: StoreKey, body: &[u8], page_size: usize) -> Self {
        let mut entry = Self::new(key, page_size);
        entry.mem = MemObject::from_bytes(body, page_size);
        entry.store_status = StoreStatus::Ok;
        entry
    }

    /// The entry's content key.
    pub fn key(&self) -> StoreKey {
        self.key
    }

    /// The buffered object.
    pub fn mem(&self) -> &MemObject {
        &self.mem
    }

    /// Disk persistence state.
    pub fn swap_status(&self) -> SwapStatus {
        self.swap_status
    }

    /// Producer state.
    pub fn store_status(&self) -> StoreStatus {
        self.store_status
    }

    /// Whether a disk session is currently writing this entry.
    pub fn swapping_out(&self) -> bool {
        self.swap_status == SwapStatus::Writing
    }

    /// Assigned disk location, if any.
    pub fn swap_location(&self) -> Option<SwapLocation> {
        self.swap
    }

    /// Total on-disk size (header + body) once committed.
    pub fn swap_file_sz(&self) -> u64 {
        self.swap_file_sz
    }

    pub(crate) fn set_swap_location(&mut self, location: SwapLocation) {
        assert!(self.swap.is_none(), "disk location is write-once");
        self.swap = Some(location);
    }

    pub(crate) fn clear_swap_location(&mut self) {
        self.swap = None;
    }

    /// Whether the protocol layer considers the response cacheable.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable && !self.flags.release_requested && !self.flags.aborted
    }

    /// Record the protocol layer's cacheability verdict.
    pub fn set_cacheable(&mut self, cacheable: bool) {
        self.cacheable = cacheable;
    }

    /// Whether the entry is special (never persisted).
    pub fn is_special(&self) -> bool {
        self.flags.special
    }

    /// Mark the entry special.
    pub fn set_special(&mut self) {
        self.flags.special = true;
    }

    /// Whether the entry has been marked for release.
    pub fn release_requested(&self) -> bool {
        self.flags.release_requested
    }

    /// Mark the entry for release: it will not be cached further.
    pub fn request_release(&mut self) {
        self.flags.release_requested = true;
    }

    /// Whether the producer aborted the entry.
    pub fn is_aborted(&self) -> bool {
        self.flags.aborted
    }

    /// Record the producer's size estimate (Content-Length analog).
    pub fn set_expected_size(&mut self, size: Option<u64>) {
        self.mem.expected_size = size;
    }

    /// Final object length, once known.
    pub fn object_len(&self) -> Option<u64> {
        self.mem.object_size
    }

    /// Best known final size: the actual length once complete, else the
    /// producer's estimate.
    pub(crate) fn expected_end(&self) -> Option<u64> {
        self.mem.object_size.or(self.mem.expected_size)
    }

    /// Append producer bytes.
    pub fn append(&mut self, data: &[u8]) {
        assert!(
            self.store_status == StoreStatus::Pending && !self.flags.aborted,
            "append to a finished entry"
        );
        self.mem.append(data);
    }

    /// Producer finished: fix the object size.
    pub fn complete(&mut self) {
        assert!(!self.flags.aborted);
        self.store_status = StoreStatus::Ok;
        self.mem.object_size = Some(self.mem.end_offset());
    }

    /// Producer gave up. Any open disk session is closed as a rollback;
    /// no further swap-out progress will be made.
    pub fn abort(&mut self) {
        if self.flags.aborted {
            return;
        }
        debug!(key = %self.key, "entry aborted");
        self.flags.aborted = true;
        self.flags.release_requested = true;
        self.store_status = StoreStatus::Ok;
        crate::swapout::swap_out_file_close(self, crate::swapout::CloseMode::WriterGone);
    }

    /// Attach a reader; returns its client id.
    pub fn add_client(&mut self, kind: ClientKind) -> usize {
        self.clients.push(StoreClient {
            kind,
            copy_offset: 0,
        });
        self.clients.len() - 1
    }

    /// Record how far a reader has consumed.
    pub fn set_client_offset(&mut self, client: usize, offset: u64) {
        self.clients[client].copy_offset = offset;
    }

    /// Number of attached readers.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether any reader specifically requires disk-resident data.
    pub fn has_disk_client(&self) -> bool {
        self.clients.iter().any(|c| c.kind == ClientKind::Disk)
    }

    /// Earliest byte any attached reader still needs. With no readers,
    /// everything received so far is fair game for trimming.
    pub(crate) fn lowest_reader_offset(&self) -> u64 {
        self.clients
            .iter()
            .map(|c| c.copy_offset)
            .min()
            .unwrap_or_else(|| self.mem.end_offset())
    }

    /// Bytes confirmed on disk for this entry (excluding the metadata
    /// header).
    pub(crate) fn object_bytes_on_disk(&self) -> u64 {
        match &self.mem.swapout.sio {
            Some(sio) => sio.borrow().offset().saturating_sub(self.mem.swap_hdr_sz),
            None => 0,
        }
    }

    /// Drop buffered pages no reader needs. While a swap-out may still
    /// happen, only bytes already confirmed on disk are dropped.
    pub(crate) fn trim(&mut self, preserve_swappable: bool) {
        let lowest = self.lowest_reader_offset();
        let to = if preserve_swappable {
            lowest.min(self.object_bytes_on_disk())
        } else {
            lowest
        };
        if to > self.mem.inmem_lo() {
            self.mem.trim_to(to);
        }
    }

    /// Wrap the entry for sharing.
    pub fn into_ref(self) -> EntryRef {
        Rc::new(RefCell::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> StoreEntry {
        StoreEntry::new(StoreKey::for_request("GET", "http://example.com/"), 4096)
    }

    #[test]
    fn test_new_entry_state() {
        let e = entry();
        assert_eq!(e.swap_status(), SwapStatus::None);
        assert_eq!(e.store_status(), StoreStatus::Pending);
        assert!(e.is_cacheable());
        assert!(!e.is_special());
        assert_eq!(e.client_count(), 0);
    }

    #[test]
    fn test_complete_fixes_object_size() {
        let mut e = entry();
        e.append(b"hello");
        assert_eq!(e.object_len(), None);
        e.complete();
        assert_eq!(e.store_status(), StoreStatus::Ok);
        assert_eq!(e.object_len(), Some(5));
    }

    #[test]
    #[should_panic(expected = "append to a finished entry")]
    fn test_append_after_complete_is_rejected() {
        let mut e = entry();
        e.complete();
        e.append(b"late");
    }

    #[test]
    fn test_abort_is_terminal_and_uncacheable() {
        let mut e = entry();
        e.append(b"partial");
        e.abort();
        assert!(e.is_aborted());
        assert!(e.release_requested());
        assert!(!e.is_cacheable());
        assert_eq!(e.store_status(), StoreStatus::Ok);
        // abort again is a no-op
        e.abort();
    }

    #[test]
    fn test_expected_end_prefers_actual_size() {
        let mut e = entry();
        e.set_expected_size(Some(100));
        assert_eq!(e.expected_end(), Some(100));
        e.append(b"abc");
        e.complete();
        assert_eq!(e.expected_end(), Some(3));
    }

    #[test]
    fn test_clients_and_lowest_offset() {
        let mut e = entry();
        e.append(b"0123456789");
        assert_eq!(e.lowest_reader_offset(), 10);

        let a = e.add_client(ClientKind::Mem);
        let b = e.add_client(ClientKind::Disk);
        assert!(e.has_disk_client());
        e.set_client_offset(a, 8);
        e.set_client_offset(b, 3);
        assert_eq!(e.lowest_reader_offset(), 3);
    }

    #[test]
    fn test_swap_location_write_once() {
        let mut e = entry();
        e.set_swap_location(SwapLocation { dirn: 0, filen: 7 });
        assert_eq!(e.swap_location(), Some(SwapLocation { dirn: 0, filen: 7 }));
    }

    #[test]
    #[should_panic(expected = "write-once")]
    fn test_swap_location_reassignment_panics() {
        let mut e = entry();
        e.set_swap_location(SwapLocation { dirn: 0, filen: 7 });
        e.set_swap_location(SwapLocation { dirn: 0, filen: 8 });
    }
}
