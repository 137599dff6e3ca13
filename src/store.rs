//! The store root: the service tying the tiers together.
//!
//! A [`Store`] owns the I/O scheduler, the swap directories, the memory
//! cache tier, the index of in-transit entries, and the disk index. It is
//! constructed explicitly (no process-wide singletons) and handed out as
//! an `Rc` because disk completions reference it weakly.

use crate::config::Config;
use crate::disk::{CloseCallback, IoScheduler, IoState, SwapDir, SwapLocation};
use crate::entry::{EntryRef, StoreEntry};
use crate::error::{StoreError, StoreResult};
use crate::key::StoreKey;
use crate::mem_store::MemStore;
use crate::metrics::{MEM_HITS, MEM_MISSES};
use crate::swapin::{LookupCallback, SwapIn};
use crate::swapout;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// What the disk index knows about a committed object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DiskEntry {
    pub location: SwapLocation,
    pub swap_file_sz: u64,
}

/// The storage engine root.
pub struct Store {
    page_size: usize,
    max_object_size: Option<u64>,
    scheduler: Rc<IoScheduler>,
    dirs: Vec<SwapDir>,
    mem: RefCell<MemStore>,
    /// Entries still being produced (or awaiting their swap-out).
    transients: RefCell<HashMap<StoreKey, EntryRef, ahash::RandomState>>,
    /// Committed objects: key → disk location and size.
    disk_index: RefCell<HashMap<StoreKey, DiskEntry, ahash::RandomState>>,
    /// In-flight disk lookups, kept alive until they deliver.
    lookups: RefCell<Vec<Rc<RefCell<SwapIn>>>>,
}

impl Store {
    /// Build a store from configuration, creating swap directories on
    /// disk and replaying their logs when recovery is enabled.
    pub fn new(config: Config) -> StoreResult<Rc<Self>> {
        let mut dirs = Vec::with_capacity(config.swap_dirs.len());
        for (index, dir_config) in config.swap_dirs.iter().enumerate() {
            let dir = SwapDir::new(index, dir_config).map_err(|e| {
                warn!(path = %dir_config.path.display(), error = %e, "swap dir setup failed");
                StoreError::DiskError
            })?;
            dirs.push(dir);
        }

        let store = Rc::new(Self {
            page_size: config.store.page_size,
            max_object_size: config.max_object_size(),
            scheduler: Rc::new(IoScheduler::new()),
            dirs,
            mem: RefCell::new(MemStore::new(&config.mem_cache)),
            transients: RefCell::new(HashMap::default()),
            disk_index: RefCell::new(HashMap::default()),
            lookups: RefCell::new(Vec::new()),
        });

        for (index, dir_config) in config.swap_dirs.iter().enumerate() {
            if dir_config.recover_on_startup {
                store.recover_dir(index)?;
            }
        }
        Ok(store)
    }

    fn recover_dir(&self, dirn: usize) -> StoreResult<()> {
        let live = self.dirs[dirn].recover()?;
        let mut index = self.disk_index.borrow_mut();
        let count = live.len();
        for (key, filen, swap_file_sz) in live {
            index.insert(
                key,
                DiskEntry {
                    location: SwapLocation { dirn, filen },
                    swap_file_sz,
                },
            );
        }
        if count > 0 {
            info!(dirn, objects = count, "recovered disk index");
        }
        Ok(())
    }

    /// The scheduler driving this store's disk I/O. The owning event loop
    /// calls `run()` (or `step()`) to dispatch completions.
    pub fn scheduler(&self) -> &Rc<IoScheduler> {
        &self.scheduler
    }

    /// Dispatch all pending disk completions. Returns the number run.
    pub fn run_io(&self) -> usize {
        self.scheduler.run()
    }

    /// The configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether any swap directory is configured.
    pub fn has_swap_dirs(&self) -> bool {
        !self.dirs.is_empty()
    }

    /// The store-level maximum object size, if every directory has one.
    pub fn max_object_size(&self) -> Option<u64> {
        self.max_object_size
    }

    pub(crate) fn dir(&self, dirn: usize) -> &SwapDir {
        &self.dirs[dirn]
    }

    /// Create an entry for a response that is starting to arrive.
    pub fn create_entry(&self, key: StoreKey) -> EntryRef {
        let entry = StoreEntry::new(key, self.page_size).into_ref();
        self.transients.borrow_mut().insert(key, entry.clone());
        entry
    }

    /// Producer pushed bytes; buffer them and advance disk writing.
    pub fn append(self: &Rc<Self>, entry: &EntryRef, data: &[u8]) {
        entry.borrow_mut().append(data);
        swapout::swap_out(self, entry);
    }

    /// Producer finished; finalize buffering and disk writing.
    pub fn complete(self: &Rc<Self>, entry: &EntryRef) {
        entry.borrow_mut().complete();
        swapout::swap_out(self, entry);
    }

    /// Producer gave up; roll back any disk writing and drop the entry
    /// from every index so later lookups miss.
    pub fn abort(&self, entry: &EntryRef) {
        entry.borrow_mut().abort();
        self.release(entry);
    }

    /// Advance disk writing opportunistically. Invoked by `append` and
    /// `complete`; also safe to call at any time.
    pub fn swap_out(self: &Rc<Self>, entry: &EntryRef) {
        swapout::swap_out(self, entry);
    }

    /// Synchronous lookup: in-transit entries first, then the memory
    /// tier. Returns None on miss; see [`swap_in`](Self::swap_in) for the
    /// disk fallthrough.
    pub fn get(&self, key: &StoreKey) -> Option<EntryRef> {
        if let Some(entry) = self.transients.borrow().get(key) {
            MEM_HITS.increment();
            return Some(entry.clone());
        }
        if let Some(body) = self.mem.borrow_mut().get(key) {
            MEM_HITS.increment();
            debug!(key = %key, "memory tier hit");
            let entry = StoreEntry::from_cached(*key, &body, self.page_size);
            return Some(entry.into_ref());
        }
        MEM_MISSES.increment();
        None
    }

    /// Asynchronous disk-backed lookup. The callback receives the
    /// reconstructed entry, `NotFound` if the key has no committed
    /// object, or the error that broke the read-back.
    pub fn swap_in(self: &Rc<Self>, key: StoreKey, callback: LookupCallback) {
        let disk_entry = self.disk_index.borrow().get(&key).copied();
        match disk_entry {
            Some(de) => SwapIn::start(self, key, de.location, de.swap_file_sz, callback),
            None => callback(Err(StoreError::NotFound)),
        }
    }

    /// Whether the disk index has a committed object for `key`.
    pub fn has_on_disk(&self, key: &StoreKey) -> bool {
        self.disk_index.borrow().contains_key(key)
    }

    /// Whether the memory tier currently holds `key`.
    pub fn mem_cached(&self, key: &StoreKey) -> bool {
        self.mem.borrow().contains(key)
    }

    /// Offer a (complete) entry to the memory tier.
    pub fn consider_keeping(&self, entry: &EntryRef) -> bool {
        let kept = self.mem.borrow_mut().consider_keeping(&entry.borrow());
        if kept {
            crate::metrics::MEM_KEEPS.increment();
        }
        kept
    }

    /// Drop the entry from every tier: the in-transit index, the memory
    /// tier, and (for committed objects) the disk.
    pub fn release(&self, entry: &EntryRef) {
        let mut e = entry.borrow_mut();
        e.request_release();
        let key = e.key();
        self.transients.borrow_mut().remove(&key);
        self.mem.borrow_mut().remove(&key);
        if e.swap_status() == crate::entry::SwapStatus::Done
            && let Some(location) = e.swap_location()
        {
            debug!(key = %key, dirn = location.dirn, filen = location.filen, "release from disk");
            self.disk_index.borrow_mut().remove(&key);
            self.dirs[location.dirn].log_remove(key, location.filen);
            self.dirs[location.dirn].release_slot(location.filen);
        }
    }

    /// Forget an in-transit entry once its producers and readers are done
    /// with it. Declined while a swap-out is still pending, since the
    /// entry owns the open disk session. Committed bytes stay reachable
    /// through the disk index and the memory tier.
    pub fn forget_transient(&self, key: &StoreKey) {
        let mut transients = self.transients.borrow_mut();
        if let Some(entry) = transients.get(key)
            && entry.borrow().swapping_out()
        {
            return;
        }
        transients.remove(key);
    }

    /// Pick a directory and start a write session. Tried in order; full
    /// directories and directories out of slots are skipped.
    pub(crate) fn create_session(
        &self,
        callback: CloseCallback,
    ) -> StoreResult<(SwapLocation, Rc<RefCell<IoState>>)> {
        for dir in &self.dirs {
            if dir.is_full() || dir.free_slots() == 0 {
                continue;
            }
            let (filen, sio) = dir.create_io(&self.scheduler, callback)?;
            return Ok((
                SwapLocation {
                    dirn: dir.index(),
                    filen,
                },
                sio,
            ));
        }
        Err(StoreError::AllocationFailed)
    }

    /// A swap-out committed: record it durably and in the disk index.
    pub(crate) fn commit(&self, key: StoreKey, location: SwapLocation, swap_file_sz: u64) {
        self.disk_index.borrow_mut().insert(
            key,
            DiskEntry {
                location,
                swap_file_sz,
            },
        );
        self.dirs[location.dirn].log_add(key, location.filen, swap_file_sz);
    }

    /// A commit ran out of disk space: suspend further allocations from
    /// the directory until it recovers.
    pub(crate) fn disk_full(&self, dirn: usize) {
        self.dirs[dirn].set_full();
    }

    /// Drop buffered pages the readers and the swap-out no longer need,
    /// unless the memory tier may still want the whole object.
    pub(crate) fn maybe_trim(&self, entry: &mut StoreEntry, preserve_swappable: bool) {
        if self.mem.borrow().may_keep(entry) {
            return;
        }
        entry.trim(preserve_swappable);
    }

    pub(crate) fn register_lookup(&self, lookup: &Rc<RefCell<SwapIn>>) {
        self.lookups.borrow_mut().push(lookup.clone());
    }

    pub(crate) fn unregister_lookup(&self, lookup: &Rc<RefCell<SwapIn>>) {
        self.lookups.borrow_mut().retain(|l| !Rc::ptr_eq(l, lookup));
    }
}
