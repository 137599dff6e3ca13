//! Swap directories.
//!
//! A [`SwapDir`] owns one on-disk namespace: a bitmap of file-number
//! slots, the object files named by those slots, and the directory's swap
//! log. A slot, once handed to an entry, belongs to that entry until it is
//! released; slot numbers are recycled only after release.

use crate::config::SwapDirConfig;
use crate::disk::file::{BlockingFile, DiskFile};
use crate::disk::io_state::{CloseCallback, IoMode, IoState};
use crate::disk::meta::now_secs;
use crate::disk::scheduler::IoScheduler;
use crate::disk::swap_log::{SwapLog, SwapLogOp, SwapLogRecord};
use crate::error::{StoreError, StoreResult};
use crate::key::StoreKey;
use std::cell::{Cell, RefCell};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, warn};

/// Where an object lives on disk: directory index plus file number.
/// Assigned once per entry and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapLocation {
    /// Index of the swap directory.
    pub dirn: usize,
    /// File number within the directory.
    pub filen: u32,
}

/// Slot bitmap with a next-fit allocation cursor.
struct SlotMap {
    bits: Vec<u64>,
    capacity: u32,
    used: u32,
    cursor: u32,
}

impl SlotMap {
    fn new(capacity: u32) -> Self {
        Self {
            bits: vec![0u64; capacity.div_ceil(64) as usize],
            capacity,
            used: 0,
            cursor: 0,
        }
    }

    fn is_used(&self, slot: u32) -> bool {
        self.bits[(slot / 64) as usize] & (1 << (slot % 64)) != 0
    }

    fn set(&mut self, slot: u32, used: bool) {
        let mask = 1 << (slot % 64);
        let word = &mut self.bits[(slot / 64) as usize];
        if used {
            debug_assert!(*word & mask == 0);
            *word |= mask;
            self.used += 1;
        } else {
            debug_assert!(*word & mask != 0);
            *word &= !mask;
            self.used -= 1;
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        if self.used == self.capacity {
            return None;
        }
        for probe in 0..self.capacity {
            let slot = (self.cursor + probe) % self.capacity;
            if !self.is_used(slot) {
                self.set(slot, true);
                self.cursor = (slot + 1) % self.capacity;
                return Some(slot);
            }
        }
        None
    }
}

/// One swap directory.
pub struct SwapDir {
    index: usize,
    path: PathBuf,
    max_object_size: Option<u64>,
    slots: RefCell<SlotMap>,
    full: Cell<bool>,
    log: RefCell<SwapLog>,
}

impl SwapDir {
    /// Create the directory on disk (if needed) and open its swap log.
    pub fn new(index: usize, config: &SwapDirConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        let log = SwapLog::open(&config.path)?;
        Ok(Self {
            index,
            path: config.path.clone(),
            max_object_size: config.max_object_size,
            slots: RefCell::new(SlotMap::new(config.slots.max(1))),
            full: Cell::new(false),
            log: RefCell::new(log),
        })
    }

    /// This directory's index in the store.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Largest object this directory accepts, if limited.
    pub fn max_object_size(&self) -> Option<u64> {
        self.max_object_size
    }

    /// Slots still available.
    pub fn free_slots(&self) -> u32 {
        let slots = self.slots.borrow();
        slots.capacity - slots.used
    }

    /// Whether the directory has declared itself full.
    pub fn is_full(&self) -> bool {
        self.full.get()
    }

    /// Declare the directory full: no more slot allocations until reset.
    pub fn set_full(&self) {
        if !self.full.get() {
            warn!(dirn = self.index, "swap directory is full");
            self.full.set(true);
        }
    }

    /// Allow slot allocations again.
    pub fn reset_full(&self) {
        self.full.set(false);
    }

    /// Path of the object file for `filen`.
    pub fn file_path(&self, filen: u32) -> PathBuf {
        self.path.join(format!("{filen:08X}"))
    }

    /// Allocate a slot and start a write session for it. The session is
    /// `Creating` until the scheduler dispatches the create.
    pub fn create_io(
        &self,
        scheduler: &Rc<IoScheduler>,
        callback: CloseCallback,
    ) -> StoreResult<(u32, Rc<RefCell<IoState>>)> {
        if self.full.get() {
            return Err(StoreError::AllocationFailed);
        }
        let filen = self
            .slots
            .borrow_mut()
            .allocate()
            .ok_or(StoreError::AllocationFailed)?;
        debug!(dirn = self.index, filen, "create object file");

        let io = IoState::new(IoMode::Write, callback);
        let file = BlockingFile::new(self.file_path(filen), scheduler.clone(), Rc::downgrade(&io));
        io.borrow_mut().attach_file(file.clone());
        file.create();
        Ok((filen, io))
    }

    /// Start a read session for an existing slot.
    pub fn open_io(
        &self,
        filen: u32,
        scheduler: &Rc<IoScheduler>,
        callback: CloseCallback,
    ) -> Rc<RefCell<IoState>> {
        debug!(dirn = self.index, filen, "open object file");
        let io = IoState::new(IoMode::Read, callback);
        let file = BlockingFile::new(self.file_path(filen), scheduler.clone(), Rc::downgrade(&io));
        io.borrow_mut().attach_file(file.clone());
        file.open();
        io
    }

    /// Release a slot, removing its object file.
    pub fn release_slot(&self, filen: u32) {
        debug!(dirn = self.index, filen, "release slot");
        self.slots.borrow_mut().set(filen, false);
        let path = self.file_path(filen);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "unlink failed");
        }
    }

    /// Record a successful commit in the swap log.
    pub fn log_add(&self, key: StoreKey, filen: u32, swap_file_sz: u64) {
        self.log.borrow_mut().append(SwapLogRecord {
            op: SwapLogOp::Add,
            filen,
            swap_file_sz,
            created: now_secs(),
            key,
        });
    }

    /// Record the release of a committed object in the swap log.
    pub fn log_remove(&self, key: StoreKey, filen: u32) {
        self.log.borrow_mut().append(SwapLogRecord {
            op: SwapLogOp::Remove,
            filen,
            swap_file_sz: 0,
            created: now_secs(),
            key,
        });
    }

    /// Replay the swap log, claiming slots for objects that survived.
    /// Returns the live `(key, filen, swap_file_sz)` triples.
    pub fn recover(&self) -> StoreResult<Vec<(StoreKey, u32, u64)>> {
        let records = SwapLog::replay(&self.path)?;
        let mut live: Vec<(StoreKey, u32, u64)> = Vec::new();
        for record in records {
            match record.op {
                SwapLogOp::Add => {
                    live.retain(|(k, _, _)| *k != record.key);
                    live.push((record.key, record.filen, record.swap_file_sz));
                }
                SwapLogOp::Remove => {
                    live.retain(|(k, _, _)| *k != record.key);
                }
            }
        }
        let mut slots = self.slots.borrow_mut();
        live.retain(|(_, filen, _)| *filen < slots.capacity);
        for (_, filen, _) in &live {
            if !slots.is_used(*filen) {
                slots.set(*filen, true);
            }
        }
        debug!(dirn = self.index, objects = live.len(), "swap log replayed");
        Ok(live)
    }
}
