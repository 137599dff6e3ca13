//! The memory cache tier.
//!
//! A bounded, shared index of whole objects served synchronously, with no
//! disk round trip. The tier is consulted before disk on lookup and
//! offered entries opportunistically as they complete; it never blocks
//! waiting for space, it simply declines an object that does not fit.
//! The tier is independent of the swap-out path: an object may live in
//! both, either, or neither.

use crate::config::MemCacheConfig;
use crate::entry::{StoreEntry, StoreStatus};
use crate::key::StoreKey;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, trace};

struct MemSlot {
    body: Bytes,
    last_used: u64,
}

/// Fixed-capacity index of fully in-memory objects.
pub struct MemStore {
    enabled: bool,
    capacity: u64,
    max_entries: usize,
    max_object_size: u64,
    bytes_used: u64,
    seq: u64,
    map: HashMap<StoreKey, MemSlot, ahash::RandomState>,
}

impl MemStore {
    /// Build the tier from configuration.
    pub fn new(config: &MemCacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.capacity,
            max_entries: config.max_entries.max(1),
            max_object_size: config.max_object_size,
            bytes_used: 0,
            seq: 0,
            map: HashMap::default(),
        }
    }

    /// Number of objects currently kept.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the tier holds no objects.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Bytes of object data currently kept.
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    /// Whether `key` is currently kept.
    pub fn contains(&self, key: &StoreKey) -> bool {
        self.map.contains_key(key)
    }

    /// Whether `needed` more bytes currently fit.
    pub fn will_fit(&self, needed: u64) -> bool {
        needed <= self.max_object_size
            && self.bytes_used + needed <= self.capacity
            && self.map.len() < self.max_entries
    }

    /// Cheap pre-check: could this entry end up in the tier? Used to
    /// decide whether buffered pages are worth preserving.
    pub fn may_keep(&self, entry: &StoreEntry) -> bool {
        if !self.enabled || entry.is_special() || !entry.is_cacheable() {
            return false;
        }
        let size = entry
            .expected_end()
            .unwrap_or_else(|| entry.mem().end_offset());
        size <= self.max_object_size && size <= self.capacity
    }

    /// Evaluate the entry and copy it into the tier if it is eligible and
    /// fits (evicting idle objects if needed). Returns whether it was
    /// kept; a declined entry may be offered again later.
    pub fn consider_keeping(&mut self, entry: &StoreEntry) -> bool {
        if !self.enabled {
            return false;
        }
        if entry.store_status() != StoreStatus::Ok
            || entry.is_aborted()
            || !entry.is_cacheable()
            || entry.is_special()
        {
            return false;
        }
        let Some(size) = entry.object_len() else {
            return false;
        };
        if size > self.max_object_size || size > self.capacity {
            trace!(key = %entry.key(), size, "too big for the memory tier");
            return false;
        }
        // needs every byte still buffered
        let Some(body) = entry.mem().to_bytes() else {
            return false;
        };

        // age out idle objects until this one fits; never block on space
        let replacing = self
            .map
            .get(&entry.key())
            .map(|slot| slot.body.len() as u64)
            .unwrap_or(0);
        while !self.will_fit(size.saturating_sub(replacing)) {
            if !self.evict_one(&entry.key()) {
                trace!(key = %entry.key(), "declined: does not fit");
                return false;
            }
        }

        self.keep(entry.key(), body);
        true
    }

    /// Synchronous whole-object lookup.
    pub fn get(&mut self, key: &StoreKey) -> Option<Bytes> {
        let seq = self.next_seq();
        let slot = self.map.get_mut(key)?;
        slot.last_used = seq;
        Some(slot.body.clone())
    }

    /// Drop `key` from the tier.
    pub fn remove(&mut self, key: &StoreKey) {
        if let Some(slot) = self.map.remove(key) {
            self.bytes_used -= slot.body.len() as u64;
        }
    }

    fn keep(&mut self, key: StoreKey, body: Bytes) {
        let seq = self.next_seq();
        self.remove(&key);
        debug!(key = %key, size = body.len(), "kept in memory tier");
        self.bytes_used += body.len() as u64;
        self.map.insert(
            key,
            MemSlot {
                body,
                last_used: seq,
            },
        );
    }

    /// Evict the least recently used object other than `keep_out`.
    fn evict_one(&mut self, keep_out: &StoreKey) -> bool {
        let victim = self
            .map
            .iter()
            .filter(|(k, _)| *k != keep_out)
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(k, _)| *k);
        match victim {
            Some(key) => {
                debug!(key = %key, "evicted from memory tier");
                self.remove(&key);
                true
            }
            None => false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}
