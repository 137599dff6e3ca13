//! Swap-out: admission control and the page-pump driver.
//!
//! The driver moves confirmed bytes from an entry's [`MemObject`] into a
//! disk I/O session until the object is fully written or the attempt is
//! abandoned. Admission control decides whether persisting is currently
//! possible, impossible, or still undecided; the verdict is memoized on
//! the entry and only `Undecided` is ever re-evaluated.

use crate::disk::{CloseCallback, SwapMeta};
use crate::entry::{EntryRef, StoreEntry, StoreStatus, SwapStatus};
use crate::error::{StoreError, StoreResult};
use crate::mem_object::SwapDecision;
use crate::metrics::{SWAP_OUT_FAILS, SWAP_OUTS};
use crate::store::Store;
use bytes::Bytes;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// How a swap-out session is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    /// Every byte of the object reached the session; expect a commit.
    WroteAll,
    /// The producer is gone; expect a rollback.
    WriterGone,
}

/// Advance disk writing for `entry`. Invoked after every producer append
/// and on completion events; cheap when there is nothing to do.
pub(crate) fn swap_out(store: &Rc<Store>, entry: &EntryRef) {
    let mut e = entry.borrow_mut();

    // this flag may change so we must check even if we are swapping out
    if e.is_aborted() {
        // abort() already closed the swap-out session, if any
        return;
    }

    let we_are_or_may = e.swapping_out() || may_start_swap_out(store, &mut e);
    store.maybe_trim(&mut e, we_are_or_may);
    if !we_are_or_may {
        return;
    }

    if e.swapping_out() {
        debug_assert!(e.mem.inmem_lo() <= e.object_bytes_on_disk());
    }

    // buffered bytes we have not handed to the session yet
    let avail = e.mem.available_for_swap_out();
    trace!(
        key = %e.key(),
        avail,
        cursor = e.mem.swap_out_cursor(),
        end = e.mem.end_offset(),
        "swap-out pass"
    );

    if avail == 0 {
        // handed over everything we got
        if e.store_status() == StoreStatus::Ok {
            // got everything we wanted
            debug_assert!(e.object_len().is_some());
            swap_out_file_close(&mut e, CloseMode::WroteAll);
        }
        // else: need more data to swap out
        return;
    }

    if e.store_status() == StoreStatus::Pending && avail < e.mem.page_size() as u64 {
        // wait for a full page to write
        return;
    }

    if e.swap_status() == SwapStatus::None {
        debug_assert!(e.mem.swapout.sio.is_none());
        debug_assert!(e.mem.inmem_lo() == 0);
        swap_out_start(store, entry, &mut e); // memoizes Impossible on failure
    }

    if e.mem.swapout.sio.is_none() {
        return;
    }

    if !pump(&mut e) {
        // oops, we're not swapping out any more
        return;
    }

    if e.store_status() == StoreStatus::Ok {
        // the producer will not call us again, so every byte must have
        // reached the session by now
        debug_assert!(e.object_len().is_some());
        debug_assert!(e.mem.end_offset() == e.mem.swap_out_cursor());
        swap_out_file_close(&mut e, CloseMode::WroteAll);
    }
}

/// Start the swap-out: allocate a disk slot, open the session, and write
/// the serialized metadata header at offset 0.
fn swap_out_start(store: &Rc<Store>, entry: &EntryRef, e: &mut StoreEntry) {
    // build the swap metadata first, so the header length is fixed before
    // any body offsets are computed
    let meta = SwapMeta::new(e.key(), e.object_len());
    let header = Bytes::copy_from_slice(&meta.to_bytes());
    e.mem.swap_hdr_sz = SwapMeta::SIZE as u64;

    let weak_store = Rc::downgrade(store);
    let weak_entry = Rc::downgrade(entry);
    let callback: CloseCallback = Box::new(move |result| {
        let (Some(store), Some(entry)) = (weak_store.upgrade(), weak_entry.upgrade()) else {
            return;
        };
        swap_out_file_closed(&store, &entry, result);
    });

    match store.create_session(callback) {
        Ok((location, sio)) => {
            debug!(
                key = %e.key(),
                dirn = location.dirn,
                filen = location.filen,
                "begin swap-out"
            );
            e.swap_status = SwapStatus::Writing;
            e.set_swap_location(location);
            e.mem.swapout.sio = Some(sio.clone());
            sio.borrow_mut().write(header, 0);
        }
        Err(err) => {
            // terminal for this attempt; not retried
            warn!(key = %e.key(), error = %err, "swap-out start failed");
            e.swap_status = SwapStatus::None;
            e.mem.swapout.decision = SwapDecision::Impossible;
            SWAP_OUT_FAILS.increment();
        }
    }
}

/// Hand full pages to the session, one write per page, until we run out
/// of swappable data. Returns false if swapping stopped for good.
fn pump(e: &mut StoreEntry) -> bool {
    loop {
        // find the page containing the first byte we have not handed over
        let cursor = e.mem.swap_out_cursor();
        let (start, len, buf) = match e.mem.node_containing(cursor) {
            Some(page) => (page.start(), page.len() as u64, page.to_bytes()),
            None => return true, // wait for more data to become available
        };

        // pages are written whole, from their first byte
        assert_eq!(start, cursor);
        assert!(len > 0);

        trace!(key = %e.key(), start, len, "swapping out page");
        let file_offset = e.mem.swap_hdr_sz + start;
        e.mem.swapout.queue_offset += len;
        debug_assert!(e.mem.swap_out_cursor() <= e.mem.end_offset());

        let sio = e.mem.swapout.sio.clone().expect("pump without a session");
        let ok = sio.borrow_mut().write(buf, file_offset);

        if !ok || e.swap_status() != SwapStatus::Writing || e.is_aborted() {
            return false;
        }

        let remaining = e.mem.end_offset() - e.mem.swap_out_cursor();
        if e.store_status() == StoreStatus::Pending && remaining < e.mem.page_size() as u64 {
            return true; // wait for a full page
        }
        if remaining == 0 {
            return true;
        }
    }
}

/// Ask the session to close; finalization happens in the close callback.
pub(crate) fn swap_out_file_close(e: &mut StoreEntry, mode: CloseMode) {
    let Some(sio) = e.mem.swapout.sio.clone() else {
        return;
    };
    debug!(key = %e.key(), ?mode, "closing swap-out session");
    sio.borrow_mut().close();
}

/// Close completion: commit on success, roll back on error, abort, or an
/// object whose size never became known.
fn swap_out_file_closed(store: &Rc<Store>, entry: &EntryRef, result: StoreResult<()>) {
    let mut e = entry.borrow_mut();
    debug_assert_eq!(e.swap_status(), SwapStatus::Writing);
    e.mem.swapout.sio = None;

    let rolled_back = result.is_err() || e.is_aborted() || e.object_len().is_none();
    if rolled_back {
        debug!(key = %e.key(), ?result, "swap-out rolled back");

        if result == Err(StoreError::NoSpaceLeft)
            && let Some(location) = e.swap_location()
        {
            store.disk_full(location.dirn);
        }

        if let Some(location) = e.swap_location() {
            store.dir(location.dirn).release_slot(location.filen);
            e.clear_swap_location();
        }

        e.swap_status = SwapStatus::None;
        e.mem.swapout.decision = SwapDecision::Impossible;
        e.request_release();
        SWAP_OUT_FAILS.increment();
        return;
    }

    // swapping complete
    let object_len = e.object_len().expect("commit without a known size");
    e.swap_file_sz = object_len + e.mem.swap_hdr_sz;
    e.swap_status = SwapStatus::Done;
    SWAP_OUTS.increment();

    let key = e.key();
    let location = e.swap_location().expect("commit without a location");
    let swap_file_sz = e.swap_file_sz;
    let still_cacheable = e.is_cacheable();
    drop(e);

    if still_cacheable {
        debug!(key = %key, dirn = location.dirn, filen = location.filen, "swap-out complete");
        store.commit(key, location, swap_file_sz);
    } else {
        // completed but no longer wanted; keep it off the rebuild log
        warn!(key = %key, "object became uncacheable after swap-out");
    }
}

/// Swap-out admission control.
///
/// Evaluated lazily and memoized: once the verdict is `Possible` or
/// `Impossible` the checks are never repeated. Rule order is load-bearing;
/// in particular a reader that requires disk-resident data forces
/// `Possible` ahead of the contiguity check, even when the size limit
/// would still defer the decision.
pub(crate) fn may_start_swap_out(store: &Store, e: &mut StoreEntry) -> bool {
    // must be checked in the caller
    assert!(!e.is_aborted());
    assert!(!e.swapping_out());

    if !store.has_swap_dirs() {
        return false;
    }

    // if we decided already, do not repeat the same checks
    match e.mem.swap_decision() {
        SwapDecision::Impossible => {
            trace!(key = %e.key(), "already rejected");
            return false;
        }
        SwapDecision::Possible => {
            trace!(key = %e.key(), "already allowed");
            return true;
        }
        SwapDecision::Undecided => {}
    }

    // if we swapped out already, do not start over
    if e.swap_status() == SwapStatus::Done {
        e.mem.swapout.decision = SwapDecision::Impossible;
        return false;
    }

    if !e.is_cacheable() {
        trace!(key = %e.key(), "not cacheable");
        e.mem.swapout.decision = SwapDecision::Impossible;
        return false;
    }

    if e.is_special() {
        trace!(key = %e.key(), "special entry");
        e.mem.swapout.decision = SwapDecision::Impossible;
        return false;
    }

    if let Some(max_size) = store.max_object_size() {
        // use the guaranteed maximum if it is known
        if let Some(expected_end) = e.expected_end()
            && expected_end > max_size
        {
            trace!(key = %e.key(), expected_end, max_size, "will not fit");
            e.mem.swapout.decision = SwapDecision::Impossible;
            return false; // known to outgrow the limit eventually
        }

        // use the current minimum (always known)
        let current_end = e.mem.end_offset();
        if current_end > max_size {
            trace!(key = %e.key(), current_end, max_size, "does not fit");
            e.mem.swapout.decision = SwapDecision::Impossible;
            return false; // already does not fit and may only get bigger
        }

        // prevent the default Possible answer for a yet unknown length
        if e.expected_end().is_none() {
            trace!(key = %e.key(), "wait for more info");
            return false; // may fit later, but would be rejected now
        }

        if e.store_status() != StoreStatus::Ok {
            let max_known_size = e.expected_end().unwrap();
            if max_known_size < max_size {
                trace!(
                    key = %e.key(),
                    deferred_for = max_size - max_known_size,
                    "deferring swap-out start"
                );
                return false;
            }
        }
    }

    if e.mem.inmem_lo() > 0 {
        trace!(key = %e.key(), inmem_lo = e.mem.inmem_lo(), "memory already trimmed");
        e.mem.swapout.decision = SwapDecision::Impossible;
        return false;
    }

    // if there are disk clients, we must write to disk even if the
    // economics above would not justify it
    if e.has_disk_client() {
        trace!(key = %e.key(), "disk client found");
        e.mem.swapout.decision = SwapDecision::Possible;
        return true;
    }

    if !e.mem.is_contiguous() {
        trace!(key = %e.key(), "not contiguous");
        e.mem.swapout.decision = SwapDecision::Impossible;
        return false;
    }

    e.mem.swapout.decision = SwapDecision::Possible;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SwapDirConfig};
    use crate::entry::ClientKind;
    use crate::key::StoreKey;
    use tempfile::tempdir;

    fn test_store(max_object_size: Option<u64>) -> (tempfile::TempDir, Rc<Store>) {
        let tmp = tempdir().unwrap();
        let mut dir = SwapDirConfig::new(tmp.path().join("d0"));
        dir.slots = 64;
        dir.max_object_size = max_object_size;
        let config = Config {
            swap_dirs: vec![dir],
            ..Config::default()
        };
        (tmp, Store::new(config).unwrap())
    }

    fn entry(store: &Store) -> StoreEntry {
        StoreEntry::new(
            StoreKey::for_request("GET", "http://example.com/"),
            store.page_size(),
        )
    }

    #[test]
    fn test_default_is_possible_and_memoized() {
        let (_tmp, store) = test_store(None);
        let mut e = entry(&store);
        e.append(b"data");
        assert!(may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Possible);
        // idempotent: repeated calls return the same verdict
        assert!(may_start_swap_out(&store, &mut e));
        assert!(may_start_swap_out(&store, &mut e));
    }

    #[test]
    fn test_uncacheable_is_impossible_and_sticky() {
        let (_tmp, store) = test_store(None);
        let mut e = entry(&store);
        e.set_cacheable(false);
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
        // memoized: a later change of heart does not reopen the question
        e.set_cacheable(true);
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
    }

    #[test]
    fn test_special_entries_never_persist() {
        let (_tmp, store) = test_store(None);
        let mut e = entry(&store);
        e.set_special();
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
    }

    #[test]
    fn test_no_swap_dirs_declines_without_memoizing() {
        let store = Store::new(Config::default()).unwrap();
        let mut e = entry(&store);
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Undecided);
    }

    #[test]
    fn test_known_oversize_estimate_is_impossible() {
        let (_tmp, store) = test_store(Some(50));
        let mut e = entry(&store);
        e.set_expected_size(Some(100));
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
    }

    #[test]
    fn test_received_bytes_over_limit_is_impossible() {
        let (_tmp, store) = test_store(Some(50));
        let mut e = entry(&store);
        e.append(&[0u8; 60]);
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
    }

    #[test]
    fn test_unknown_size_defers_until_complete() {
        let (_tmp, store) = test_store(Some(50));
        let mut e = entry(&store);
        e.append(&[0u8; 30]);
        // under the limit but the final size is unknown: wait, and leave
        // the question open
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Undecided);

        e.complete();
        assert!(may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Possible);
    }

    #[test]
    fn test_known_undersize_estimate_still_defers_while_pending() {
        let (_tmp, store) = test_store(Some(50));
        let mut e = entry(&store);
        e.set_expected_size(Some(30));
        e.append(&[0u8; 10]);
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Undecided);
    }

    #[test]
    fn test_trimmed_memory_is_impossible() {
        let (_tmp, store) = test_store(None);
        let mut e = entry(&store);
        e.append(&[0u8; 8192]);
        e.mem.trim_to(4096);
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
    }

    #[test]
    fn test_gap_in_buffered_data_is_impossible() {
        let (_tmp, store) = test_store(None);
        let mut e = entry(&store);
        e.append(b"head");
        e.mem.append_at(10_000, b"tail");
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
    }

    #[test]
    fn test_disk_client_wins_over_contiguity() {
        let (_tmp, store) = test_store(None);
        let mut e = entry(&store);
        e.append(b"head");
        e.mem.append_at(10_000, b"tail");
        e.add_client(ClientKind::Disk);
        // the disk client is checked before contiguity, so the gap that
        // would otherwise reject this entry never gets a say
        assert!(may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Possible);
    }

    #[test]
    fn test_size_limit_rejection_precedes_disk_client() {
        // Documented precedence: the size rules come before the disk
        // client override, so an estimate known to exceed the limit wins
        // even when a reader requires disk-resident data.
        let (_tmp, store) = test_store(Some(50));
        let mut e = entry(&store);
        e.set_expected_size(Some(100));
        e.add_client(ClientKind::Disk);
        assert!(!may_start_swap_out(&store, &mut e));
        assert_eq!(e.mem.swap_decision(), SwapDecision::Impossible);
    }

    #[test]
    fn test_mem_client_does_not_force_swap_out() {
        let (_tmp, store) = test_store(None);
        let mut e = entry(&store);
        e.append(b"head");
        e.mem.append_at(10_000, b"tail");
        e.add_client(ClientKind::Mem);
        assert!(!may_start_swap_out(&store, &mut e));
    }
}
