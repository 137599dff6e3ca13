//! End-to-end exercises of the storage engine: producer → swap-out →
//! commit → read-back, plus the failure and eviction paths.

use std::cell::RefCell;
use std::rc::Rc;
use stash::disk::{SwapLog, SwapLogOp, SwapMeta};
use stash::{
    Config, EntryRef, MemCacheConfig, Store, StoreError, StoreKey, SwapDecision, SwapDirConfig,
    SwapStatus,
};
use tempfile::TempDir;

fn disk_config(tmp: &TempDir, max_object_size: Option<u64>) -> Config {
    let mut dir = SwapDirConfig::new(tmp.path().join("d0"));
    dir.slots = 64;
    dir.max_object_size = max_object_size;
    Config {
        swap_dirs: vec![dir],
        ..Config::default()
    }
}

fn disk_store(tmp: &TempDir, max_object_size: Option<u64>) -> Rc<Store> {
    Store::new(disk_config(tmp, max_object_size)).unwrap()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn swap_in_result(store: &Rc<Store>, key: StoreKey) -> Option<Result<EntryRef, StoreError>> {
    let result = Rc::new(RefCell::new(None));
    let result2 = result.clone();
    store.swap_in(
        key,
        Box::new(move |r| {
            *result2.borrow_mut() = Some(r);
        }),
    );
    store.run_io();
    result.borrow_mut().take()
}

#[test]
fn test_swap_out_commit_and_read_back() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let key = StoreKey::for_request("GET", "http://example.com/object");
    let body = patterned(10_000);

    let entry = store.create_entry(key);
    store.append(&entry, &body[..3000]);
    store.append(&entry, &body[3000..6000]);
    store.append(&entry, &body[6000..]);
    store.complete(&entry);
    store.run_io();

    assert_eq!(entry.borrow().swap_status(), SwapStatus::Done);
    assert_eq!(
        entry.borrow().swap_file_sz(),
        body.len() as u64 + SwapMeta::SIZE as u64
    );
    assert!(store.has_on_disk(&key));

    // the object file carries the header then the body, byte for byte
    let location = entry.borrow().swap_location().unwrap();
    let path = tmp.path().join("d0").join(format!("{:08X}", location.filen));
    let raw = std::fs::read(path).unwrap();
    assert_eq!(raw.len(), SwapMeta::SIZE + body.len());
    let meta = SwapMeta::from_bytes(&raw[..SwapMeta::SIZE]).unwrap();
    assert_eq!(meta.key(), key);
    assert_eq!(&raw[SwapMeta::SIZE..], &body[..]);

    // read it back through the asynchronous lookup path
    let restored = swap_in_result(&store, key).unwrap().unwrap();
    let restored = restored.borrow();
    assert_eq!(restored.key(), key);
    assert_eq!(restored.swap_status(), SwapStatus::Done);
    assert_eq!(restored.object_len(), Some(body.len() as u64));
    assert_eq!(restored.mem().to_bytes().unwrap().as_ref(), &body[..]);
}

#[test]
fn test_swap_status_never_leaves_done() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let entry = store.create_entry(StoreKey::for_request("GET", "http://example.com/x"));

    assert_eq!(entry.borrow().swap_status(), SwapStatus::None);
    store.append(&entry, &patterned(8192));
    assert_eq!(entry.borrow().swap_status(), SwapStatus::Writing);

    store.complete(&entry);
    store.run_io();
    assert_eq!(entry.borrow().swap_status(), SwapStatus::Done);

    // another pass must not reopen writing
    store.swap_out(&entry);
    store.run_io();
    assert_eq!(entry.borrow().swap_status(), SwapStatus::Done);
}

#[test]
fn test_cursor_never_exceeds_high_water_mark() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let entry = store.create_entry(StoreKey::for_request("GET", "http://example.com/c"));

    for chunk in patterned(20_000).chunks(1500) {
        store.append(&entry, chunk);
        let e = entry.borrow();
        assert!(e.mem().swap_out_cursor() <= e.mem().end_offset());
    }
    store.complete(&entry);
    let e = entry.borrow();
    assert!(e.mem().swap_out_cursor() <= e.mem().end_offset());
}

#[test]
fn test_size_limit_rejects_and_stays_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, Some(50));
    let key = StoreKey::for_request("GET", "http://example.com/a");
    let entry = store.create_entry(key);

    // under the limit with an unknown final size: undecided, nothing on disk
    store.append(&entry, &[0u8; 30]);
    assert_eq!(entry.borrow().swap_status(), SwapStatus::None);
    assert_eq!(entry.borrow().mem().swap_decision(), SwapDecision::Undecided);

    // crossing the limit settles it for good
    store.append(&entry, &[0u8; 40]);
    assert_eq!(entry.borrow().mem().swap_decision(), SwapDecision::Impossible);
    assert_eq!(entry.borrow().swap_status(), SwapStatus::None);

    store.complete(&entry);
    store.run_io();
    assert_eq!(entry.borrow().swap_status(), SwapStatus::None);
    assert!(!store.has_on_disk(&key));
}

#[test]
fn test_abort_mid_write_rolls_back() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let key = StoreKey::for_request("GET", "http://example.com/aborted");
    let entry = store.create_entry(key);

    store.append(&entry, &patterned(8192));
    assert_eq!(entry.borrow().swap_status(), SwapStatus::Writing);

    store.abort(&entry);
    store.run_io();

    // rollback: swap status returns to None, the slot is gone, and the
    // swap log never saw an add record
    assert_eq!(entry.borrow().swap_status(), SwapStatus::None);
    assert!(entry.borrow().swap_location().is_none());
    assert!(!store.has_on_disk(&key));

    let records = SwapLog::replay(&tmp.path().join("d0")).unwrap();
    assert!(records.iter().all(|r| r.op != SwapLogOp::Add));

    // a later lookup by the same key misses everywhere
    assert!(store.get(&key).is_none());
    assert!(matches!(
        swap_in_result(&store, key),
        Some(Err(StoreError::NotFound))
    ));

    // and the object file itself was unlinked
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("d0"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|n| n != "swap.log")
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
}

#[test]
fn test_memory_tier_caps_at_configured_slots() {
    let tmp = TempDir::new().unwrap();
    let mut config = disk_config(&tmp, None);
    config.mem_cache = MemCacheConfig {
        enabled: true,
        capacity: 1 << 20,
        max_entries: 10,
        max_object_size: 1024,
    };
    let store = Store::new(config).unwrap();

    let keys: Vec<StoreKey> = (0..11)
        .map(|i| StoreKey::for_request("GET", &format!("http://example.com/{i}")))
        .collect();
    for key in &keys {
        let entry = store.create_entry(*key);
        store.append(&entry, b"small object");
        store.complete(&entry);
        store.consider_keeping(&entry);
    }
    store.run_io();

    let cached = keys.iter().filter(|k| store.mem_cached(k)).count();
    assert!(cached <= 10);
    assert!(cached >= 9, "tier should be close to full, got {cached}");
}

#[test]
fn test_memory_tier_hit_is_synchronous() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let key = StoreKey::for_request("GET", "http://example.com/hot");
    let entry = store.create_entry(key);
    store.append(&entry, b"hot object body");
    store.complete(&entry);
    store.consider_keeping(&entry);
    store.forget_transient(&key);
    store.run_io();
    store.forget_transient(&key);

    // no pending I/O: the hit must come straight from memory
    let hit = store.get(&key).expect("memory tier hit");
    assert_eq!(
        hit.borrow().mem().to_bytes().unwrap().as_ref(),
        b"hot object body"
    );
}

#[test]
fn test_transient_lookup_returns_live_entry() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let key = StoreKey::for_request("GET", "http://example.com/live");
    let entry = store.create_entry(key);
    store.append(&entry, b"partial");

    let found = store.get(&key).expect("in-transit hit");
    assert!(Rc::ptr_eq(&found, &entry));
}

#[test]
fn test_release_unlinks_committed_object() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let key = StoreKey::for_request("GET", "http://example.com/gone");
    let entry = store.create_entry(key);
    store.append(&entry, &patterned(5000));
    store.complete(&entry);
    store.run_io();
    assert!(store.has_on_disk(&key));

    store.release(&entry);
    assert!(!store.has_on_disk(&key));
    assert!(matches!(
        swap_in_result(&store, key),
        Some(Err(StoreError::NotFound))
    ));

    let records = SwapLog::replay(&tmp.path().join("d0")).unwrap();
    assert_eq!(records.last().unwrap().op, SwapLogOp::Remove);
}

#[test]
fn test_recovery_rebuilds_disk_index() {
    let tmp = TempDir::new().unwrap();
    let key = StoreKey::for_request("GET", "http://example.com/persistent");
    let body = patterned(6000);
    {
        let store = disk_store(&tmp, None);
        let entry = store.create_entry(key);
        store.append(&entry, &body);
        store.complete(&entry);
        store.run_io();
        assert!(store.has_on_disk(&key));
    }

    // a fresh store over the same directory replays the swap log
    let store = disk_store(&tmp, None);
    assert!(store.has_on_disk(&key));
    let restored = swap_in_result(&store, key).unwrap().unwrap();
    assert_eq!(restored.borrow().mem().to_bytes().unwrap().as_ref(), &body[..]);
}

#[test]
fn test_late_uncacheable_commit_stays_off_the_log() {
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let key = StoreKey::for_request("GET", "http://example.com/late");
    let entry = store.create_entry(key);
    store.append(&entry, &patterned(8192));
    assert_eq!(entry.borrow().swap_status(), SwapStatus::Writing);

    // the protocol layer changes its mind while the write is in flight
    entry.borrow_mut().set_cacheable(false);
    store.complete(&entry);
    store.run_io();

    // the write itself finished, but the object is not indexed or logged
    assert_eq!(entry.borrow().swap_status(), SwapStatus::Done);
    assert!(!store.has_on_disk(&key));
    let records = SwapLog::replay(&tmp.path().join("d0")).unwrap();
    assert!(records.iter().all(|r| r.op != SwapLogOp::Add));
}

#[test]
fn test_no_swap_dirs_disables_swap_out() {
    let store = Store::new(Config::default()).unwrap();
    let key = StoreKey::for_request("GET", "http://example.com/nodisk");
    let entry = store.create_entry(key);
    store.append(&entry, &patterned(8192));
    store.complete(&entry);
    store.run_io();

    assert_eq!(entry.borrow().swap_status(), SwapStatus::None);
    assert!(matches!(
        swap_in_result(&store, key),
        Some(Err(StoreError::NotFound))
    ));
}

#[test]
fn test_unknown_size_body_commits_exactly() {
    // an object whose length is only discovered at completion still
    // round-trips byte for byte
    let tmp = TempDir::new().unwrap();
    let store = disk_store(&tmp, None);
    let key = StoreKey::for_request("GET", "http://example.com/chunked");
    let body = patterned(4096 + 100); // full page plus a partial tail

    let entry = store.create_entry(key);
    store.append(&entry, &body);
    store.complete(&entry);
    store.run_io();

    assert_eq!(entry.borrow().swap_status(), SwapStatus::Done);
    let restored = swap_in_result(&store, key).unwrap().unwrap();
    assert_eq!(restored.borrow().mem().to_bytes().unwrap().as_ref(), &body[..]);
}
