//! Swap-in: the asynchronous disk-backed read path.
//!
//! A [`SwapIn`] controller drives one disk lookup: open the object file,
//! read and validate the metadata header, read the body, then deliver the
//! reconstructed entry to the caller. Each step is a queued read against
//! the session, so a lookup issued before the file finishes opening is
//! simply serviced once it does.

use crate::disk::{IoState, SwapLocation, SwapMeta};
use crate::entry::{EntryRef, StoreEntry, SwapStatus};
use crate::error::{StoreError, StoreResult};
use crate::key::StoreKey;
use crate::metrics::{SWAP_IN_FAILS, SWAP_INS};
use crate::store::Store;
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Invoked once with the reconstructed entry, or the reason there is none.
pub type LookupCallback = Box<dyn FnOnce(StoreResult<EntryRef>)>;

/// One in-flight disk lookup.
pub(crate) struct SwapIn {
    key: StoreKey,
    location: SwapLocation,
    body_len: u64,
    page_size: usize,
    store: Weak<Store>,
    sio: Option<Rc<RefCell<IoState>>>,
    callback: Option<LookupCallback>,
}

impl SwapIn {
    /// Start a lookup for `key` at `location`; `swap_file_sz` comes from
    /// the disk index. The controller keeps itself registered with the
    /// store until it delivers a result.
    pub(crate) fn start(
        store: &Rc<Store>,
        key: StoreKey,
        location: SwapLocation,
        swap_file_sz: u64,
        callback: LookupCallback,
    ) {
        if swap_file_sz < SwapMeta::SIZE as u64 {
            warn!(key = %key, swap_file_sz, "indexed object smaller than its header");
            callback(Err(StoreError::Corrupt));
            return;
        }
        let ctl = Rc::new(RefCell::new(SwapIn {
            key,
            location,
            body_len: swap_file_sz - SwapMeta::SIZE as u64,
            page_size: store.page_size(),
            store: Rc::downgrade(store),
            sio: None,
            callback: Some(callback),
        }));
        store.register_lookup(&ctl);

        let weak = Rc::downgrade(&ctl);
        let close_cb = Box::new(move |result: StoreResult<()>| {
            if let Some(ctl) = weak.upgrade() {
                Self::on_close(&ctl, result);
            }
        });
        let sio = store
            .dir(location.dirn)
            .open_io(location.filen, store.scheduler(), close_cb);
        ctl.borrow_mut().sio = Some(sio.clone());

        debug!(key = %key, dirn = location.dirn, filen = location.filen, "begin swap-in");
        let weak = Rc::downgrade(&ctl);
        let ok = sio.borrow_mut().read(
            SwapMeta::SIZE,
            0,
            Box::new(move |result| {
                if let Some(ctl) = weak.upgrade() {
                    Self::on_meta(&ctl, result);
                }
            }),
        );
        if !ok {
            Self::fail(&ctl, StoreError::DiskError);
        }
    }

    fn on_meta(ctl: &Rc<RefCell<Self>>, result: StoreResult<Bytes>) {
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => return Self::fail(ctl, e),
        };
        let (sio, body_len, key) = {
            let this = ctl.borrow();
            (this.sio.clone(), this.body_len, this.key)
        };
        let meta = match SwapMeta::from_bytes(&bytes) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(key = %key, "bad metadata header on disk");
                return Self::fail(ctl, e);
            }
        };
        if meta.key() != key {
            warn!(key = %key, found = %meta.key(), "key mismatch on disk");
            return Self::fail(ctl, StoreError::Corrupt);
        }
        if let Some(size) = meta.object_size()
            && size != body_len
        {
            warn!(key = %key, size, body_len, "size mismatch between header and index");
            return Self::fail(ctl, StoreError::Corrupt);
        }

        let weak = Rc::downgrade(ctl);
        let sio = sio.expect("meta read without a session");
        let ok = sio.borrow_mut().read(
            body_len as usize,
            SwapMeta::SIZE as u64,
            Box::new(move |result| {
                if let Some(ctl) = weak.upgrade() {
                    Self::on_body(&ctl, result);
                }
            }),
        );
        if !ok {
            Self::fail(ctl, StoreError::DiskError);
        }
    }

    fn on_body(ctl: &Rc<RefCell<Self>>, result: StoreResult<Bytes>) {
        let body = match result {
            Ok(body) => body,
            Err(e) => return Self::fail(ctl, e),
        };
        let mut this = ctl.borrow_mut();
        if body.len() as u64 != this.body_len {
            warn!(
                key = %this.key,
                got = body.len(),
                want = this.body_len,
                "short object file"
            );
            drop(this);
            return Self::fail(ctl, StoreError::Corrupt);
        }

        let mut entry = StoreEntry::from_cached(this.key, &body, this.page_size);
        entry.set_swap_location(this.location);
        entry.swap_status = SwapStatus::Done;
        entry.swap_file_sz = SwapMeta::SIZE as u64 + this.body_len;
        let entry = entry.into_ref();

        debug!(key = %this.key, len = body.len(), "swap-in complete");
        SWAP_INS.increment();

        let callback = this.callback.take();
        if let Some(sio) = this.sio.clone() {
            sio.borrow_mut().close();
        }
        let store = this.store.upgrade();
        drop(this);

        if let Some(store) = &store {
            // opportunistically offer the hot object to the memory tier
            store.consider_keeping(&entry);
        }
        if let Some(cb) = callback {
            cb(Ok(entry));
        }
    }

    fn fail(ctl: &Rc<RefCell<Self>>, error: StoreError) {
        let mut this = ctl.borrow_mut();
        let callback = this.callback.take();
        if let Some(sio) = this.sio.clone() {
            sio.borrow_mut().close();
        }
        let store = this.store.upgrade();
        let key = this.key;
        drop(this);

        if let Some(store) = &store {
            store.unregister_lookup(ctl);
        }
        if let Some(cb) = callback {
            debug!(key = %key, error = %error, "swap-in failed");
            SWAP_IN_FAILS.increment();
            cb(Err(error));
        }
    }

    fn on_close(ctl: &Rc<RefCell<Self>>, result: StoreResult<()>) {
        if result.is_err() {
            Self::fail(ctl, StoreError::DiskError);
            return;
        }
        // normal end of a delivered lookup
        let store = ctl.borrow().store.upgrade();
        if let Some(store) = &store {
            store.unregister_lookup(ctl);
        }
    }
}
