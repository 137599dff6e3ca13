//! The file handle abstraction.
//!
//! [`DiskFile`] is the narrow seam between the disk I/O state machine and
//! whatever backend performs the actual I/O. A handle accepts open, create,
//! read, write, and close requests, reports readiness through
//! [`can_read`](DiskFile::can_read)/[`can_write`](DiskFile::can_write),
//! and delivers every completion asynchronously to its owning [`IoState`]
//! through the shared [`IoScheduler`]. `error()` is sticky: once an
//! operation fails, the only operation still honored is `close()`.
//!
//! [`BlockingFile`] is the default backend. It performs plain `std::fs`
//! calls, but only at completion-dispatch time, so submission never blocks
//! the caller and completions observe the same ordering rules as a real
//! asynchronous backend: one read or write in flight per direction, close
//! strictly after outstanding I/O.

use crate::disk::io_state::IoState;
use crate::disk::scheduler::IoScheduler;
use crate::error::StoreError;
use bytes::Bytes;
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// A read submitted to a file handle.
#[derive(Debug)]
pub struct ReadRequest {
    /// Number of bytes to read. Short reads at end of file are reported
    /// through the completion, not as errors.
    pub len: usize,
    /// Absolute file offset to read from.
    pub offset: u64,
}

/// A write submitted to a file handle. The request owns its buffer; the
/// buffer is released when the request is dropped, whether or not the
/// write was ever issued.
#[derive(Debug)]
pub struct WriteRequest {
    /// The bytes to write.
    pub buf: Bytes,
    /// Absolute file offset to write at.
    pub offset: u64,
}

/// Contract between the disk I/O state machine and an I/O backend.
pub trait DiskFile {
    /// Open an existing file for reading. Completion arrives at the owning
    /// state machine's notification handler.
    fn open(&self);

    /// Create (truncate) a file for writing. Completion arrives at the
    /// owning state machine's notification handler.
    fn create(&self);

    /// Issue a read. The caller must have checked [`can_read`](Self::can_read).
    fn read(&self, req: ReadRequest);

    /// Issue a write. The caller must have checked [`can_write`](Self::can_write).
    fn write(&self, req: WriteRequest);

    /// Close the handle. Completion arrives after any in-flight operation.
    fn close(&self);

    /// Whether a new read can be issued right now.
    fn can_read(&self) -> bool;

    /// Whether a new write can be issued right now.
    fn can_write(&self) -> bool;

    /// Sticky error flag.
    fn error(&self) -> bool;

    /// Whether any operation is currently in flight.
    fn io_in_progress(&self) -> bool;
}

struct FileState {
    file: Option<File>,
    ready: bool,
    error: bool,
    closing: bool,
    open_in_flight: bool,
    reads_in_flight: usize,
    writes_in_flight: usize,
}

/// Default [`DiskFile`] backend over `std::fs`.
pub struct BlockingFile {
    path: PathBuf,
    scheduler: Rc<IoScheduler>,
    requestor: Weak<RefCell<IoState>>,
    state: Rc<RefCell<FileState>>,
}

impl BlockingFile {
    /// Create a handle for `path`, delivering completions to `requestor`
    /// through `scheduler`. No file is touched until `open` or `create`.
    pub fn new(
        path: PathBuf,
        scheduler: Rc<IoScheduler>,
        requestor: Weak<RefCell<IoState>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            path,
            scheduler,
            requestor,
            state: Rc::new(RefCell::new(FileState {
                file: None,
                ready: false,
                error: false,
                closing: false,
                open_in_flight: false,
                reads_in_flight: 0,
                writes_in_flight: 0,
            })),
        })
    }

    fn start_open(&self, create: bool) {
        {
            let mut s = self.state.borrow_mut();
            assert!(!s.ready && !s.open_in_flight && !s.closing);
            s.open_in_flight = true;
        }
        let state = self.state.clone();
        let requestor = self.requestor.clone();
        let path = self.path.clone();
        self.scheduler.defer(move || {
            let result = if create {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
            } else {
                OpenOptions::new().read(true).open(&path)
            };
            {
                let mut s = state.borrow_mut();
                s.open_in_flight = false;
                match result {
                    Ok(file) => {
                        s.file = Some(file);
                        s.ready = true;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "open failed");
                        s.error = true;
                    }
                }
            }
            if let Some(io) = requestor.upgrade() {
                IoState::notify_io_completed(&io);
            }
        });
    }
}

impl DiskFile for BlockingFile {
    fn open(&self) {
        debug!(path = %self.path.display(), "open");
        self.start_open(false);
    }

    fn create(&self) {
        debug!(path = %self.path.display(), "create");
        self.start_open(true);
    }

    fn read(&self, req: ReadRequest) {
        {
            let mut s = self.state.borrow_mut();
            assert!(s.ready && !s.closing && s.reads_in_flight == 0);
            s.reads_in_flight += 1;
        }
        let state = self.state.clone();
        let requestor = self.requestor.clone();
        self.scheduler.defer(move || {
            let mut buf = vec![0u8; req.len];
            let result = {
                let s = state.borrow();
                match (&s.file, s.error) {
                    (Some(file), false) => read_full_at(file, &mut buf, req.offset),
                    _ => Err(io::Error::other("file not open")),
                }
            };
            let (bytes, result) = {
                let mut s = state.borrow_mut();
                s.reads_in_flight -= 1;
                match result {
                    Ok(n) => {
                        buf.truncate(n);
                        (Bytes::from(buf), Ok(()))
                    }
                    Err(e) => {
                        warn!(error = %e, "read failed");
                        s.error = true;
                        (Bytes::new(), Err(StoreError::DiskError))
                    }
                }
            };
            if let Some(io) = requestor.upgrade() {
                IoState::notify_read_completed(&io, bytes, result);
            }
        });
    }

    fn write(&self, req: WriteRequest) {
        {
            let mut s = self.state.borrow_mut();
            assert!(s.ready && !s.closing && s.writes_in_flight == 0);
            s.writes_in_flight += 1;
        }
        let state = self.state.clone();
        let requestor = self.requestor.clone();
        self.scheduler.defer(move || {
            let len = req.buf.len() as u64;
            let result = {
                let s = state.borrow();
                match (&s.file, s.error) {
                    (Some(file), false) => file.write_all_at(&req.buf, req.offset),
                    _ => Err(io::Error::other("file not open")),
                }
            };
            let result = {
                let mut s = state.borrow_mut();
                s.writes_in_flight -= 1;
                match result {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(error = %e, "write failed");
                        s.error = true;
                        if e.kind() == io::ErrorKind::StorageFull {
                            Err(StoreError::NoSpaceLeft)
                        } else {
                            Err(StoreError::DiskError)
                        }
                    }
                }
            };
            if let Some(io) = requestor.upgrade() {
                IoState::notify_write_completed(&io, result, len);
            }
        });
    }

    fn close(&self) {
        {
            let mut s = self.state.borrow_mut();
            if s.closing {
                return;
            }
            s.closing = true;
        }
        let state = self.state.clone();
        let requestor = self.requestor.clone();
        self.scheduler.defer(move || {
            {
                let mut s = state.borrow_mut();
                if let Some(file) = s.file.take()
                    && let Err(e) = file.sync_all()
                {
                    warn!(error = %e, "sync on close failed");
                    s.error = true;
                }
                s.ready = false;
            }
            if let Some(io) = requestor.upgrade() {
                IoState::notify_close_completed(&io);
            }
        });
    }

    fn can_read(&self) -> bool {
        let s = self.state.borrow();
        s.ready && !s.error && !s.closing && s.reads_in_flight == 0
    }

    fn can_write(&self) -> bool {
        let s = self.state.borrow();
        s.ready && !s.error && !s.closing && s.writes_in_flight == 0
    }

    fn error(&self) -> bool {
        self.state.borrow().error
    }

    fn io_in_progress(&self) -> bool {
        let s = self.state.borrow();
        s.open_in_flight || s.reads_in_flight > 0 || s.writes_in_flight > 0
    }
}

/// Read until `buf` is full or end of file, returning bytes read.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
