//! The disk I/O state machine.
//!
//! An [`IoState`] sequences one open/create → read/write(s) → close cycle
//! against a [`DiskFile`]. Requests that arrive before the handle is ready
//! are queued: at most one read, any number of writes. Queues drain in
//! strict arrival order once the handle reports ready. A close is deferred
//! until every in-flight and queued operation for the session has drained,
//! because backends do not guarantee ordering between a close and
//! concurrently issued I/O.
//!
//! The owner's close callback fires exactly once: on close completion, or
//! earlier with an error if the backend fails mid-session.

use crate::disk::file::{DiskFile, ReadRequest, WriteRequest};
use crate::error::{StoreError, StoreResult};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, trace};

/// Invoked once when the session finishes (close completion or error).
pub type CloseCallback = Box<dyn FnOnce(StoreResult<()>)>;

/// Invoked with the bytes of one completed read.
pub type ReadCallback = Box<dyn FnOnce(StoreResult<Bytes>)>;

/// Whether the session was opened to read an existing object or to create
/// a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Swap-in: open an existing file.
    Read,
    /// Swap-out: create a new file.
    Write,
}

struct QueuedRead {
    len: usize,
    offset: u64,
    callback: ReadCallback,
}

struct QueuedWrite {
    buf: Bytes,
    offset: u64,
}

/// A deferred callback extracted from the state machine, to be invoked
/// after the session borrow has been released.
enum Action {
    None,
    Read(ReadCallback, StoreResult<Bytes>),
    Close(CloseCallback, StoreResult<()>),
}

/// One disk I/O session: a file handle plus the request queues and
/// in-flight flags that sequence operations against it.
pub struct IoState {
    mode: IoMode,
    file: Option<Rc<dyn DiskFile>>,
    opening: bool,
    creating: bool,
    closing: bool,
    reading: bool,
    writing: bool,
    write_kicking: bool,
    close_issued: bool,
    closed: bool,
    offset: u64,
    inflight_read: Option<ReadCallback>,
    pending_read: Option<QueuedRead>,
    pending_writes: VecDeque<QueuedWrite>,
    callback: Option<CloseCallback>,
}

impl std::fmt::Debug for IoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoState")
            .field("mode", &self.mode)
            .field("opening", &self.opening)
            .field("creating", &self.creating)
            .field("closing", &self.closing)
            .field("reading", &self.reading)
            .field("writing", &self.writing)
            .field("write_kicking", &self.write_kicking)
            .field("close_issued", &self.close_issued)
            .field("closed", &self.closed)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl IoState {
    /// Create a session. The caller attaches a file handle and starts the
    /// open or create before any I/O is submitted.
    pub(crate) fn new(mode: IoMode, callback: CloseCallback) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            mode,
            file: None,
            opening: false,
            creating: false,
            closing: false,
            reading: false,
            writing: false,
            write_kicking: false,
            close_issued: false,
            closed: false,
            offset: 0,
            inflight_read: None,
            pending_read: None,
            pending_writes: VecDeque::new(),
            callback: Some(callback),
        }))
    }

    /// Attach the backing file handle and mark the session as opening or
    /// creating. The caller then calls `open()`/`create()` on the handle.
    pub(crate) fn attach_file(&mut self, file: Rc<dyn DiskFile>) {
        assert!(self.file.is_none());
        match self.mode {
            IoMode::Read => self.opening = true,
            IoMode::Write => self.creating = true,
        }
        self.file = Some(file);
    }

    /// Bytes confirmed written (or read) so far, including any metadata
    /// header. Advances only on completions.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the session has fully finished (close callback fired).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Submit a write of `buf` at absolute file offset `offset`.
    ///
    /// Returns false if the session is already dead (backend error or
    /// closed); the caller must stop producing I/O. Submitting a write
    /// after requesting a close is a contract violation.
    pub fn write(&mut self, buf: Bytes, offset: u64) -> bool {
        assert!(!self.closing, "write submitted after close was requested");
        if self.closed || self.file_error() {
            return false;
        }
        let file = self.file.as_ref().expect("no file attached").clone();
        if !file.can_write() {
            assert!(self.creating || self.writing);
            trace!(len = buf.len(), offset, "queueing write");
            self.pending_writes.push_back(QueuedWrite { buf, offset });
            return true;
        }
        self.writing = true;
        file.write(WriteRequest { buf, offset });
        true
    }

    /// Submit a read of `len` bytes at absolute file offset `offset`.
    ///
    /// At most one read may be queued while the handle is not ready;
    /// submitting a second is a contract violation. Returns false if the
    /// session is already dead (the callback is dropped uninvoked).
    pub fn read(&mut self, len: usize, offset: u64, callback: ReadCallback) -> bool {
        assert!(
            self.inflight_read.is_none() && !self.reading,
            "read submitted while one is in flight"
        );
        assert!(!self.closing, "read submitted after close was requested");
        if self.closed || self.file_error() {
            return false;
        }
        let file = self.file.as_ref().expect("no file attached").clone();
        if !file.can_read() {
            assert!(
                self.pending_read.is_none(),
                "second read queued on one disk session"
            );
            trace!(len, offset, "queueing read");
            self.pending_read = Some(QueuedRead {
                len,
                offset,
                callback,
            });
            return true;
        }
        self.inflight_read = Some(callback);
        self.reading = true;
        file.read(ReadRequest { len, offset });
        true
    }

    /// Request a close. Deferred until all in-flight and queued I/O for
    /// the session has drained; the owner callback fires on completion.
    pub fn close(&mut self) {
        if self.closing || self.closed {
            return;
        }
        debug!(offset = self.offset, "closing disk session");
        self.closing = true;
        self.maybe_finish_close();
    }

    fn file_error(&self) -> bool {
        self.file.as_ref().is_some_and(|f| f.error())
    }

    fn io_pending(&self) -> bool {
        self.opening
            || self.creating
            || self.reading
            || self.writing
            || self.pending_read.is_some()
            || !self.pending_writes.is_empty()
            || self.file.as_ref().is_some_and(|f| f.io_in_progress())
    }

    fn maybe_finish_close(&mut self) {
        if !self.closing || self.close_issued || self.closed {
            return;
        }
        if self.io_pending() {
            return;
        }
        self.close_issued = true;
        self.file.as_ref().expect("no file attached").close();
    }

    fn kick_write_queue(&mut self) -> bool {
        let Some(q) = self.pending_writes.pop_front() else {
            return false;
        };
        debug!(len = q.buf.len(), offset = q.offset, "writing queued chunk");
        let file = self.file.as_ref().expect("no file attached").clone();
        debug_assert!(file.can_write());
        self.writing = true;
        file.write(WriteRequest {
            buf: q.buf,
            offset: q.offset,
        });
        true
    }

    fn kick_read_queue(&mut self) -> bool {
        let Some(q) = self.pending_read.take() else {
            return false;
        };
        debug!(len = q.len, offset = q.offset, "issuing queued read");
        let file = self.file.as_ref().expect("no file attached").clone();
        debug_assert!(file.can_read());
        self.inflight_read = Some(q.callback);
        self.reading = true;
        file.read(ReadRequest {
            len: q.len,
            offset: q.offset,
        });
        true
    }

    /// Report the session error to the owner (once) and switch to closing.
    fn error_action(&mut self, e: StoreError) -> Action {
        debug!(error = %e, "disk session error");
        self.pending_writes.clear();
        self.pending_read = None;
        self.closing = true;
        self.maybe_finish_close();
        match self.callback.take() {
            Some(cb) => Action::Close(cb, Err(e)),
            None => Action::None,
        }
    }

    fn open_done(&mut self) -> Action {
        if self.file_error() {
            return self.error_action(StoreError::DiskError);
        }
        match self.mode {
            // service the write backlog; completions keep draining it
            IoMode::Write => {
                self.kick_write_queue();
            }
            IoMode::Read => {
                if !self.closing {
                    self.kick_read_queue();
                }
            }
        }
        self.maybe_finish_close();
        Action::None
    }

    fn on_io_completed(&mut self) -> Action {
        if self.closed {
            return Action::None;
        }
        if self.opening {
            self.opening = false;
            trace!("open completed");
            return self.open_done();
        }
        if self.creating {
            self.creating = false;
            trace!("create completed");
            return self.open_done();
        }
        // a notification outside open/create means the backend hit an error
        assert!(self.file_error());
        self.error_action(StoreError::DiskError)
    }

    fn on_read_completed(&mut self, buf: Bytes, result: StoreResult<()>) -> Action {
        if self.closed {
            return Action::None;
        }
        self.reading = false;
        let cb = self.inflight_read.take();
        match result {
            Ok(()) => {
                self.offset += buf.len() as u64;
                if self.closing {
                    // reader gone; drop the data and finish the close
                    self.maybe_finish_close();
                    Action::None
                } else {
                    match cb {
                        Some(cb) => Action::Read(cb, Ok(buf)),
                        None => Action::None,
                    }
                }
            }
            Err(e) => {
                // the reader learns now; the owner learns via the close
                // callback, which will carry the sticky error
                self.pending_read = None;
                self.closing = true;
                self.maybe_finish_close();
                match cb {
                    Some(cb) => Action::Read(cb, Err(e)),
                    None => Action::None,
                }
            }
        }
    }

    fn on_write_completed(&mut self, result: StoreResult<()>, len: u64) -> Action {
        if self.closed {
            return Action::None;
        }
        self.writing = false;
        match result {
            Ok(()) => self.offset += len,
            Err(e) => return self.error_action(e),
        }
        if self.file_error() {
            return self.error_action(StoreError::DiskError);
        }
        if !self.write_kicking {
            self.write_kicking = true;
            // drain the backlog while the handle stays ready
            while self.kick_write_queue() {
                if self.file.as_ref().is_some_and(|f| f.io_in_progress()) {
                    break;
                }
            }
            self.write_kicking = false;
        }
        self.maybe_finish_close();
        Action::None
    }

    fn on_close_completed(&mut self) -> Action {
        if self.closed {
            return Action::None;
        }
        debug!(offset = self.offset, "disk session closed");
        let err = self.file_error();
        self.closing = false;
        self.closed = true;
        self.file = None;
        match self.callback.take() {
            Some(cb) => Action::Close(cb, if err { Err(StoreError::DiskError) } else { Ok(()) }),
            None => Action::None,
        }
    }

    fn run_action(action: Action) {
        match action {
            Action::None => {}
            Action::Read(cb, result) => cb(result),
            Action::Close(cb, result) => cb(result),
        }
    }

    /// Open/create completion (or backend error notification).
    pub(crate) fn notify_io_completed(this: &Rc<RefCell<Self>>) {
        let action = this.borrow_mut().on_io_completed();
        Self::run_action(action);
    }

    /// Read completion.
    pub(crate) fn notify_read_completed(
        this: &Rc<RefCell<Self>>,
        buf: Bytes,
        result: StoreResult<()>,
    ) {
        let action = this.borrow_mut().on_read_completed(buf, result);
        Self::run_action(action);
    }

    /// Write completion.
    pub(crate) fn notify_write_completed(
        this: &Rc<RefCell<Self>>,
        result: StoreResult<()>,
        len: u64,
    ) {
        let action = this.borrow_mut().on_write_completed(result, len);
        Self::run_action(action);
    }

    /// Close completion.
    pub(crate) fn notify_close_completed(this: &Rc<RefCell<Self>>) {
        let action = this.borrow_mut().on_close_completed();
        Self::run_action(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::file::BlockingFile;
    use crate::disk::scheduler::IoScheduler;
    use tempfile::tempdir;

    struct Session {
        _dir: tempfile::TempDir,
        sched: Rc<IoScheduler>,
        io: Rc<RefCell<IoState>>,
        result: Rc<RefCell<Option<StoreResult<()>>>>,
    }

    fn write_session() -> Session {
        session(IoMode::Write, "obj")
    }

    fn session(mode: IoMode, name: &str) -> Session {
        let dir = tempdir().expect("tempdir");
        let sched = Rc::new(IoScheduler::new());
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let io = IoState::new(
            mode,
            Box::new(move |r| {
                *result2.borrow_mut() = Some(r);
            }),
        );
        let file = BlockingFile::new(dir.path().join(name), sched.clone(), Rc::downgrade(&io));
        io.borrow_mut().attach_file(file.clone());
        match mode {
            IoMode::Write => file.create(),
            IoMode::Read => file.open(),
        }
        Session {
            _dir: dir,
            sched,
            io,
            result,
        }
    }

    #[test]
    fn test_writes_queued_before_create_apply_in_order() {
        let s = write_session();
        // create has not been dispatched yet; both writes must queue
        assert!(s.io.borrow_mut().write(Bytes::from(vec![b'a'; 8]), 0));
        assert!(s.io.borrow_mut().write(Bytes::from(vec![b'b'; 8]), 8));
        s.sched.run();
        assert_eq!(s.io.borrow().offset(), 16);

        s.io.borrow_mut().close();
        s.sched.run();
        assert!(s.io.borrow().is_closed());
        assert_eq!(*s.result.borrow(), Some(Ok(())));

        let path = s._dir.path().join("obj");
        let data = std::fs::read(path).unwrap();
        assert_eq!(&data[..8], b"aaaaaaaa");
        assert_eq!(&data[8..], b"bbbbbbbb");
    }

    #[test]
    fn test_close_waits_for_inflight_write() {
        let s = write_session();
        s.sched.run(); // create completes, handle ready
        assert!(s.io.borrow_mut().write(Bytes::from_static(b"payload"), 0));
        // write is in flight (deferred); request the close now
        s.io.borrow_mut().close();
        assert!(!s.io.borrow().is_closed());
        // first step completes the write; the close must not have fired yet
        s.sched.step();
        assert_eq!(s.io.borrow().offset(), 7);
        assert!(!s.io.borrow().is_closed());
        assert!(s.result.borrow().is_none());
        // remaining steps dispatch the deferred close
        s.sched.run();
        assert!(s.io.borrow().is_closed());
        assert_eq!(*s.result.borrow(), Some(Ok(())));
    }

    #[test]
    #[should_panic(expected = "second read queued")]
    fn test_second_queued_read_is_rejected() {
        let s = session(IoMode::Read, "missing");
        // handle not ready: first read queues, second must panic
        let mut io = s.io.borrow_mut();
        io.read(16, 0, Box::new(|_| {}));
        io.read(16, 16, Box::new(|_| {}));
    }

    #[test]
    #[should_panic(expected = "after close was requested")]
    fn test_write_after_close_is_rejected() {
        let s = write_session();
        s.sched.run();
        s.io.borrow_mut().close();
        s.io.borrow_mut().write(Bytes::from_static(b"late"), 0);
    }

    #[test]
    fn test_open_failure_reports_disk_error_once() {
        let s = session(IoMode::Read, "does_not_exist");
        s.sched.run();
        assert_eq!(*s.result.borrow(), Some(Err(StoreError::DiskError)));
        // the deferred file close completes without a second report
        *s.result.borrow_mut() = None;
        s.sched.run();
        assert!(s.result.borrow().is_none());
    }

    #[test]
    fn test_queued_read_serviced_after_open() {
        let r = session(IoMode::Read, "obj2");
        std::fs::write(r._dir.path().join("obj2"), b"0123456789").unwrap();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        r.io.borrow_mut().read(
            4,
            2,
            Box::new(move |res| {
                *got2.borrow_mut() = Some(res);
            }),
        );
        // the read was queued behind the open; dispatch everything
        r.sched.run();
        let got = got.borrow_mut().take().unwrap().unwrap();
        assert_eq!(got.as_ref(), b"2345");
    }
}
