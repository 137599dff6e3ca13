//! Deferred completion dispatch.
//!
//! The engine is single-threaded and cooperative: disk operations are
//! submitted as deferred tasks and their completions are delivered only
//! when the event loop runs the queue. State transitions therefore execute
//! to completion without preemption, and a caller holding a borrow on an
//! entry or I/O session can never be re-entered by a completion.

use std::cell::RefCell;
use std::collections::VecDeque;

type Task = Box<dyn FnOnce()>;

/// FIFO queue of deferred disk completion tasks.
///
/// One scheduler is shared by a store and every file handle it creates.
/// Tasks are dispatched in submission order by [`step`](Self::step) or
/// [`run`](Self::run), called from the owning event loop. Never call them
/// from inside a completion callback.
#[derive(Default)]
pub struct IoScheduler {
    queue: RefCell<VecDeque<Task>>,
}

impl IoScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task for later dispatch.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Run the oldest pending task. Returns false if none was pending.
    pub fn step(&self) -> bool {
        let task = self.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks queued by the
    /// tasks themselves. Returns the number dispatched.
    pub fn run(&self) -> usize {
        let mut dispatched = 0;
        while self.step() {
            dispatched += 1;
        }
        dispatched
    }
}
