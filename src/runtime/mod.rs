//! Cooperative single-threaded runtime.
//!
//! Readiness-based model: tasks are explicit state machines driven one
//! step at a time. A step either completes the task or yields a wakeup
//! request ("resume me when fd N is readable/writable"); the scheduler
//! parks the task in the matching wait set, and when the ready queue
//! runs dry it polls the OS and moves every task whose fd came back
//! ready to the tail of the queue.
//!
//! Everything runs on one thread. A task runs uninterrupted between
//! suspension points, so the registry needs no synchronization; the only
//! fairness guarantee is FIFO order of the ready queue.

mod poller;

use poller::Poller;

use mio::Interest;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use tracing::{trace, warn};

/// Direction a suspended task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Send,
}

/// A task's request to be resumed once `fd` is ready in `direction`.
#[derive(Debug, Clone, Copy)]
pub struct Wakeup {
    pub direction: Direction,
    pub fd: RawFd,
}

impl Wakeup {
    pub fn readable(fd: RawFd) -> Self {
        Self {
            direction: Direction::Read,
            fd,
        }
    }

    pub fn writable(fd: RawFd) -> Self {
        Self {
            direction: Direction::Send,
            fd,
        }
    }
}

/// Outcome of driving a task one step.
pub enum Step {
    /// The task ran to completion and can be discarded.
    Done,
    /// The task suspended; resume it once the wakeup condition holds.
    Wait(Wakeup),
}

/// A resumable unit of sequential logic.
///
/// `step` is called once when the task first runs and once per resumption
/// after that. The task performs its own socket operations after being
/// resumed; readiness never guarantees the operation will succeed, so a
/// `WouldBlock` after resumption should simply re-issue the same wakeup.
///
/// Errors are fatal to the whole scheduler: there is no per-task failure
/// boundary in this design.
pub trait Task {
    fn step(&mut self, ctx: &mut Context) -> io::Result<Step>;
}

type BoxedTask = Box<dyn Task>;

/// Handed to each step so a running task can spawn new tasks.
///
/// Spawned tasks land at the tail of the ready queue once the current
/// step returns.
#[derive(Default)]
pub struct Context {
    spawned: Vec<BoxedTask>,
}

impl Context {
    pub fn spawn(&mut self, task: impl Task + 'static) {
        self.spawned.push(Box::new(task));
    }
}

/// The event loop: ready queue, two wait sets, and the poller.
///
/// One instance per process, constructed at startup and threaded into
/// everything that needs to spawn or wait. `run` drives all tasks to
/// completion and returns when no task is runnable and none is waiting.
pub struct Scheduler {
    ready: VecDeque<BoxedTask>,
    wait_read: HashMap<RawFd, BoxedTask>,
    wait_send: HashMap<RawFd, BoxedTask>,
    poller: Poller,
}

impl Scheduler {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            ready: VecDeque::new(),
            wait_read: HashMap::new(),
            wait_send: HashMap::new(),
            poller: Poller::new()?,
        })
    }

    /// Append a task to the tail of the ready queue.
    pub fn spawn(&mut self, task: impl Task + 'static) {
        self.ready.push_back(Box::new(task));
    }

    /// Run until no task is runnable and no task is waiting.
    ///
    /// Returns the first error raised by a task step or by the poller;
    /// all other tasks are abandoned at that point (no isolation).
    pub fn run(&mut self) -> io::Result<()> {
        let mut readable = Vec::new();
        let mut writable = Vec::new();

        while !self.ready.is_empty() || !self.wait_read.is_empty() || !self.wait_send.is_empty() {
            // Only block on the OS once there is no runnable work left.
            while self.ready.is_empty()
                && (!self.wait_read.is_empty() || !self.wait_send.is_empty())
            {
                readable.clear();
                writable.clear();
                self.poller.wait(&mut readable, &mut writable)?;

                // Read-ready handles drain before send-ready handles.
                for &fd in &readable {
                    if let Some(task) = self.wait_read.remove(&fd) {
                        self.poller.remove(fd, Interest::READABLE)?;
                        trace!(fd, "read-ready, task resumable");
                        self.ready.push_back(task);
                    }
                }
                for &fd in &writable {
                    if let Some(task) = self.wait_send.remove(&fd) {
                        self.poller.remove(fd, Interest::WRITABLE)?;
                        trace!(fd, "send-ready, task resumable");
                        self.ready.push_back(task);
                    }
                }
            }

            let Some(mut task) = self.ready.pop_front() else {
                // Both wait sets drained empty as well: all work finished.
                continue;
            };

            let mut ctx = Context::default();
            match task.step(&mut ctx)? {
                Step::Done => {}
                Step::Wait(Wakeup {
                    direction: Direction::Read,
                    fd,
                }) => {
                    self.poller.add(fd, Interest::READABLE)?;
                    if self.wait_read.insert(fd, task).is_some() {
                        // Last writer wins; the displaced task is never resumed.
                        warn!(fd, "read waiter replaced, previous task orphaned");
                    }
                }
                Step::Wait(Wakeup {
                    direction: Direction::Send,
                    fd,
                }) => {
                    self.poller.add(fd, Interest::WRITABLE)?;
                    if self.wait_send.insert(fd, task).is_some() {
                        warn!(fd, "send waiter replaced, previous task orphaned");
                    }
                }
            }

            for spawned in ctx.spawned {
                self.ready.push_back(spawned);
            }
        }

        Ok(())
    }
}
