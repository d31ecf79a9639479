//! Units of work accepted by the scheduler

use crate::fiber::{Callback, Fiber};
use crate::util::Tid;
use std::fmt;
use std::sync::Arc;

/// Work handed to a [`Scheduler`](super::Scheduler)
///
/// A `Fiber` task is resumed where it left off; a `Callback` task runs on a
/// fiber the worker keeps for callbacks and reuses between them.
pub enum Task {
    /// Resume an existing fiber
    Fiber(Arc<Fiber>),

    /// Run a closure to completion
    Callback(Callback),
}

impl Task {
    /// Wrap a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Queue entry: a task and the thread it is pinned to, if any
pub(crate) struct Scheduled {
    pub(crate) task: Task,
    pub(crate) thread: Option<Tid>,
}

impl Scheduled {
    pub(crate) fn new(task: Task, thread: Option<Tid>) -> Self {
        Self { task, thread }
    }

    /// Whether the thread `tid` may take this entry
    pub(crate) fn runs_on(&self, tid: Tid) -> bool {
        self.thread.map_or(true, |pinned| pinned == tid)
    }

    /// A fiber still executing (or still switching out) cannot be resumed yet
    pub(crate) fn is_busy(&self) -> bool {
        match &self.task {
            Task::Fiber(fiber) => {
                fiber.state() == crate::fiber::FiberState::Exec || fiber.is_on_cpu()
            }
            Task::Callback(_) => false,
        }
    }
}
