//! Cooperative M:N scheduler
//!
//! A FIFO task queue shared by a fixed pool of worker threads. Each worker
//! runs the scheduler loop on its own main fiber and resumes one task at a
//! time; tasks may be pinned to a specific worker by kernel thread id.
//! Waiting and waking are delegated to a [`WaitPolicy`].

mod policy;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;

pub use policy::{BusyWait, WaitPolicy};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use task::Task;
