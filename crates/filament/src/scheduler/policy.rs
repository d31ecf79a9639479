//! Pluggable wake/idle behavior of a scheduler

use super::Scheduler;
use crate::fiber::Fiber;
use std::any::Any;
use std::sync::Arc;

/// How a scheduler's worker threads wait for work and get woken up
///
/// The scheduler calls into its policy at three points:
/// - `tickle` when new work may be waiting for an idle worker
/// - `stopping` to decide whether a shutdown may complete
/// - `idle` as the body of each worker's idle fiber
///
/// `idle` runs on a fiber. It must call [`Fiber::yield_to_hold`] whenever
/// the worker should re-check its queue, and return once `stopping` holds;
/// returning ends that worker's loop.
pub trait WaitPolicy: Send + Sync + 'static {
    /// Wake a worker that may be idle
    fn tickle(&self, scheduler: &Scheduler);

    /// Whether the scheduler may finish shutting down
    fn stopping(&self, scheduler: &Scheduler) -> bool;

    /// Wait for work on the calling worker thread
    fn idle(&self, scheduler: &Scheduler);

    /// Upcast for recovering the concrete policy from a scheduler
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Spin-yield policy: idle workers poll the queue
#[derive(Debug, Default, Clone, Copy)]
pub struct BusyWait;

impl WaitPolicy for BusyWait {
    fn tickle(&self, scheduler: &Scheduler) {
        tracing::trace!(scheduler = %scheduler.name(), "tickle");
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.base_stopping()
    }

    fn idle(&self, scheduler: &Scheduler) {
        tracing::debug!(scheduler = %scheduler.name(), "idle");
        while !scheduler.stopping() {
            std::thread::yield_now();
            Fiber::yield_to_hold();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
