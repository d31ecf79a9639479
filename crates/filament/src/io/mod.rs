//! Fiber-aware I/O: a scheduler whose idle workers wait on epoll
//!
//! [`IoManager`] owns a [`Scheduler`] running an epoll reactor as its
//! wait policy. A fiber blocks on a descriptor by arming an event and
//! yielding; when epoll reports the descriptor ready, the fiber (or a
//! callback) is put back on the queue.
//!
//! ```no_run
//! use filament::{Event, IoManager};
//! use std::os::fd::AsRawFd;
//!
//! let io = IoManager::new(2, false, "io").unwrap();
//! let (sock, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
//! let fd = sock.as_raw_fd();
//! io.spawn(move || {
//!     let io = IoManager::current().unwrap();
//!     io.wait(fd, Event::WRITE).unwrap();
//!     drop(sock);
//! });
//! io.stop();
//! ```

mod event;
mod fd_context;
mod reactor;
mod timer;

pub use event::Event;
pub use timer::TimerHandle;

use crate::config::{IoConfig, RuntimeConfig};
use crate::error::{Error, Result};
use crate::fiber::{Callback, Fiber};
use crate::scheduler::{Scheduler, SchedulerBuilder, Task, WaitPolicy};
use reactor::Reactor;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Clonable reference to a running I/O scheduler
///
/// Derefs to the underlying [`Scheduler`], so `schedule`, `spawn` and
/// friends are available directly.
#[derive(Clone)]
pub struct IoHandle {
    scheduler: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoHandle {
    /// Handle for the I/O scheduler the calling thread works for
    pub fn current() -> Option<IoHandle> {
        let scheduler = Scheduler::current()?;
        let reactor = scheduler
            .policy()
            .clone()
            .into_any()
            .downcast::<Reactor>()
            .ok()?;
        Some(IoHandle { scheduler, reactor })
    }

    /// Underlying scheduler
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Arm `event` on `fd`.
    ///
    /// With a callback, the callback is queued when the event fires.
    /// Without one, the calling fiber is captured and resumed instead; it
    /// is expected to yield right after (see [`wait`](Self::wait)).
    ///
    /// Fails with [`Error::Epoll`] if the kernel rejects the registration;
    /// nothing is armed in that case.
    ///
    /// # Panics
    /// If `event` is not exactly one of READ/WRITE, or if no callback is
    /// given outside a running fiber.
    ///
    /// # Aborts
    /// If `event` is already armed on `fd`.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<Callback>) -> Result<()> {
        let continuation = match callback {
            Some(callback) => Reactor::callback(callback),
            None => Reactor::park_current(Arc::new(AtomicBool::new(false))),
        };
        self.reactor.add_event(fd, event, continuation)
    }

    /// Block the calling fiber until `event` fires on `fd`.
    ///
    /// Returns [`Error::Cancelled`] if the wait was ended by
    /// [`cancel_event`](Self::cancel_event) or [`cancel_all`](Self::cancel_all).
    pub fn wait(&self, fd: RawFd, event: Event) -> Result<()> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.reactor
            .add_event(fd, event, Reactor::park_current(cancelled.clone()))?;
        Fiber::yield_to_hold();
        if cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled(fd));
        }
        Ok(())
    }

    /// Disarm `event` on `fd`; its continuation is dropped without running
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    /// Disarm `event` on `fd` and run its continuation now, as cancelled
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel_event(fd, event, &self.scheduler)
    }

    /// Cancel every armed event on `fd`
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor
            .cancel_event(fd, Event::READ | Event::WRITE, &self.scheduler)
    }

    /// Armed events that have neither fired nor been removed
    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    /// Run `callback` on this scheduler after `delay`, and every `delay`
    /// after that if `recurring`.
    ///
    /// Armed timers keep the scheduler from stopping; cancel recurring ones
    /// before calling `stop`.
    pub fn add_timer<F>(&self, delay: Duration, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor
            .add_timer(&self.scheduler, delay, Arc::new(callback), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs while
    /// `condition` is still alive.
    pub fn add_condition_timer<F, C>(
        &self,
        delay: Duration,
        callback: F,
        condition: Weak<C>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        self.add_timer(
            delay,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Suspend the calling fiber for at least `duration`.
    ///
    /// # Panics
    /// Outside a running fiber.
    pub fn sleep(&self, duration: Duration) {
        let fiber = Fiber::current();
        assert!(!fiber.is_root(), "sleep called outside of a fiber");

        let scheduler = Arc::downgrade(&self.scheduler);
        let slot = parking_lot::Mutex::new(Some(fiber));
        self.add_timer(
            duration,
            move || {
                let fiber = slot.lock().take();
                if let (Some(fiber), Some(scheduler)) = (fiber, scheduler.upgrade()) {
                    scheduler.schedule(Task::Fiber(fiber));
                }
            },
            false,
        );
        Fiber::yield_to_hold();
    }

    /// Whether `other` refers to the same scheduler
    pub fn ptr_eq(&self, other: &IoHandle) -> bool {
        Arc::ptr_eq(&self.scheduler, &other.scheduler)
    }
}

impl Deref for IoHandle {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle")
            .field("scheduler", &self.scheduler)
            .field("reactor", &self.reactor)
            .finish()
    }
}

/// Owning I/O scheduler: started on construction, stopped on drop
///
/// In caller mode it must be stopped (or dropped) on the thread that
/// created it.
pub struct IoManager {
    handle: IoHandle,
}

impl IoManager {
    /// Reactor with default settings and the given worker layout
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Result<IoManager> {
        Self::with_config(
            Scheduler::builder()
                .threads(threads)
                .use_caller(use_caller)
                .name(name),
            IoConfig::default(),
        )
    }

    /// Everything from a runtime config
    pub fn from_config(config: &RuntimeConfig) -> Result<IoManager> {
        config.validate()?;
        Self::with_config(SchedulerBuilder::from_config(config), config.io.clone())
    }

    /// Reactor settings plus a scheduler builder; the builder's wait policy
    /// is replaced by the reactor.
    pub fn with_config(builder: SchedulerBuilder, io: IoConfig) -> Result<IoManager> {
        let reactor = Arc::new(Reactor::new(io)?);
        let policy: Arc<dyn WaitPolicy> = reactor.clone();
        let scheduler = builder.policy(policy).build();
        let manager = IoManager {
            handle: IoHandle { scheduler, reactor },
        };
        manager.handle.scheduler.start()?;
        Ok(manager)
    }

    /// Handle for the I/O scheduler the calling thread works for
    pub fn current() -> Option<IoHandle> {
        IoHandle::current()
    }

    /// A clonable handle
    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    /// Stop the scheduler (see [`Scheduler::stop`]); idempotent
    pub fn stop(&self) {
        self.handle.scheduler.stop();
    }
}

impl Deref for IoManager {
    type Target = IoHandle;

    fn deref(&self) -> &IoHandle {
        &self.handle
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // Armed events of the failing code would keep stop() waiting forever
            tracing::warn!(scheduler = %self.handle.name(), "not stopping during a panic");
            return;
        }
        self.stop();
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}
