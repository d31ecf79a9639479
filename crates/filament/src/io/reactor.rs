//! Epoll reactor: the wait policy behind `IoManager`
//!
//! Idle workers block in `epoll_wait` on one shared epoll instance. A pipe
//! registered edge-triggered serves as the tickle channel; expired timers
//! and ready descriptors turn into tasks on the scheduler queue.

use super::event::Event;
use super::fd_context::{Continuation, FdContext, Fired};
use super::timer::{TimerCallback, TimerHandle, TimerQueue};
use crate::config::IoConfig;
use crate::error::{Error, Result};
use crate::fiber::{Callback, Fiber, FiberState};
use crate::scheduler::{Scheduler, Task, WaitPolicy};
use crate::util;
use parking_lot::RwLock;
use std::any::Any;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Epoll instance, tickle pipe, descriptor table and timers
pub struct Reactor {
    epfd: OwnedFd,
    tickle_rx: OwnedFd,
    tickle_tx: OwnedFd,

    /// Armed events not yet fired or removed
    pending: AtomicUsize,

    /// Indexed by descriptor; grows on demand
    fds: RwLock<Vec<Arc<FdContext>>>,

    timers: Arc<TimerQueue>,

    config: IoConfig,
}

impl Reactor {
    pub(crate) fn new(config: IoConfig) -> Result<Self> {
        // SAFETY: plain syscalls; every returned descriptor is wrapped in an
        // OwnedFd right away so it is closed on any later error.
        let epfd = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            OwnedFd::from_raw_fd(fd)
        };

        let (tickle_rx, tickle_tx) = unsafe {
            let mut pipe = [0; 2];
            if libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) != 0 {
                return Err(io::Error::last_os_error().into());
            }
            (OwnedFd::from_raw_fd(pipe[0]), OwnedFd::from_raw_fd(pipe[1]))
        };

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_rx.as_raw_fd() as u64,
        };
        // SAFETY: both descriptors are open and owned by us.
        let rc = unsafe {
            libc::epoll_ctl(
                epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                tickle_rx.as_raw_fd(),
                &mut ev,
            )
        };
        if rc != 0 {
            return Err(Error::Epoll {
                op: "ADD",
                fd: tickle_rx.as_raw_fd(),
                source: io::Error::last_os_error(),
            });
        }

        let fds = (0..config.initial_fd_capacity)
            .map(|fd| Arc::new(FdContext::new(fd as RawFd)))
            .collect();

        Ok(Self {
            epfd,
            tickle_rx,
            tickle_tx,
            pending: AtomicUsize::new(0),
            fds: RwLock::new(fds),
            timers: TimerQueue::new(),
            config,
        })
    }

    /// Armed events that have neither fired nor been removed
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Current size of the descriptor table
    pub fn fd_capacity(&self) -> usize {
        self.fds.read().len()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        self.fds.read().get(index).cloned()
    }

    /// Context for `fd`, growing the table so that `fd` is in bounds
    fn context(&self, fd: RawFd) -> Result<Arc<FdContext>> {
        let index = usize::try_from(fd)
            .map_err(|_| Error::Io(io::Error::from_raw_os_error(libc::EBADF)))?;
        if let Some(ctx) = self.fds.read().get(index) {
            return Ok(ctx.clone());
        }

        let mut fds = self.fds.write();
        if index >= fds.len() {
            let len = (fds.len() + fds.len() / 2).max(index + 1);
            let start = fds.len();
            fds.extend((start..len).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
            tracing::trace!(fd, capacity = len, "descriptor table grown");
        }
        Ok(fds[index].clone())
    }

    /// Point epoll at exactly `events` for `fd`: ADD, MOD or DEL as needed.
    fn update_interest(&self, fd: RawFd, before: Event, after: Event) -> Result<()> {
        let (op, name) = if after.is_empty() {
            (libc::EPOLL_CTL_DEL, "DEL")
        } else if before.is_empty() {
            (libc::EPOLL_CTL_ADD, "ADD")
        } else {
            (libc::EPOLL_CTL_MOD, "MOD")
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | after.to_epoll(),
            u64: fd as u64,
        };
        // SAFETY: epfd is open; a stale fd only makes the call fail.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc != 0 {
            let source = io::Error::last_os_error();
            tracing::error!(fd, op = name, ?before, ?after, error = %source, "epoll_ctl failed");
            return Err(Error::Epoll { op: name, fd, source });
        }
        Ok(())
    }

    /// Arm `event` on `fd` with the given continuation.
    ///
    /// # Panics
    /// If `event` is not exactly one of READ/WRITE.
    ///
    /// Arming an event that is already armed aborts the process.
    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        continuation: Continuation,
    ) -> Result<()> {
        assert!(event.is_single(), "add_event takes READ or WRITE, got {event:?}");
        let ctx = self.context(fd)?;
        let mut state = ctx.state.lock();

        if state.events.contains(event) {
            tracing::error!(fd, ?event, armed = ?state.events, "event armed twice");
            util::fatal(format_args!("event {event:?} already armed on fd {fd}"));
        }

        let before = state.events;
        self.update_interest(fd, before, before | event)?;
        self.pending.fetch_add(1, Ordering::AcqRel);

        let scheduler = Scheduler::current()
            .map(|s| Arc::downgrade(&s))
            .unwrap_or_default();
        state.arm(event, scheduler, continuation);
        tracing::trace!(fd, ?event, "event armed");
        Ok(())
    }

    /// Continuation resuming the calling fiber
    pub(crate) fn park_current(cancelled: Arc<AtomicBool>) -> Continuation {
        let fiber = Fiber::current();
        assert!(
            !fiber.is_root() && fiber.state() == FiberState::Exec,
            "waiting on an event requires a running fiber"
        );
        Continuation::Fiber { fiber, cancelled }
    }

    /// Continuation running `callback`
    pub(crate) fn callback(callback: Callback) -> Continuation {
        Continuation::Callback(callback)
    }

    /// Disarm `event` on `fd` without running its continuation
    pub(crate) fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if !state.events.intersects(event) {
            return false;
        }
        let before = state.events;
        let disarm = before & event;
        if self.update_interest(fd, before, before - disarm).is_err() {
            return false;
        }
        for single in [Event::READ, Event::WRITE] {
            if disarm.contains(single) {
                state.clear(single);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        tracing::trace!(fd, ?disarm, "event removed");
        true
    }

    /// Disarm `events` on `fd` and run their continuations as cancelled
    pub(crate) fn cancel_event(&self, fd: RawFd, events: Event, fallback: &Scheduler) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let fired = {
            let mut state = ctx.state.lock();
            let before = state.events;
            let cancel = before & events;
            if cancel.is_empty() {
                return false;
            }
            if self.update_interest(fd, before, before - cancel).is_err() {
                return false;
            }
            let mut fired = Vec::with_capacity(2);
            for single in [Event::READ, Event::WRITE] {
                if cancel.contains(single) {
                    fired.extend(state.trigger(single, true));
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }
            fired
        };
        tracing::trace!(fd, ?events, count = fired.len(), "events cancelled");
        for fired in fired {
            fired.dispatch(fallback);
        }
        true
    }

    /// Arm a timer; wakes a blocked worker if it became the earliest one
    pub(crate) fn add_timer(
        &self,
        scheduler: &Scheduler,
        delay: Duration,
        callback: TimerCallback,
        recurring: bool,
    ) -> TimerHandle {
        let (handle, at_front) = self.timers.add(delay, callback, recurring);
        if at_front {
            self.tickle(scheduler);
        }
        handle
    }

    pub(crate) fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    fn drain_tickles(&self) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: buf is valid for its length; the pipe is non-blocking.
            let n = unsafe {
                libc::read(self.tickle_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// `epoll_wait`, retried on EINTR
    fn wait(&self, events: &mut [libc::epoll_event], timeout: Duration) -> usize {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            // SAFETY: `events` is a valid buffer of the given length.
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            };
            if n >= 0 {
                return n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!(error = %err, "epoll_wait failed");
                return 0;
            }
        }
    }

    /// Handle one epoll report for `fd`; returns the continuations to run
    fn ready(&self, fd: RawFd, bits: u32) -> Vec<Fired> {
        let Some(ctx) = self.lookup(fd) else {
            return Vec::new();
        };
        let mut state = ctx.state.lock();
        let before = state.events;
        let fired = Event::from_epoll(bits) & before;
        if fired.is_empty() {
            return Vec::new();
        }
        if self.update_interest(ctx.fd, before, before - fired).is_err() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(2);
        for single in [Event::READ, Event::WRITE] {
            if fired.contains(single) {
                out.extend(state.trigger(single, false));
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        out
    }
}

impl WaitPolicy for Reactor {
    fn tickle(&self, scheduler: &Scheduler) {
        if !scheduler.has_idle_threads() {
            return;
        }
        // SAFETY: writing one byte from a valid buffer to our own pipe.
        let n = unsafe { libc::write(self.tickle_tx.as_raw_fd(), b"T".as_ptr().cast(), 1) };
        if n != 1 {
            // A full pipe already guarantees a wakeup
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %err, "tickle write failed");
            }
        }
        tracing::trace!(scheduler = %scheduler.name(), "tickle");
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        !self.has_timers() && self.pending_events() == 0 && scheduler.base_stopping()
    }

    fn idle(&self, scheduler: &Scheduler) {
        tracing::debug!(scheduler = %scheduler.name(), "reactor idle");
        let empty = libc::epoll_event { events: 0, u64: 0 };
        let mut events = vec![empty; self.config.max_events.max(1)];
        let max_wait = Duration::from_millis(self.config.epoll_timeout_ms);
        let tickle_fd = self.tickle_rx.as_raw_fd();

        loop {
            if self.stopping(scheduler) {
                tracing::debug!(scheduler = %scheduler.name(), "reactor idle exits");
                break;
            }

            let timeout = self
                .timers
                .next_timeout()
                .map_or(max_wait, |next| next.min(max_wait));
            let n = self.wait(&mut events, timeout);

            let expired = self.timers.take_expired(Instant::now());
            if !expired.is_empty() {
                scheduler.schedule_all(
                    expired
                        .into_iter()
                        .map(|cb| Task::from_fn(move || cb())),
                );
            }

            for ev in &events[..n] {
                // Copy out of the (packed) epoll_event
                let (bits, data) = (ev.events, ev.u64);
                let fd = data as RawFd;
                if fd == tickle_fd {
                    self.drain_tickles();
                    continue;
                }
                for fired in self.ready(fd, bits) {
                    fired.dispatch(scheduler);
                }
            }

            Fiber::yield_to_hold();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("epfd", &self.epfd.as_raw_fd())
            .field("pending", &self.pending_events())
            .field("fd_capacity", &self.fd_capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reactor() -> Reactor {
        Reactor::new(IoConfig {
            initial_fd_capacity: 4,
            ..IoConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_table_grows_to_cover_fd() {
        let reactor = reactor();
        assert_eq!(reactor.fd_capacity(), 4);
        assert!(reactor.lookup(4).is_none());

        let ctx = reactor.context(4).unwrap();
        assert_eq!(ctx.fd, 4);
        assert!(reactor.fd_capacity() > 4);

        let ctx = reactor.context(100).unwrap();
        assert_eq!(ctx.fd, 100);
        assert_eq!(reactor.fd_capacity(), 101);
    }

    #[test]
    fn test_negative_fd_rejected() {
        let reactor = reactor();
        assert!(matches!(reactor.context(-1), Err(Error::Io(_))));
        assert!(!reactor.del_event(-1, Event::READ));
    }

    #[test]
    fn test_add_event_on_bad_fd_fails() {
        let reactor = reactor();
        // Regular files cannot be polled
        let file = tempfile::tempfile().unwrap();
        let err = reactor
            .add_event(file.as_raw_fd(), Event::READ, Reactor::callback(Box::new(|| {})))
            .unwrap_err();
        assert!(matches!(err, Error::Epoll { op: "ADD", .. }));
        assert_eq!(reactor.pending_events(), 0);
    }

    #[test]
    fn test_del_event_counts() {
        let reactor = reactor();
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        reactor
            .add_event(fd, Event::READ, Reactor::callback(Box::new(|| {})))
            .unwrap();
        reactor
            .add_event(fd, Event::WRITE, Reactor::callback(Box::new(|| {})))
            .unwrap();
        assert_eq!(reactor.pending_events(), 2);

        assert!(reactor.del_event(fd, Event::READ));
        assert!(!reactor.del_event(fd, Event::READ));
        assert_eq!(reactor.pending_events(), 1);
        assert!(reactor.del_event(fd, Event::WRITE));
        assert_eq!(reactor.pending_events(), 0);
    }
}
