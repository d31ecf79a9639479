//! Per-descriptor event bookkeeping

use super::event::Event;
use crate::fiber::{Callback, Fiber};
use crate::scheduler::{Scheduler, Task};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// What runs when an armed event fires
pub(crate) enum Continuation {
    /// Resume a parked fiber; `cancelled` tells it why it woke up
    Fiber {
        fiber: Arc<Fiber>,
        cancelled: Arc<AtomicBool>,
    },
    /// Run a callback
    Callback(Callback),
}

impl Continuation {
    fn into_task(self, cancelled: bool) -> Task {
        match self {
            Continuation::Fiber {
                fiber,
                cancelled: flag,
            } => {
                flag.store(cancelled, Ordering::Release);
                Task::Fiber(fiber)
            }
            Continuation::Callback(callback) => Task::Callback(callback),
        }
    }
}

/// One armed direction of a descriptor
#[derive(Default)]
pub(crate) struct EventContext {
    /// Scheduler that armed the event; the reactor's own one if gone
    scheduler: Weak<Scheduler>,
    continuation: Option<Continuation>,
}

/// A fired continuation together with where to run it
pub(crate) struct Fired {
    scheduler: Option<Arc<Scheduler>>,
    task: Task,
}

impl Fired {
    /// Queue the continuation, on `fallback` if its scheduler is gone
    pub(crate) fn dispatch(self, fallback: &Scheduler) {
        match self.scheduler {
            Some(scheduler) => scheduler.schedule(self.task),
            None => fallback.schedule(self.task),
        }
    }
}

/// Armed events of one descriptor
#[derive(Default)]
pub(crate) struct FdState {
    /// Directions registered with epoll
    pub(crate) events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("invalid event {event:?}");
        }
    }

    /// Record the continuation for a newly armed `event`
    pub(crate) fn arm(
        &mut self,
        event: Event,
        scheduler: Weak<Scheduler>,
        continuation: Continuation,
    ) {
        self.events |= event;
        let slot = self.slot(event);
        debug_assert!(slot.continuation.is_none());
        slot.scheduler = scheduler;
        slot.continuation = Some(continuation);
    }

    /// Disarm `event` and drop its continuation without running it
    pub(crate) fn clear(&mut self, event: Event) {
        self.events.remove(event);
        *self.slot(event) = EventContext::default();
    }

    /// Disarm `event` and hand back its continuation to be scheduled
    pub(crate) fn trigger(&mut self, event: Event, cancelled: bool) -> Option<Fired> {
        assert!(
            self.events.contains(event),
            "triggering {event:?} which is not armed ({:?})",
            self.events
        );
        self.events.remove(event);
        let slot = std::mem::take(self.slot(event));
        let continuation = slot.continuation?;
        Some(Fired {
            scheduler: slot.scheduler.upgrade(),
            task: continuation.into_task(cancelled),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, event: Event) -> bool {
        match event {
            e if e == Event::READ => self.read.continuation.is_some(),
            e if e == Event::WRITE => self.write.continuation.is_some(),
            _ => false,
        }
    }
}

/// Bookkeeping for one descriptor; each has its own lock so descriptors
/// never contend with each other.
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback() -> Continuation {
        Continuation::Callback(Box::new(|| {}))
    }

    #[test]
    fn test_arm_and_trigger_one_direction() {
        let ctx = FdContext::new(5);
        let mut state = ctx.state.lock();
        state.arm(Event::READ, Weak::new(), callback());
        state.arm(Event::WRITE, Weak::new(), callback());
        assert_eq!(state.events, Event::READ | Event::WRITE);

        let fired = state.trigger(Event::WRITE, false).unwrap();
        assert!(matches!(fired.task, Task::Callback(_)));
        assert!(fired.scheduler.is_none());
        assert_eq!(state.events, Event::READ);
        assert!(state.is_armed(Event::READ));
        assert!(!state.is_armed(Event::WRITE));
    }

    #[test]
    fn test_clear_drops_continuation() {
        let mut state = FdState::default();
        state.arm(Event::READ, Weak::new(), callback());
        state.clear(Event::READ);
        assert_eq!(state.events, Event::NONE);
        assert!(!state.is_armed(Event::READ));
    }

    #[test]
    fn test_cancel_flag_reaches_fiber() {
        let fiber = Fiber::new(|| {});
        let flag = Arc::new(AtomicBool::new(false));
        let mut state = FdState::default();
        state.arm(
            Event::READ,
            Weak::new(),
            Continuation::Fiber {
                fiber: fiber.clone(),
                cancelled: flag.clone(),
            },
        );

        let fired = state.trigger(Event::READ, true).unwrap();
        assert!(flag.load(Ordering::Acquire));
        match fired.task {
            Task::Fiber(f) => assert!(Arc::ptr_eq(&f, &fiber)),
            Task::Callback(_) => panic!("expected fiber continuation"),
        }
    }

    #[test]
    #[should_panic(expected = "not armed")]
    fn test_trigger_unarmed_panics() {
        let mut state = FdState::default();
        state.trigger(Event::WRITE, false);
    }
}
