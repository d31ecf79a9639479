//! Per-thread runtime context
//!
//! Every OS thread that touches the runtime owns one [`ThreadContext`]:
//! - `root`: the fiber standing for the thread's native stack
//! - `main`: the fiber a yielding fiber switches back to (the scheduler loop);
//!   falls back to `root` when no scheduler loop is running on the thread
//! - `current`: the fiber executing right now
//! - `scheduler`: the scheduler whose loop this thread runs
//!
//! Worker threads initialize it explicitly through [`enter_scheduler`];
//! any other thread gets a root fiber lazily on first use, so "current
//! fiber" is never empty after the first access.
//!
//! Accessors are `#[inline(never)]`: a fiber may resume on a different
//! thread, so a thread-local address must never be cached across a switch.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

pub(crate) struct ThreadContext {
    current: RefCell<Option<Arc<Fiber>>>,
    root: RefCell<Option<Arc<Fiber>>>,
    main: RefCell<Option<Arc<Fiber>>>,
    scheduler: RefCell<Weak<Scheduler>>,
}

thread_local! {
    static CONTEXT: ThreadContext = ThreadContext {
        current: RefCell::new(None),
        root: RefCell::new(None),
        main: RefCell::new(None),
        scheduler: RefCell::new(Weak::new()),
    };
}

impl ThreadContext {
    fn root_or_init(&self) -> Arc<Fiber> {
        if let Some(root) = self.root.borrow().as_ref() {
            return root.clone();
        }
        let root = Arc::new(Fiber::new_root());
        *self.root.borrow_mut() = Some(root.clone());
        let mut current = self.current.borrow_mut();
        if current.is_none() {
            *current = Some(root.clone());
        }
        root
    }
}

/// The running fiber, creating the root fiber on first access
#[inline(never)]
pub(crate) fn current_fiber() -> Arc<Fiber> {
    CONTEXT.with(|cx| {
        if let Some(fiber) = cx.current.borrow().as_ref() {
            return fiber.clone();
        }
        cx.root_or_init()
    })
}

#[inline(never)]
pub(crate) fn set_current_fiber(fiber: Arc<Fiber>) {
    CONTEXT.with(|cx| *cx.current.borrow_mut() = Some(fiber));
}

/// Id of the running fiber without creating a root fiber
#[inline(never)]
pub(crate) fn current_fiber_id() -> u64 {
    CONTEXT.with(|cx| cx.current.borrow().as_ref().map_or(0, |f| f.id()))
}

/// This thread's native-stack fiber
#[inline(never)]
pub(crate) fn root_fiber() -> Arc<Fiber> {
    CONTEXT.with(ThreadContext::root_or_init)
}

/// The fiber a yield returns to
#[inline(never)]
pub(crate) fn main_fiber() -> Arc<Fiber> {
    CONTEXT.with(|cx| {
        if let Some(main) = cx.main.borrow().as_ref() {
            return main.clone();
        }
        cx.root_or_init()
    })
}

#[inline(never)]
pub(crate) fn set_main_fiber(fiber: Option<Arc<Fiber>>) {
    CONTEXT.with(|cx| *cx.main.borrow_mut() = fiber);
}

#[inline(never)]
pub(crate) fn current_scheduler() -> Option<Arc<Scheduler>> {
    CONTEXT.with(|cx| cx.scheduler.borrow().upgrade())
}

#[inline(never)]
pub(crate) fn set_scheduler(scheduler: Weak<Scheduler>) {
    CONTEXT.with(|cx| *cx.scheduler.borrow_mut() = scheduler);
}

/// Whether the calling thread is bound to the scheduler at `scheduler`.
/// Compares addresses, so it also works while that scheduler is dropping.
#[inline(never)]
pub(crate) fn is_bound_to(scheduler: *const Scheduler) -> bool {
    CONTEXT
        .try_with(|cx| std::ptr::eq(cx.scheduler.borrow().as_ptr(), scheduler))
        .unwrap_or(false)
}

/// Bind the calling thread to `scheduler` and make the running fiber the
/// target of every yield on this thread.
pub(crate) fn enter_scheduler(scheduler: &Arc<Scheduler>) {
    set_scheduler(Arc::downgrade(scheduler));
    set_main_fiber(Some(current_fiber()));
}

/// Undo [`enter_scheduler`] when the loop exits
pub(crate) fn leave_scheduler() {
    set_main_fiber(None);
}
