//! Stackful fibers
//!
//! A [`Fiber`] is a unit of cooperative execution with its own stack and
//! saved register context. Control moves between fibers only through
//! explicit switches:
//!
//! ```text
//! Init --swap_in--> Exec --+--> Hold   --swap_in--> Exec
//!                          +--> Ready  --swap_in--> Exec
//!                          +--> Term   --reset----> Init
//!                          +--> Except --reset----> Init
//! ```
//!
//! A panic inside the callback never crosses a context switch: it is caught
//! at the fiber entry point and recorded as a [`FiberPanic`] outcome, and the
//! fiber ends in [`FiberState::Except`]. Broken switching invariants (a
//! resume from the wrong fiber, a fiber resumed twice, a failed context
//! capture) abort the process instead.

mod context;
mod stack;

pub use stack::{
    HeapStackAllocator, MmapStackAllocator, PooledStackAllocator, StackAllocator, StackOptions,
};

use crate::local;
use crate::util;
use context::Context;
use parking_lot::Mutex;
use stack::Stack;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

/// Boxed fiber body
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Fallback stack policy for fibers created outside any scheduler
static DEFAULT_STACK_OPTIONS: OnceLock<StackOptions> = OnceLock::new();

/// Execution state of a fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never resumed
    Init = 0,
    /// Yielded and wants to be rescheduled
    Ready = 1,
    /// Executing on some thread
    Exec = 2,
    /// Paused; resumed when something reschedules it
    Hold = 3,
    /// Callback returned
    Term = 4,
    /// Callback panicked
    Except = 5,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }

    /// Whether the callback has finished, normally or not
    pub fn is_finished(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }
}

/// What kind of execution context a fiber stands for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kind {
    /// A thread's native stack
    Root,
    /// Ordinary fiber; finishing returns to the thread's main fiber
    Task,
    /// Scheduler loop on the caller thread; finishing returns to the root
    Scheduler,
}

/// Outcome of a fiber whose callback panicked
#[derive(Debug, Clone, thiserror::Error)]
#[error("fiber {fiber} panicked: {message}")]
pub struct FiberPanic {
    /// Id of the failed fiber
    pub fiber: u64,
    /// Panic payload rendered as text
    pub message: String,
    /// Stack captured where the panic was caught
    pub backtrace: Arc<Backtrace>,
}

/// A stackful coroutine
pub struct Fiber {
    /// Process-wide unique id
    id: u64,

    kind: Kind,

    /// Current `FiberState`
    state: AtomicU8,

    /// Set while some thread is executing on this fiber's context, from the
    /// moment it is switched to until the resumer regains control.
    on_cpu: AtomicBool,

    /// Saved registers; touched only by the thread switching into or out of
    /// this fiber, which `on_cpu` makes exclusive.
    ctx: UnsafeCell<Context>,

    /// Owned stack; `None` for root fibers
    stack: UnsafeCell<Option<Stack>>,

    /// Body, taken when the fiber starts
    callback: Mutex<Option<Callback>>,

    /// Recorded when the body panics
    failure: Mutex<Option<FiberPanic>>,
}

// SAFETY: the UnsafeCell fields are only accessed by the single thread that
// currently owns the fiber's execution (guarded by `on_cpu`), or while the
// fiber is finished/unstarted and therefore not executing anywhere.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `f` on a stack of the default size.
    ///
    /// The default comes from the current thread's scheduler, or from the
    /// process-wide default (1 MiB) outside any scheduler.
    ///
    /// # Panics
    /// If the stack cannot be allocated or the context cannot be captured.
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(f, 0)
    }

    /// Create a fiber with an explicit stack size (0 selects the default)
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_options(f, stack_size, &default_stack_options())
    }

    /// Create a fiber using the given stack policy
    pub fn with_options<F>(f: F, stack_size: usize, options: &StackOptions) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self::build(Box::new(f), stack_size, options, Kind::Task))
    }

    /// Scheduler loop fiber for caller-thread mode
    pub(crate) fn new_scheduler(f: Callback, options: &StackOptions) -> Arc<Fiber> {
        Arc::new(Self::build(f, 0, options, Kind::Scheduler))
    }

    pub(crate) fn from_callback(f: Callback, options: &StackOptions) -> Arc<Fiber> {
        Arc::new(Self::build(f, 0, options, Kind::Task))
    }

    fn build(callback: Callback, stack_size: usize, options: &StackOptions, kind: Kind) -> Fiber {
        let stack = options
            .allocate(stack_size)
            .unwrap_or_else(|e| panic!("failed to allocate fiber stack: {e}"));
        let ctx = Context::new(&stack, fiber_main).unwrap_or_else(|e| {
            util::fatal(format_args!("failed to capture fiber context: {e}"))
        });

        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fiber = id, stack_size = stack.size(), "fiber created");

        Fiber {
            id,
            kind,
            state: AtomicU8::new(FiberState::Init as u8),
            on_cpu: AtomicBool::new(false),
            ctx: UnsafeCell::new(ctx),
            stack: UnsafeCell::new(Some(stack)),
            callback: Mutex::new(Some(callback)),
            failure: Mutex::new(None),
        }
    }

    /// Fiber for a thread's native stack: no stack of its own, already running
    pub(crate) fn new_root() -> Fiber {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fiber = id, "root fiber created");

        Fiber {
            id,
            kind: Kind::Root,
            state: AtomicU8::new(FiberState::Exec as u8),
            on_cpu: AtomicBool::new(true),
            ctx: UnsafeCell::new(Context::empty()),
            stack: UnsafeCell::new(None),
            callback: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    /// Unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether this fiber stands for a thread's native stack
    pub fn is_root(&self) -> bool {
        self.kind == Kind::Root
    }

    /// Whether some thread is currently executing on this fiber's context
    pub(crate) fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    /// Panic outcome, if the callback panicked
    pub fn failure(&self) -> Option<FiberPanic> {
        self.failure.lock().clone()
    }

    /// Reuse this fiber's stack for a new callback.
    ///
    /// # Panics
    /// If the fiber is a root fiber or is not in `Init`, `Term` or `Except`.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&self, callback: Callback) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "fiber {} reset in state {:?}",
            self.id,
            state
        );
        assert!(!self.is_on_cpu(), "fiber {} reset while executing", self.id);

        // SAFETY: the fiber is not executing anywhere (checked above), so no
        // other thread touches its stack or context.
        unsafe {
            let stack = (*self.stack.get())
                .as_ref()
                .unwrap_or_else(|| panic!("root fiber {} cannot be reset", self.id));
            if let Err(e) = (*self.ctx.get()).prepare(stack, fiber_main) {
                util::fatal(format_args!("failed to capture fiber context: {e}"));
            }
        }

        *self.callback.lock() = Some(callback);
        *self.failure.lock() = None;
        self.set_state(FiberState::Init);
    }

    /// Switch from the thread's main fiber into this fiber.
    ///
    /// Returns when this fiber yields or finishes. Resuming a finished fiber
    /// is refused with a warning; its callback never runs twice.
    ///
    /// # Aborts
    /// If the fiber is already executing, or the caller is not the thread's
    /// main fiber (the scheduler loop, or the root fiber outside a scheduler).
    pub fn swap_in(self: &Arc<Self>) {
        let state = self.state();
        if state == FiberState::Exec {
            util::fatal(format_args!("fiber {} is already executing", self.id));
        }
        if state.is_finished() {
            tracing::warn!(fiber = self.id, ?state, "refusing to resume a finished fiber");
            return;
        }

        let main = local::main_fiber();
        let current = local::current_fiber();
        if !Arc::ptr_eq(&current, &main) {
            util::fatal(format_args!(
                "fiber {} resumed from fiber {} instead of the thread's main fiber {}",
                self.id, current.id, main.id
            ));
        }
        drop(current);

        self.resume_from(&main);
    }

    /// Resume from the scheduler loop; returns the state the fiber left in.
    ///
    /// A fiber that switched out without setting a state is parked as `Hold`.
    /// The state is read while the fiber is still owned by this thread, so a
    /// concurrent resume elsewhere cannot be mistaken for it.
    pub(crate) fn resume(self: &Arc<Self>) -> FiberState {
        let state = self.state();
        if state.is_finished() {
            return state;
        }
        let main = local::main_fiber();
        self.resume_from(&main)
    }

    /// Switch from this fiber back to the thread's main fiber.
    ///
    /// The state is left untouched; callers set it first.
    #[inline(never)]
    pub fn swap_out(&self) {
        let main = local::main_fiber();
        let to: *const Context = main.ctx.get();
        // The thread context keeps `main` alive; nothing of it stays on this stack.
        local::set_current_fiber(main);
        // SAFETY: `self` is the running fiber; `to` was saved by resume_from.
        unsafe { Context::switch(self.ctx.get(), to) };
    }

    /// Enter the caller-thread scheduler fiber from the thread's root
    pub(crate) fn call(self: &Arc<Self>) {
        let root = local::root_fiber();
        if !Arc::ptr_eq(&local::current_fiber(), &root) {
            util::fatal(format_args!(
                "scheduler fiber {} entered from inside another fiber",
                self.id
            ));
        }
        self.resume_from(&root);
    }

    /// Leave the caller-thread scheduler fiber back to the thread's root
    #[inline(never)]
    pub(crate) fn back(&self) {
        let root = local::root_fiber();
        let to: *const Context = root.ctx.get();
        local::set_current_fiber(root);
        // SAFETY: as in swap_out; `to` was saved by `call`.
        unsafe { Context::switch(self.ctx.get(), to) };
    }

    #[inline(never)]
    fn resume_from(self: &Arc<Self>, from: &Arc<Fiber>) -> FiberState {
        let was_on_cpu = self.on_cpu.swap(true, Ordering::AcqRel);
        if was_on_cpu {
            util::fatal(format_args!(
                "fiber {} is still running on another thread",
                self.id
            ));
        }

        self.set_state(FiberState::Exec);
        local::set_current_fiber(self.clone());

        // SAFETY: `from` is the running fiber on this thread; `self` holds a
        // prepared or saved context and is exclusively ours (on_cpu).
        unsafe { Context::switch(from.ctx.get(), self.ctx.get()) };

        local::set_current_fiber(from.clone());
        let state = match self.state() {
            FiberState::Exec => {
                self.set_state(FiberState::Hold);
                FiberState::Hold
            }
            other => other,
        };
        self.on_cpu.store(false, Ordering::Release);
        state
    }

    /// Body of the fiber entry point
    fn run_callback(&self) {
        let callback = self.callback.lock().take();
        let Some(callback) = callback else {
            self.set_state(FiberState::Term);
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(()) => self.set_state(FiberState::Term),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let backtrace = Arc::new(Backtrace::force_capture());
                tracing::error!(fiber = self.id, %message, "fiber panicked");
                tracing::debug!(fiber = self.id, backtrace = %backtrace, "fiber panic backtrace");
                *self.failure.lock() = Some(FiberPanic {
                    fiber: self.id,
                    message,
                    backtrace,
                });
                self.set_state(FiberState::Except);
            }
        }
    }

    /// The fiber running on this thread; installs the root fiber on first use
    pub fn current() -> Arc<Fiber> {
        local::current_fiber()
    }

    /// Id of the running fiber, 0 if this thread never touched the runtime
    pub fn current_id() -> u64 {
        local::current_fiber_id()
    }

    /// Mark the running fiber `Ready` and yield to the thread's main fiber
    pub fn yield_to_ready() {
        Self::yield_with(FiberState::Ready);
    }

    /// Mark the running fiber `Hold` and yield to the thread's main fiber
    pub fn yield_to_hold() {
        Self::yield_with(FiberState::Hold);
    }

    #[inline(never)]
    fn yield_with(state: FiberState) {
        let current = local::current_fiber();
        assert!(!current.is_root(), "yield called outside of a fiber");
        assert_eq!(current.state(), FiberState::Exec);
        current.set_state(state);

        // The resumer holds a reference for as long as we are switched out.
        let raw = Arc::as_ptr(&current);
        drop(current);
        // SAFETY: see above; `raw` stays valid until we are resumed.
        unsafe { (*raw).swap_out() };
    }

    /// Number of fibers alive in the process
    pub fn total_fibers() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if let Some(stack) = self.stack.get_mut().take() {
            if !matches!(state, FiberState::Init | FiberState::Term | FiberState::Except) {
                // Live frames are still on this stack; leak it rather than
                // free memory that is in use.
                tracing::warn!(fiber = self.id, ?state, "dropping suspended fiber, stack leaked");
                std::mem::forget(stack);
            }
        }
        tracing::trace!(fiber = self.id, "fiber dropped");
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

fn default_stack_options() -> StackOptions {
    match local::current_scheduler() {
        Some(scheduler) => scheduler.stack_options().clone(),
        None => DEFAULT_STACK_OPTIONS
            .get_or_init(StackOptions::default)
            .clone(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Entry point of every non-root fiber context
extern "C" fn fiber_main() {
    let fiber = local::current_fiber();
    fiber.run_callback();

    let kind = fiber.kind;
    let raw = Arc::as_ptr(&fiber);
    // Whoever resumed us still holds the fiber; drop our count so a finished
    // fiber's frame keeps nothing alive.
    drop(fiber);

    // SAFETY: `raw` is kept alive by the resumer until control returns to it.
    unsafe {
        match kind {
            Kind::Scheduler => (*raw).back(),
            _ => (*raw).swap_out(),
        }
    }

    // Finished fibers are never resumed without a reset.
    tracing::error!("finished fiber was resumed");
    std::process::abort();
}
