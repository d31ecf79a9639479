//! The scheduler: task queue, worker pool and run loop

use super::policy::{BusyWait, WaitPolicy};
use super::task::{Scheduled, Task};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::fiber::{Fiber, FiberState, StackOptions};
use crate::local;
use crate::thread::Thread;
use crate::util::{self, Tid};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Builder for [`Scheduler`]
pub struct SchedulerBuilder {
    threads: usize,
    use_caller: bool,
    name: String,
    stack: StackOptions,
    policy: Arc<dyn WaitPolicy>,
}

impl SchedulerBuilder {
    /// One thread, caller participates, busy-wait policy, 1 MiB stacks
    pub fn new() -> Self {
        Self {
            threads: 1,
            use_caller: true,
            name: String::new(),
            stack: StackOptions::default(),
            policy: Arc::new(BusyWait),
        }
    }

    /// Settings from a runtime config
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new()
            .threads(config.scheduler.resolved_threads())
            .use_caller(config.scheduler.use_caller)
            .name(config.scheduler.name.clone())
            .stack_options(StackOptions::from_config(&config.fiber))
    }

    /// Total worker count, including the caller thread in caller mode
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Whether the building thread becomes one of the workers
    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    /// Name; worker threads are named `{name}_{index}`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stack policy for every fiber the scheduler creates
    pub fn stack_options(mut self, stack: StackOptions) -> Self {
        self.stack = stack;
        self
    }

    /// Wait policy
    pub fn policy(mut self, policy: Arc<dyn WaitPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Create the scheduler.
    ///
    /// In caller mode the calling thread is bound to the new scheduler
    /// immediately and one worker slot is taken by it.
    ///
    /// # Panics
    /// If `threads` is zero, or in caller mode when the calling thread
    /// already belongs to another scheduler.
    pub fn build(self) -> Arc<Scheduler> {
        assert!(self.threads > 0, "a scheduler needs at least one thread");

        let name = if self.name.is_empty() {
            String::from("scheduler")
        } else {
            self.name
        };

        let mut pool_threads = self.threads;
        let mut root_thread = None;
        if self.use_caller {
            assert!(
                local::current_scheduler().is_none(),
                "thread already belongs to a scheduler"
            );
            // Installs this thread's root fiber
            let _ = local::current_fiber();
            pool_threads -= 1;
            root_thread = Some(util::thread_id());
        }

        let stack = self.stack;
        let scheduler = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let root_fiber = root_thread.map(|_| {
                let weak = weak.clone();
                Fiber::new_scheduler(
                    Box::new(move || {
                        if let Some(scheduler) = weak.upgrade() {
                            scheduler.run();
                        }
                    }),
                    &stack,
                )
            });

            Scheduler {
                name,
                policy: self.policy,
                stack: stack.clone(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(root_thread.into_iter().collect()),
                pool_threads,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                root_thread,
                root_fiber,
            }
        });

        if root_thread.is_some() {
            local::set_scheduler(Arc::downgrade(&scheduler));
        }

        tracing::debug!(
            scheduler = %scheduler.name,
            threads = self.threads,
            use_caller = self.use_caller,
            "scheduler created"
        );
        scheduler
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexes fibers and callbacks over a pool of worker threads
///
/// Always used as `Arc<Scheduler>`: workers and the caller-thread loop hold
/// a reference for as long as they run.
pub struct Scheduler {
    name: String,

    policy: Arc<dyn WaitPolicy>,

    /// Stack policy for idle, callback and user fibers on this scheduler
    stack: StackOptions,

    /// FIFO task queue
    queue: Mutex<VecDeque<Scheduled>>,

    /// Pool threads, drained by `stop`
    threads: Mutex<Vec<Thread>>,

    /// Kernel ids of every worker, caller thread included
    thread_ids: Mutex<Vec<Tid>>,

    /// Threads spawned by `start` (excludes the caller thread)
    pool_threads: usize,

    /// Tasks currently being run
    active: AtomicUsize,

    /// Workers currently inside their idle fiber
    idle: AtomicUsize,

    started: AtomicBool,

    /// True until `start`, and again once `stop` is requested
    stopping: AtomicBool,

    /// Set by `stop`; the loop may only finish after this
    auto_stop: AtomicBool,

    /// Set once `stop` has completed
    stopped: AtomicBool,

    /// Kernel id of the caller thread in caller mode
    root_thread: Option<Tid>,

    /// Scheduler loop fiber of the caller thread
    root_fiber: Option<Arc<Fiber>>,
}

impl Scheduler {
    /// Start building a scheduler
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Scheduler with the busy-wait policy and default stacks
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        Self::builder()
            .threads(threads)
            .use_caller(use_caller)
            .name(name)
            .build()
    }

    /// Scheduler the calling thread works for
    pub fn current() -> Option<Arc<Scheduler>> {
        local::current_scheduler()
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stack policy shared with the fibers created on this scheduler
    pub fn stack_options(&self) -> &StackOptions {
        &self.stack
    }

    pub(crate) fn policy(&self) -> &Arc<dyn WaitPolicy> {
        &self.policy
    }

    /// Kernel ids of the workers started so far
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.thread_ids.lock().clone()
    }

    /// Number of worker threads, caller thread included
    pub fn thread_count(&self) -> usize {
        self.pool_threads + usize::from(self.root_thread.is_some())
    }

    /// Tasks being run right now
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers waiting in their idle fiber
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Whether any worker is idle and would need a tickle to see new work
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Started and not yet asked to stop
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire)
    }

    /// Queue a task for any worker
    pub fn schedule(&self, task: Task) {
        self.enqueue(task, None);
    }

    /// Queue a task that only the worker with kernel id `thread` may run
    pub fn schedule_on(&self, task: Task, thread: Tid) {
        self.enqueue(task, Some(thread));
    }

    /// Queue several tasks under one lock, with at most one wakeup
    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(tasks.into_iter().map(|task| Scheduled::new(task, None)));
            was_empty && !queue.is_empty()
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Queue a closure
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::from_fn(f));
    }

    fn enqueue(&self, task: Task, thread: Option<Tid>) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Scheduled::new(task, thread));
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Wake an idle worker through the wait policy
    pub fn tickle(&self) {
        self.policy.tickle(self);
    }

    /// Whether shutdown may complete, as decided by the wait policy
    pub fn stopping(&self) -> bool {
        self.policy.stopping(self)
    }

    /// Shutdown condition shared by every policy: stop requested, queue
    /// empty and nothing running.
    pub fn base_stopping(&self) -> bool {
        if !(self.auto_stop.load(Ordering::Acquire) && self.stopping.load(Ordering::Acquire)) {
            return false;
        }
        self.queue.lock().is_empty() && self.active.load(Ordering::Acquire) == 0
    }

    /// Spawn the pool threads. Calling it again has no effect.
    ///
    /// In caller mode the calling thread does not join the loop here; it
    /// does so in [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = self.threads.lock();
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stopping.store(false, Ordering::Release);

        for i in 0..self.pool_threads {
            let scheduler = Arc::clone(self);
            let thread = Thread::spawn(format!("{}_{}", self.name, i), move || scheduler.run())?;
            self.thread_ids.lock().push(thread.id());
            threads.push(thread);
        }

        tracing::info!(
            scheduler = %self.name,
            threads = self.thread_count(),
            "scheduler started"
        );
        Ok(())
    }

    /// Request shutdown and wait for it.
    ///
    /// Queued tasks and tasks still rescheduling themselves are run to
    /// completion first; the caller thread (in caller mode) works through
    /// them alongside the pool. Whatever is left once every worker has
    /// exited is discarded. Calling it again has no effect.
    ///
    /// # Panics
    /// In caller mode, if called from any thread but the creating one;
    /// otherwise, if called from one of the scheduler's own workers.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.auto_stop.store(true, Ordering::Release);

        if let Some(root) = &self.root_fiber {
            let state = root.state();
            if self.pool_threads == 0 && matches!(state, FiberState::Term | FiberState::Init) {
                self.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    self.finish_stop();
                    return;
                }
            }
        }

        let current = local::current_scheduler();
        let is_current = current.as_ref().is_some_and(|s| Arc::ptr_eq(s, self));
        if self.root_thread.is_some() {
            assert!(
                is_current,
                "caller-mode scheduler '{}' must be stopped from its creating thread",
                self.name
            );
        } else {
            assert!(
                !is_current,
                "scheduler '{}' stopped from one of its own workers",
                self.name
            );
        }

        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.pool_threads {
            self.tickle();
        }
        if self.root_fiber.is_some() {
            self.tickle();
        }

        if let Some(root) = &self.root_fiber {
            if !root.state().is_finished() {
                root.call();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for mut thread in threads {
            if thread.join().is_err() {
                tracing::error!(scheduler = %self.name, thread = %thread.name(), "worker thread panicked");
            }
        }

        let leftovers = std::mem::take(&mut *self.queue.lock());
        if !leftovers.is_empty() {
            tracing::warn!(
                scheduler = %self.name,
                count = leftovers.len(),
                "discarding tasks left after shutdown"
            );
        }

        self.finish_stop();
    }

    fn finish_stop(self: &Arc<Self>) {
        self.stopped.store(true, Ordering::Release);
        if self.root_thread == Some(util::thread_id())
            && local::current_scheduler().is_some_and(|s| Arc::ptr_eq(&s, self))
        {
            local::set_scheduler(Weak::new());
        }
        tracing::info!(scheduler = %self.name, "scheduler stopped");
    }

    /// Worker loop; runs until the idle fiber finishes
    fn run(self: Arc<Self>) {
        tracing::debug!(scheduler = %self.name, "worker loop entered");
        local::enter_scheduler(&self);

        let idle_fiber = {
            let scheduler = Arc::clone(&self);
            Fiber::from_callback(
                Box::new(move || scheduler.policy.idle(&scheduler)),
                &self.stack,
            )
        };
        let mut callback_fiber: Option<Arc<Fiber>> = None;
        let me = util::thread_id();

        loop {
            let (next, tickle_me) = self.take_next(me);
            if tickle_me {
                self.tickle();
            }

            match next.map(|entry| entry.task) {
                Some(Task::Fiber(fiber)) => {
                    let state = fiber.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    if state == FiberState::Ready {
                        self.schedule(Task::Fiber(fiber));
                    }
                }
                Some(Task::Callback(callback)) => {
                    let fiber = match callback_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_boxed(callback);
                            fiber
                        }
                        None => Fiber::from_callback(callback, &self.stack),
                    };
                    let state = fiber.resume();
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    match state {
                        FiberState::Ready => self.schedule(Task::Fiber(fiber)),
                        FiberState::Term | FiberState::Except => callback_fiber = Some(fiber),
                        // Parked: whoever holds it resumes it; we need a fresh one
                        _ => {}
                    }
                }
                None => {
                    if idle_fiber.state().is_finished() {
                        tracing::debug!(scheduler = %self.name, "idle fiber finished");
                        break;
                    }
                    // Count as idle before the last look at the queue: a task
                    // queued after this point sees us and tickles.
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    if self.has_work_for(me) {
                        self.idle.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        local::leave_scheduler();
        // Chain the wakeup to the next worker still blocked in its idle wait
        self.tickle();
        tracing::debug!(scheduler = %self.name, "worker loop exited");
    }

    /// Whether the queue holds a task this thread could take right now
    fn has_work_for(&self, me: Tid) -> bool {
        self.queue
            .lock()
            .iter()
            .any(|entry| entry.runs_on(me) && !entry.is_busy())
    }

    /// Dequeue the first task this thread may run.
    ///
    /// The second value says whether other workers should be woken: work
    /// was skipped (pinned elsewhere or still switching out) or remains.
    fn take_next(&self, me: Tid) -> (Option<Scheduled>, bool) {
        let mut queue = self.queue.lock();
        let mut tickle_me = false;

        let mut index = 0;
        while index < queue.len() {
            let entry = &queue[index];
            if !entry.runs_on(me) || entry.is_busy() {
                tickle_me = true;
                index += 1;
                continue;
            }
            let entry = queue.remove(index);
            self.active.fetch_add(1, Ordering::AcqRel);
            tickle_me |= index < queue.len();
            return (entry, tickle_me);
        }
        (None, tickle_me)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count())
            .field("use_caller", &self.root_thread.is_some())
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire)
            && !self.stopped.load(Ordering::Acquire)
            && local::is_bound_to(&*self)
        {
            util::fatal(format_args!(
                "scheduler '{}' dropped without stop while its thread is still bound to it",
                self.name
            ));
        }
        tracing::debug!(scheduler = %self.name, "scheduler dropped");
    }
}
