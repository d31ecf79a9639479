//! Small helpers: kernel thread ids, fiber ids, backtraces and the fatal
//! error path.

use std::backtrace::Backtrace;
use std::fmt;

/// Kernel thread id, as used for task affinity
pub type Tid = libc::pid_t;

/// Kernel thread id of the calling thread
pub fn thread_id() -> Tid {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

/// Id of the fiber running on this thread, or 0 before any fiber exists
pub fn fiber_id() -> u64 {
    crate::local::current_fiber_id()
}

/// Capture a backtrace of the calling stack, one frame line per entry,
/// each prefixed with `prefix`.
pub fn backtrace_string(prefix: &str) -> String {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .map(|line| format!("{prefix}{line}\n"))
        .collect()
}

/// Report a broken runtime invariant and abort the process.
///
/// Never unwinds, so the trampoline of the running fiber cannot turn it
/// into an ordinary fiber failure. The message also goes to stderr since a
/// tracing subscriber may not be installed.
#[cold]
pub(crate) fn fatal(message: fmt::Arguments<'_>) -> ! {
    let backtrace = backtrace_string("    ");
    tracing::error!(%message, %backtrace, "fatal runtime error");
    eprintln!("filament: fatal: {message}\n{backtrace}");
    std::process::abort();
}
