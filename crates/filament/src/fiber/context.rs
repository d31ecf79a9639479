//! Machine context switching on top of `ucontext(3)`.
//!
//! This is the only place that touches raw register state. The rest of the
//! crate sees three operations: prepare a context on a stack, create an empty
//! save slot, and switch from one context to another.

use super::stack::Stack;
use std::io;

/// Saved execution state: registers, signal mask and stack pointer.
///
/// The `ucontext_t` is boxed because glibc stores a pointer into the
/// structure itself (the FPU save area); it must never move once captured.
pub(crate) struct Context {
    uc: Box<libc::ucontext_t>,
}

/// Entry point run on a fresh context. Must never return.
pub(crate) type Entry = extern "C" fn();

impl Context {
    /// A save slot. Filled by the first [`switch`](Self::switch) away from it.
    pub(crate) fn empty() -> Self {
        // SAFETY: ucontext_t is plain old data; all-zero is a valid value.
        Self {
            uc: Box::new(unsafe { std::mem::zeroed() }),
        }
    }

    /// A context that starts executing `entry` on `stack` when switched to.
    pub(crate) fn new(stack: &Stack, entry: Entry) -> io::Result<Self> {
        let mut ctx = Self::empty();
        ctx.prepare(stack, entry)?;
        Ok(ctx)
    }

    /// Re-point this context at the start of `entry` on `stack`.
    pub(crate) fn prepare(&mut self, stack: &Stack, entry: Entry) -> io::Result<()> {
        // SAFETY: uc is a valid, pinned ucontext_t; the stack outlives the
        // context because both are owned by the same fiber.
        unsafe {
            if libc::getcontext(&mut *self.uc) != 0 {
                return Err(io::Error::last_os_error());
            }
            self.uc.uc_link = std::ptr::null_mut();
            self.uc.uc_stack.ss_sp = stack.base().cast();
            self.uc.uc_stack.ss_size = stack.size();
            self.uc.uc_stack.ss_flags = 0;
            libc::makecontext(&mut *self.uc, entry, 0);
        }
        Ok(())
    }

    /// Save the running state into `from` and resume `to`.
    ///
    /// Returns when some other context switches back into `from`.
    ///
    /// # Safety
    /// Both pointers must be valid for the whole switch, `from` must not be
    /// the context of any other running thread, and `to` must be either
    /// freshly prepared or previously saved by a `switch`.
    pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) {
        let from_uc: *mut libc::ucontext_t = &mut *(*from).uc;
        let to_uc: *const libc::ucontext_t = &*(*to).uc;
        if libc::swapcontext(from_uc, to_uc) != 0 {
            crate::util::fatal(format_args!(
                "swapcontext failed: {}",
                io::Error::last_os_error()
            ));
        }
    }
}
