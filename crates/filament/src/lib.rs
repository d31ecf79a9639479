//! Filament: user-space concurrency for network servers
//!
//! This crate provides:
//! - Stackful fibers with explicit context switching (`fiber`)
//! - A cooperative scheduler multiplexing fibers over a thread pool (`scheduler`)
//! - An epoll reactor that lets fibers block on descriptor readiness (`io`)
//!
//! Application code is written in straight-line, blocking style; the runtime
//! interleaves thousands of fibers over a handful of OS threads.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::arc_with_non_send_sync)]

#[cfg(not(target_os = "linux"))]
compile_error!("filament requires Linux (epoll, ucontext, gettid)");

pub mod config;
pub mod defaults;
pub mod error;
pub mod fiber;
pub mod io;
mod local;
pub mod scheduler;
pub mod thread;
pub mod util;

pub use config::{ConfigError, ConfigVar, FiberConfig, IoConfig, RuntimeConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use fiber::{
    Fiber, FiberPanic, FiberState, HeapStackAllocator, MmapStackAllocator, PooledStackAllocator,
    StackAllocator, StackOptions,
};
pub use io::{Event, IoHandle, IoManager, TimerHandle};
pub use scheduler::{BusyWait, Scheduler, SchedulerBuilder, Task, WaitPolicy};
pub use thread::Thread;
