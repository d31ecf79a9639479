//! Default constants for runtime configuration.

/// Default fiber stack size in bytes (1 MiB).
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Upper bound on a single `epoll_wait` in milliseconds.
///
/// Keeps shutdown and queue state re-checked even with no descriptor activity.
pub const DEFAULT_EPOLL_TIMEOUT_MS: u64 = 3000;

/// Number of events fetched per `epoll_wait`.
pub const DEFAULT_MAX_EVENTS: usize = 256;

/// Initial size of the per-descriptor context table.
pub const DEFAULT_FD_CAPACITY: usize = 32;

/// Maximum number of freed stacks a pooled allocator keeps per size class.
pub const DEFAULT_STACK_POOL_SIZE: usize = 64;

/// Linux truncates thread names to this many bytes.
pub const MAX_THREAD_NAME_LEN: usize = 15;

/// Smallest stack a fiber is given, whatever size is requested.
pub const MIN_STACK_SIZE: usize = 32 * 1024;
