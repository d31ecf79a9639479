//! Runtime error types.

use crate::config::ConfigError;
use std::os::fd::RawFd;

/// Recoverable errors reported to callers of the scheduler and reactor.
///
/// Programmer errors (double-arming an event, resuming a running fiber,
/// stopping a scheduler from the wrong thread) are not represented here:
/// they are assertion failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// OS-level I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// `epoll_ctl` rejected a registration change
    #[error("epoll_ctl({op}, fd={fd}) failed: {source}")]
    Epoll {
        /// Operation name (`ADD`, `MOD`, `DEL`)
        op: &'static str,
        /// Descriptor being registered
        fd: RawFd,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// A wait was cancelled before its descriptor became ready
    #[error("wait on fd {0} was cancelled")]
    Cancelled(RawFd),

    /// Worker thread could not be created
    #[error("failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        /// Requested thread name
        name: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Runtime result
pub type Result<T> = std::result::Result<T, Error>;
