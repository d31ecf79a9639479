//! Runtime configuration
//!
//! Two layers:
//! - [`RuntimeConfig`], a plain serde structure loadable from TOML, holding
//!   the tunables for fibers, schedulers and the reactor.
//! - [`ConfigVar`], a named value that can be changed while the runtime is
//!   live. Observers registered with [`ConfigVar::add_listener`] are told
//!   about every change.

use crate::defaults::{
    DEFAULT_EPOLL_TIMEOUT_MS, DEFAULT_FD_CAPACITY, DEFAULT_MAX_EVENTS, DEFAULT_STACK_SIZE,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Fiber settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FiberConfig {
    /// Stack size for fibers created without an explicit size
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads, counting the caller thread when `use_caller` is set.
    /// Zero means one per CPU.
    pub threads: usize,

    /// Whether the constructing thread participates as a worker
    pub use_caller: bool,

    /// Scheduler name, used as the worker thread name prefix
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            use_caller: true,
            name: String::new(),
        }
    }
}

impl SchedulerConfig {
    /// Worker count with the "zero means all CPUs" rule applied
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

/// Reactor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IoConfig {
    /// Upper bound on one `epoll_wait`, in milliseconds
    pub epoll_timeout_ms: u64,

    /// Events fetched per `epoll_wait`
    pub max_events: usize,

    /// Initial size of the descriptor table
    pub initial_fd_capacity: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            epoll_timeout_ms: DEFAULT_EPOLL_TIMEOUT_MS,
            max_events: DEFAULT_MAX_EVENTS,
            initial_fd_capacity: DEFAULT_FD_CAPACITY,
        }
    }
}

/// Complete runtime configuration (`filament.toml`)
///
/// ```toml
/// [fiber]
/// stack_size = 131072
///
/// [scheduler]
/// threads = 4
/// use_caller = false
/// name = "server"
///
/// [io]
/// epoll_timeout_ms = 1000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fiber settings
    pub fiber: FiberConfig,

    /// Scheduler settings
    pub scheduler: SchedulerConfig,

    /// Reactor settings
    pub io: IoConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fiber.stack_size == 0 {
            return Err(ConfigError::Invalid("fiber.stack_size must be non-zero".into()));
        }
        if self.io.max_events == 0 {
            return Err(ConfigError::Invalid("io.max_events must be non-zero".into()));
        }
        if self.io.epoll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "io.epoll_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A named configuration value that can change at runtime.
///
/// Listeners receive `(old, new)` after the value has been replaced and are
/// only invoked when the new value differs from the old one.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_key: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new variable holding `value`
    pub fn new(name: impl Into<String>, value: T, description: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into().to_ascii_lowercase(),
            description: description.into(),
            value: RwLock::new(value),
            listeners: Mutex::new(BTreeMap::new()),
            next_key: AtomicU64::new(1),
        })
    }

    /// Variable name (lowercased)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value. Returns false if it was unchanged.
    pub fn set(&self, value: T) -> bool {
        let old = {
            let mut current = self.value.write();
            if *current == value {
                return false;
            }
            std::mem::replace(&mut *current, value.clone())
        };

        // Listeners run without any lock held so they may read the variable.
        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&old, &value);
        }
        true
    }

    /// Register a change observer. Returns a key for [`remove_listener`](Self::remove_listener).
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(key, Arc::new(listener));
        key
    }

    /// Remove a change observer
    pub fn remove_listener(&self, key: u64) -> bool {
        self.listeners.lock().remove(&key).is_some()
    }

    /// Remove every change observer
    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &*self.value.read())
            .finish()
    }
}
