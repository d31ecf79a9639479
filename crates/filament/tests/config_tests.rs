//! Integration tests for configuration loading and live variables

use filament::{
    ConfigError, ConfigVar, Error, IoManager, RuntimeConfig, Scheduler, SchedulerBuilder,
    StackOptions,
};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SAMPLE: &str = r#"
[fiber]
stack_size = 131072

[scheduler]
threads = 3
use_caller = false
name = "edge"

[io]
epoll_timeout_ms = 500
max_events = 64
"#;

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let config = RuntimeConfig::load(file.path()).unwrap();
    assert_eq!(config.fiber.stack_size, 128 * 1024);
    assert_eq!(config.scheduler.threads, 3);
    assert!(!config.scheduler.use_caller);
    assert_eq!(config.scheduler.name, "edge");
    assert_eq!(config.io.epoll_timeout_ms, 500);
    assert_eq!(config.io.max_events, 64);
    // Unset keys keep their defaults
    assert_eq!(config.io.initial_fd_capacity, filament::defaults::DEFAULT_FD_CAPACITY);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = RuntimeConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_out_of_range_values() {
    for source in [
        "[io]\nmax_events = 0\n",
        "[io]\nepoll_timeout_ms = 0\n",
        "[fiber]\nstack_size = 0\n",
    ] {
        let err = RuntimeConfig::from_toml_str(source).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{source}");
    }
}

#[test]
fn test_invalid_config_rejected_by_io_manager() {
    let mut config = RuntimeConfig::default();
    config.io.max_events = 0;
    config.scheduler.use_caller = false;

    let err = IoManager::from_config(&config).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::Invalid(_))));
    assert!(err.to_string().contains("io.max_events"));
}

#[test]
fn test_builder_from_config() {
    let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
    let scheduler = SchedulerBuilder::from_config(&config).build();
    assert_eq!(scheduler.name(), "edge");
    assert_eq!(scheduler.thread_count(), 3);
    assert_eq!(scheduler.stack_options().size(), 128 * 1024);
    scheduler.stop();
}

#[test]
fn test_listeners_observe_changes() {
    let var = ConfigVar::new("Fiber.Stack_Size", 64usize, "stack size in bytes");
    assert_eq!(var.name(), "fiber.stack_size");
    assert_eq!(var.description(), "stack size in bytes");

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let s = seen.clone();
    let key = var.add_listener(move |old, new| s.lock().push((*old, *new)));

    assert!(var.set(128));
    assert!(!var.set(128));
    assert!(var.remove_listener(key));
    assert!(var.set(256));

    assert_eq!(*seen.lock(), vec![(64, 128)]);
    assert_eq!(var.get(), 256);
}

#[test]
fn test_stack_size_is_live() {
    let options = StackOptions::with_size(64 * 1024);
    let scheduler = Scheduler::builder()
        .threads(1)
        .use_caller(false)
        .name("live")
        .stack_options(options.clone())
        .build();

    let changes = Arc::new(AtomicUsize::new(0));
    let c = changes.clone();
    options.size_var().add_listener(move |_, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    options.size_var().set(256 * 1024);
    assert_eq!(scheduler.stack_options().size(), 256 * 1024);
    assert_eq!(changes.load(Ordering::SeqCst), 1);
    scheduler.stop();
}
