//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

/// Set in the child process started by [`run_in_child`]
const CHILD_ENV: &str = "FILAMENT_ABORT_CHILD";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Whether this process is the child started by [`run_in_child`]
pub fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Re-run the single test `name` of this test binary in a child process.
/// The test checks [`is_child`] to decide which side it is on.
pub fn run_in_child(name: &str) -> Output {
    let exe = std::env::current_exe().unwrap();
    Command::new(exe)
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap()
}

/// Assert the child was killed by SIGABRT after reporting `message`
pub fn assert_aborted(output: &Output, message: &str) {
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "child did not abort: {:?}\n{stderr}",
        output.status
    );
    assert!(stderr.contains(message), "missing {message:?} in:\n{stderr}");
}
