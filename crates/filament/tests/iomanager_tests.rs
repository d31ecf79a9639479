//! Integration tests for the epoll reactor

mod common;

use filament::util;
use filament::{Error, Event, IoConfig, IoManager, RuntimeConfig, Scheduler};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};


/// Poll `cond` until it holds or `timeout` passes
fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn socket_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn test_write_ready_on_connected_socket() {
    common::init_tracing();
    let io = IoManager::new(2, false, "connect").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    stream.set_nonblocking(true).unwrap();
    let fd = stream.as_raw_fd();

    let fired_on = Arc::new(AtomicI32::new(0));
    let f = fired_on.clone();
    io.add_event(
        fd,
        Event::WRITE,
        Some(Box::new(move || {
            f.store(util::thread_id(), Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || fired_on.load(Ordering::SeqCst) != 0));
    assert!(io.thread_ids().contains(&fired_on.load(Ordering::SeqCst)));
    assert_eq!(io.pending_events(), 0);
    // The bit is cleared, so it can be armed again
    assert!(!io.del_event(fd, Event::WRITE));

    io.stop();
    drop(stream);
}

#[test]
fn test_read_and_write_are_independent() {
    common::init_tracing();
    let io = IoManager::new(1, false, "rw").unwrap();
    let (a, mut b) = socket_pair();
    let fd = a.as_raw_fd();

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    let (r, w) = (reads.clone(), writes.clone());
    io.add_event(
        fd,
        Event::READ,
        Some(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    io.add_event(
        fd,
        Event::WRITE,
        Some(Box::new(move || {
            w.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    // Writable straight away; nothing to read yet
    assert!(wait_until(Duration::from_secs(5), || writes.load(Ordering::SeqCst) == 1));
    assert_eq!(reads.load(Ordering::SeqCst), 0);
    assert_eq!(io.pending_events(), 1);

    b.write_all(b"ping").unwrap();
    assert!(wait_until(Duration::from_secs(5), || reads.load(Ordering::SeqCst) == 1));
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn test_double_arm_inside_fiber_aborts() {
    if !common::is_child() {
        let output = common::run_in_child("test_double_arm_inside_fiber_aborts");
        common::assert_aborted(&output, "already armed");
        return;
    }

    let io = IoManager::new(1, false, "double").unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();
    io.spawn(move || {
        let io = IoManager::current().unwrap();
        io.add_event(fd, Event::READ, Some(Box::new(|| {}))).unwrap();
        let _ = io.add_event(fd, Event::READ, Some(Box::new(|| {})));
    });
    // Only reached if the second arm did not abort
    std::thread::sleep(Duration::from_secs(5));
    std::process::exit(0);
}

#[test]
fn test_fiber_waits_for_readable() {
    common::init_tracing();
    let io = IoManager::new(2, false, "wait").unwrap();
    let (a, mut b) = socket_pair();
    let fd = a.as_raw_fd();

    let woke = Arc::new(AtomicBool::new(false));
    let w = woke.clone();
    io.spawn(move || {
        let io = IoManager::current().unwrap();
        io.wait(fd, Event::READ).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!((&a).read(&mut buf).unwrap(), 4);
        w.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(Duration::from_secs(5), || io.pending_events() == 1));
    assert!(!woke.load(Ordering::SeqCst));
    b.write_all(b"data").unwrap();
    assert!(wait_until(Duration::from_secs(5), || woke.load(Ordering::SeqCst)));
    io.stop();
}

#[test]
fn test_cancel_wakes_waiter_with_error() {
    common::init_tracing();
    let io = IoManager::new(2, false, "cancel").unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let (tx, rx) = crossbeam::channel::bounded(1);
    io.spawn(move || {
        let io = IoManager::current().unwrap();
        let result = io.wait(fd, Event::READ);
        tx.send(matches!(result, Err(Error::Cancelled(f)) if f == fd)).unwrap();
        drop(a);
    });

    assert!(wait_until(Duration::from_secs(5), || io.pending_events() == 1));
    assert!(io.cancel_event(fd, Event::READ));
    assert!(!io.cancel_event(fd, Event::READ));
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(io.pending_events(), 0);
    io.stop();
}

#[test]
fn test_del_event_drops_callback() {
    let io = IoManager::new(1, false, "del").unwrap();
    let (a, _b) = socket_pair();
    let fd = a.as_raw_fd();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    io.add_event(
        fd,
        Event::READ,
        Some(Box::new(move || r.store(true, Ordering::SeqCst))),
    )
    .unwrap();
    assert_eq!(io.pending_events(), 1);
    assert!(io.del_event(fd, Event::READ));
    assert_eq!(io.pending_events(), 0);
    io.stop();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_cancel_all_runs_every_continuation() {
    let io = IoManager::new(1, false, "cancel_all").unwrap();
    let (a, b) = socket_pair();
    let (fa, fb) = (a.as_raw_fd(), b.as_raw_fd());

    let ran = Arc::new(AtomicUsize::new(0));
    for fd in [fa, fb] {
        let r = ran.clone();
        io.add_event(
            fd,
            Event::READ,
            Some(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    assert!(io.cancel_all(fa));
    assert!(!io.cancel_all(fa));
    assert_eq!(io.pending_events(), 1);
    assert!(io.cancel_all(fb));
    io.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[test]
fn test_timers() {
    common::init_tracing();
    let io = IoManager::new(2, false, "timers").unwrap();

    let once = Arc::new(AtomicUsize::new(0));
    let o = once.clone();
    io.add_timer(
        Duration::from_millis(20),
        move || {
            o.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let recurring = io.add_timer(
        Duration::from_millis(10),
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    let condition = Arc::new(());
    let skipped = Arc::new(AtomicBool::new(false));
    let s = skipped.clone();
    io.add_condition_timer(
        Duration::from_millis(10),
        move || s.store(true, Ordering::SeqCst),
        Arc::downgrade(&condition),
        false,
    );
    drop(condition);

    assert!(wait_until(Duration::from_secs(5), || ticks.load(Ordering::SeqCst) >= 3));
    assert!(recurring.cancel());
    assert!(wait_until(Duration::from_secs(5), || once.load(Ordering::SeqCst) == 1));
    io.stop();

    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert!(!skipped.load(Ordering::SeqCst));
}

#[test]
fn test_sleep_suspends_fiber() {
    let io = IoManager::new(1, false, "sleep").unwrap();
    let elapsed = Arc::new(parking_lot::Mutex::new(None));
    let e = elapsed.clone();
    io.spawn(move || {
        let start = Instant::now();
        IoManager::current().unwrap().sleep(Duration::from_millis(50));
        *e.lock() = Some(start.elapsed());
    });
    io.stop();
    assert!(elapsed.lock().unwrap() >= Duration::from_millis(50));
}

#[test]
fn test_current_outside_and_inside() {
    let io = IoManager::new(1, false, "current").unwrap();
    assert!(IoManager::current().is_none());

    let handle = io.handle();
    let same = Arc::new(AtomicBool::new(false));
    let s = same.clone();
    io.spawn(move || {
        let current = IoManager::current().unwrap();
        s.store(current.ptr_eq(&handle), Ordering::SeqCst);
    });
    io.stop();
    assert!(same.load(Ordering::SeqCst));
}

#[test]
fn test_plain_scheduler_is_not_io() {
    let scheduler = Scheduler::new(1, false, "plain");
    scheduler.start().unwrap();
    let is_io = Arc::new(AtomicBool::new(true));
    let i = is_io.clone();
    scheduler.spawn(move || i.store(IoManager::current().is_some(), Ordering::SeqCst));
    scheduler.stop();
    assert!(!is_io.load(Ordering::SeqCst));
}

#[test]
fn test_caller_mode_io() {
    common::init_tracing();
    std::thread::spawn(|| {
        let io = IoManager::new(2, true, "caller_io").unwrap();
        let (a, mut b) = socket_pair();
        let fd = a.as_raw_fd();
        b.write_all(b"x").unwrap();

        let woke = Arc::new(AtomicBool::new(false));
        let w = woke.clone();
        io.spawn(move || {
            IoManager::current().unwrap().wait(fd, Event::READ).unwrap();
            w.store(true, Ordering::SeqCst);
            drop(a);
        });
        io.stop();
        assert!(woke.load(Ordering::SeqCst));
    })
    .join()
    .unwrap();
}

#[test]
fn test_from_config() {
    let mut config = RuntimeConfig {
        io: IoConfig {
            epoll_timeout_ms: 100,
            ..IoConfig::default()
        },
        ..RuntimeConfig::default()
    };
    config.scheduler.use_caller = false;
    config.scheduler.threads = 2;
    config.scheduler.name = String::from("configured");

    let io = IoManager::from_config(&config).unwrap();
    assert_eq!(io.name(), "configured");
    assert_eq!(io.thread_count(), 2);
    drop(io);
}

#[test]
fn test_task_wakes_idle_worker_promptly() {
    // With a long epoll timeout, a missed tickle shows up as a stalled task
    let mut config = RuntimeConfig::default();
    config.scheduler.use_caller = false;
    config.scheduler.threads = 1;
    config.io.epoll_timeout_ms = 60_000;
    let io = IoManager::from_config(&config).unwrap();

    let (tx, rx) = crossbeam::channel::bounded(1);
    for round in 0..300 {
        let tx = tx.clone();
        io.spawn(move || tx.send(round).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), round);
        if round % 50 == 0 {
            // Let the worker settle into epoll_wait
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    io.stop();
}
