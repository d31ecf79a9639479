//! Named OS threads with a known kernel thread id.
//!
//! [`Thread::spawn`] does not return until the new thread has published its
//! kernel id, so the id can be used for task affinity straight away.

use crate::defaults::MAX_THREAD_NAME_LEN;
use crate::error::{Error, Result};
use crate::util::{self, Tid};
use std::cell::RefCell;
use std::thread::JoinHandle;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// An OS thread owned by the runtime
pub struct Thread {
    /// Kernel thread id
    id: Tid,

    /// Full (untruncated) thread name
    name: String,

    /// Join handle, taken by `join`
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn a thread running `f`. Blocks until the thread is up.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut name = name.into();
        if name.is_empty() {
            name = String::from("UNKNOWN");
        }

        let (tid_tx, tid_rx) = crossbeam::channel::bounded::<Tid>(1);
        let thread_name = name.clone();

        let handle = std::thread::Builder::new()
            .name(os_name(&name).to_string())
            .spawn(move || {
                Thread::set_current_name(&thread_name);
                let _ = tid_tx.send(util::thread_id());
                drop(tid_tx);
                f();
            })
            .map_err(|source| Error::ThreadSpawn {
                name: name.clone(),
                source,
            })?;

        let id = tid_rx.recv().map_err(|_| Error::ThreadSpawn {
            name: name.clone(),
            source: std::io::Error::other("thread exited before reporting its id"),
        })?;

        tracing::debug!(thread = %name, tid = id, "thread started");

        Ok(Thread {
            id,
            name,
            handle: Some(handle),
        })
    }

    /// Kernel thread id
    pub fn id(&self) -> Tid {
        self.id
    }

    /// Thread name as given to `spawn`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish. Joining twice is a no-op.
    pub fn join(&mut self) -> std::thread::Result<()> {
        match self.handle.take() {
            Some(handle) => {
                let result = handle.join();
                if result.is_err() {
                    tracing::error!(thread = %self.name, tid = self.id, "thread panicked");
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Name of the calling thread
    pub fn current_name() -> String {
        THREAD_NAME.with(|name| name.borrow().clone())
    }

    /// Rename the calling thread (runtime bookkeeping only)
    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|current| *current.borrow_mut() = name.to_string());
    }
}

/// Longest prefix of `name` the kernel accepts, cut on a char boundary
fn os_name(name: &str) -> &str {
    if name.len() <= MAX_THREAD_NAME_LEN {
        return name;
    }
    let mut end = MAX_THREAD_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
