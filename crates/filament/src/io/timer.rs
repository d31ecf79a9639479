//! Timers serviced by the reactor's idle loop
//!
//! Deadlines live in an ordered map keyed by `(deadline, id)`; the reactor
//! bounds each `epoll_wait` by the earliest deadline and queues the
//! callbacks of expired timers as ordinary tasks.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Timer body; recurring timers call it once per period
pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type Key = (Instant, u64);

struct TimerEntry {
    id: u64,
    period: Duration,
    recurring: bool,
    callback: TimerCallback,
}

/// Deadline-ordered set of armed timers
#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: Mutex<BTreeMap<Key, Arc<TimerEntry>>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arm a timer; the flag says whether it became the earliest one, in
    /// which case a blocked reactor must be woken to shorten its wait.
    pub(crate) fn add(
        self: &Arc<Self>,
        delay: Duration,
        callback: TimerCallback,
        recurring: bool,
    ) -> (TimerHandle, bool) {
        let entry = Arc::new(TimerEntry {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            period: delay,
            recurring,
            callback,
        });
        let key = (Instant::now() + delay, entry.id);

        let at_front = {
            let mut entries = self.entries.lock();
            entries.insert(key, entry.clone());
            entries.keys().next() == Some(&key)
        };

        let handle = TimerHandle {
            id: entry.id,
            key: Arc::new(Mutex::new(key)),
            queue: Arc::downgrade(self),
        };
        (handle, at_front)
    }

    /// Time until the earliest deadline (zero if already due)
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        let entries = self.entries.lock();
        let (deadline, _) = entries.keys().next()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every timer due by `now` and return their callbacks.
    /// Recurring timers are re-armed one period after `now`.
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<TimerCallback> {
        let mut entries = self.entries.lock();
        let pending = entries.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut *entries, pending);

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_, entry) in expired {
            callbacks.push(entry.callback.clone());
            if entry.recurring {
                entries.insert((now + entry.period, entry.id), entry);
            }
        }
        callbacks
    }
}

/// Handle to an armed timer
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    key: Arc<Mutex<Key>>,
    queue: Weak<TimerQueue>,
}

impl TimerHandle {
    /// Where the timer sits in `entries`; recurring timers move to a new
    /// key every period, so fall back to a search by id.
    fn locate(&self, entries: &BTreeMap<Key, Arc<TimerEntry>>) -> Option<Key> {
        let key = *self.key.lock();
        if entries.contains_key(&key) {
            return Some(key);
        }
        let key = entries.keys().find(|(_, id)| *id == self.id).copied()?;
        *self.key.lock() = key;
        Some(key)
    }

    /// Disarm the timer. Returns false if it already fired (one-shot) or
    /// was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut entries = queue.entries.lock();
        match self.locate(&entries) {
            Some(key) => entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Restart the countdown from now with the original period.
    /// Returns false if the timer is no longer armed.
    pub fn refresh(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut entries = queue.entries.lock();
        let Some(entry) = self.locate(&entries).and_then(|key| entries.remove(&key)) else {
            return false;
        };
        let key = (Instant::now() + entry.period, entry.id);
        entries.insert(key, entry);
        *self.key.lock() = key;
        true
    }

    /// Whether the timer is still waiting to fire
    pub fn is_armed(&self) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|queue| self.locate(&queue.entries.lock()).is_some())
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_expiry_order() {
        let queue = TimerQueue::new();
        let (_, cb) = counter();
        let (_, first) = queue.add(Duration::from_millis(50), cb.clone(), false);
        assert!(first);
        let (_, front) = queue.add(Duration::from_millis(10), cb.clone(), false);
        assert!(front);
        let (_, front) = queue.add(Duration::from_millis(100), cb, false);
        assert!(!front);

        assert!(queue.next_timeout().unwrap() <= Duration::from_millis(10));
        let later = Instant::now() + Duration::from_millis(60);
        assert_eq!(queue.take_expired(later).len(), 2);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_cancel() {
        let queue = TimerQueue::new();
        let (_, cb) = counter();
        let (handle, _) = queue.add(Duration::from_secs(10), cb, false);
        assert!(handle.is_armed());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(queue.is_empty());
        assert!(!handle.is_armed());
    }

    #[test]
    fn test_recurring_rearms() {
        let queue = TimerQueue::new();
        let (hits, cb) = counter();
        let (handle, _) = queue.add(Duration::from_millis(5), cb, true);

        let now = Instant::now() + Duration::from_millis(10);
        for cb in queue.take_expired(now) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(handle.is_armed());
        assert!(handle.cancel());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let queue = TimerQueue::new();
        let (_, cb) = counter();
        let (handle, _) = queue.add(Duration::from_millis(200), cb, false);
        std::thread::sleep(Duration::from_millis(20));
        assert!(handle.refresh());
        assert!(queue.next_timeout().unwrap() > Duration::from_millis(190));
    }

    #[test]
    fn test_handle_outlives_queue() {
        let queue = TimerQueue::new();
        let (_, cb) = counter();
        let (handle, _) = queue.add(Duration::from_secs(1), cb, false);
        drop(queue);
        assert!(!handle.cancel());
        assert!(!handle.refresh());
    }
}
