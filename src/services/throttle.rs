/**
 * REQUIREMENT: Activity broadcasts are throttled per (room, user, kind) and
 * cursor updates coalesce in a 100 ms window keeping only the latest position
 * PURPOSE: Per-key interval throttle and coalescing buffer with explicit deadlines
 */
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-key minimum-interval throttle; `allow` admits at most one event per interval
#[derive(Debug, Default)]
pub struct KeyedThrottle {
    last_emit: Mutex<HashMap<String, Instant>>,
}

impl KeyedThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the event for `key` may be broadcast now
    pub fn allow(&self, key: &str, interval: Duration) -> bool {
        if interval.is_zero() {
            return true;
        }
        let mut map = self.last_emit.lock().unwrap();
        let now = Instant::now();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop throttle state for keys with the given prefix (room cleanup)
    pub fn forget_prefix(&self, prefix: &str) {
        self.last_emit
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
    }
}

/// Coalescing slot: the newest value wins; the flush deadline is set by the first write
#[derive(Debug)]
struct PendingSlot<T> {
    value: T,
    deadline: Instant,
}

/// Per-key coalescer. The first write in a window opens the window and reports
/// the flush deadline; later writes within the window replace the value silently.
#[derive(Debug)]
pub struct Coalescer<T> {
    window: Duration,
    pending: Mutex<HashMap<String, PendingSlot<T>>>,
}

impl<T: Clone> Coalescer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer `value` under `key`. Returns the flush deadline if this write
    /// opened a new window; `None` when an earlier write already scheduled one.
    pub fn push(&self, key: &str, value: T) -> Option<Instant> {
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(key) {
            Some(slot) => {
                slot.value = value;
                None
            }
            None => {
                let deadline = Instant::now() + self.window;
                pending.insert(key.to_string(), PendingSlot { value, deadline });
                Some(deadline)
            }
        }
    }

    /// Take the latest buffered value for `key`, closing the window
    pub fn flush(&self, key: &str) -> Option<T> {
        self.pending
            .lock()
            .unwrap()
            .remove(key)
            .map(|slot| slot.value)
    }

    pub fn forget_prefix(&self, prefix: &str) {
        self.pending
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
    }
}
