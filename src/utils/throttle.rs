//! Log throttling
//!
//! A disconnected knob produces the same read error many times per second;
//! the throttle limits how often a given message key is logged. Resetting a
//! key on recovery makes the next occurrence log immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-key minimum interval between log lines
pub struct LogThrottle {
    interval: Duration,
    last_logged: Mutex<HashMap<&'static str, Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a message for `key` may be logged now.
    ///
    /// Returns true at most once per interval per key and records the
    /// timestamp when it does.
    pub fn allow(&self, key: &'static str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key, now);
                true
            }
        }
    }

    /// Forget `key` so its next occurrence logs immediately.
    pub fn reset(&self, key: &'static str) {
        self.last_logged.lock().remove(key);
    }
}
