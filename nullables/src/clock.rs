//! Nullable clock: deterministic time for testing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use saga_types::{Clock, Timestamp};

/// A deterministic clock. Time only advances when you tell it to.
#[derive(Debug)]
pub struct NullClock {
    current_ms: AtomicU64,
}

impl NullClock {
    pub fn new(initial_secs: u64) -> Self {
        Self {
            current_ms: AtomicU64::new(initial_secs * 1000),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.current_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    pub fn set(&self, at: Timestamp) {
        self.current_ms.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl Default for NullClock {
    fn default() -> Self {
        Self::new(1_700_000_000)
    }
}

impl Clock for NullClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.current_ms.load(Ordering::SeqCst))
    }
}
