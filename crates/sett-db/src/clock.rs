//! The per-node monotonic logical clock.
//!
//! Every locally originated write is stamped with `Clock::next()`. The
//! value is persisted inside the same fsynced batch as the write it
//! stamps, and recovery seeds the counter from
//! `max(persisted value, highest clock in the node's own log)`, so values
//! stay strictly increasing across process restarts. A value reserved but
//! never persisted (crash between `next()` and the batch commit) was never
//! acknowledged, so reusing its successor after restart is safe.
//!
//! Applying remote entries never advances the clock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter for locally originated log entries.
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Create a clock that will hand out values strictly above `last`.
    pub fn new(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Reserve and return the next clock value.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently reserved value.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Raise the counter to at least `value` (snapshot restore).
    pub fn advance_to(&self, value: u64) {
        self.last.fetch_max(value, Ordering::SeqCst);
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_next_is_strictly_increasing() {
        let clock = Clock::new(0);
        assert_eq!(clock.next(), 1);
        assert_eq!(clock.next(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn test_resumes_above_seed() {
        let clock = Clock::new(41);
        assert_eq!(clock.next(), 42);
    }

    #[test]
    fn test_concurrent_next_values_are_unique() {
        let clock = Arc::new(Clock::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| clock.next()).collect::<Vec<u64>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(clock.current(), 800);
    }
}
