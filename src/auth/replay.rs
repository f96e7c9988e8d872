//! Replay protection for handshake ephemeral keys.
//!
//! Keys live in two time buckets. When the current bucket is older than the
//! retention span it becomes the previous bucket and the old previous bucket is
//! dropped, so a key is remembered for at least `retention` and at most twice
//! that. Memory is bounded by the handshake rate over that period.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::auth::Clock;
use crate::crypto::PUBLIC_KEY_SIZE;

/// Concurrency-safe set of recently seen ephemeral public keys.
pub struct ReplayGuard {
    buckets: Mutex<Buckets>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

struct Buckets {
    current: HashSet<[u8; PUBLIC_KEY_SIZE]>,
    previous: HashSet<[u8; PUBLIC_KEY_SIZE]>,
    started: SystemTime,
}

impl Buckets {
    fn rotate(&mut self, now: SystemTime, retention: Duration) {
        // A clock that stepped backwards starts a fresh bucket
        let Ok(age) = now.duration_since(self.started) else {
            self.previous = std::mem::take(&mut self.current);
            self.started = now;
            return;
        };

        if age >= retention * 2 {
            self.previous.clear();
            self.current.clear();
            self.started = now;
        } else if age >= retention {
            self.previous = std::mem::take(&mut self.current);
            self.started = now;
        }
    }
}

impl ReplayGuard {
    /// Create a guard remembering keys for at least `retention`.
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        let started = clock.now();
        Self {
            buckets: Mutex::new(Buckets {
                current: HashSet::new(),
                previous: HashSet::new(),
                started,
            }),
            retention,
            clock,
        }
    }

    /// Record `key`; returns `true` if it had already been recorded.
    ///
    /// Check and insert happen under one lock, so of any number of concurrent
    /// callers with the same key exactly one sees `false`.
    pub fn register(&self, key: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock();
        buckets.rotate(now, self.retention);

        if buckets.previous.contains(key) {
            return true;
        }
        !buckets.current.insert(*key)
    }

    /// Number of keys currently remembered.
    pub fn len(&self) -> usize {
        let buckets = self.buckets.lock();
        buckets.current.len() + buckets.previous.len()
    }

    /// Whether no keys are remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ManualClock;

    const HOUR: Duration = Duration::from_secs(3600);

    fn guard() -> (ReplayGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        (ReplayGuard::new(HOUR, clock.clone()), clock)
    }

    #[test]
    fn test_duplicate_detected() {
        let (guard, _) = guard();
        assert!(!guard.register(&[1u8; 32]));
        assert!(guard.register(&[1u8; 32]));
        assert!(!guard.register(&[2u8; 32]));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_remembered_across_one_rotation() {
        let (guard, clock) = guard();
        assert!(!guard.register(&[1u8; 32]));

        clock.advance(HOUR + Duration::from_secs(1));
        assert!(guard.register(&[1u8; 32]));
    }

    #[test]
    fn test_evicted_after_two_rotations() {
        let (guard, clock) = guard();
        assert!(!guard.register(&[1u8; 32]));

        clock.advance(HOUR);
        assert!(!guard.register(&[2u8; 32]));
        clock.advance(HOUR);
        assert!(!guard.register(&[3u8; 32]));

        // [1] has aged out of both buckets
        assert!(!guard.register(&[1u8; 32]));
        assert!(guard.register(&[3u8; 32]));
    }

    #[test]
    fn test_long_idle_clears_everything() {
        let (guard, clock) = guard();
        guard.register(&[1u8; 32]);
        guard.register(&[2u8; 32]);

        clock.advance(HOUR * 5);
        assert!(!guard.register(&[9u8; 32]));
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_clock_going_backwards() {
        let (guard, clock) = guard();
        guard.register(&[1u8; 32]);

        clock.set(std::time::UNIX_EPOCH);
        assert!(guard.register(&[1u8; 32]));

        // Rotation resumes from the new time instead of waiting for the old one
        clock.advance(HOUR);
        assert!(!guard.register(&[2u8; 32]));
        assert!(!guard.register(&[1u8; 32]));
    }

    #[test]
    fn test_concurrent_register_single_winner() {
        let (guard, _) = guard();
        let guard = Arc::new(guard);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.register(&[7u8; 32]))
            })
            .collect();

        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|seen| !seen)
            .count();
        assert_eq!(fresh, 1);
    }
}
