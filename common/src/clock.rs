//! Time sources used by the failure detector and the data store
//!
//! Inter-arrival statistics are computed on the monotonic clock; data expiry
//! is compared against the wall clock. Both are behind a trait so that tests
//! may drive time by hand.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// The current monotonic time in nanoseconds
    ///
    /// Only differences between two readings are meaningful
    fn now_ns(&self) -> u64;

    /// The current wall-clock time as unix milliseconds
    fn now_ms(&self) -> u64;
}

/// The production clock, anchored to an `Instant` taken at construction
#[derive(Clone, Debug)]
pub struct SystemClock {
    /// The instant monotonic readings are measured from
    origin: Instant,
}

impl SystemClock {
    /// Constructor
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn now_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("negative timestamp").as_millis()
            as u64
    }
}

pub mod mocks {
    //! A hand-driven clock for tests

    use std::sync::atomic::{AtomicU64, Ordering};

    use super::Clock;

    /// A clock whose readings only move when a test advances them
    #[derive(Debug, Default)]
    pub struct MockClock {
        /// The current monotonic reading in nanoseconds
        ns: AtomicU64,
        /// The current wall reading in unix milliseconds
        ms: AtomicU64,
    }

    impl MockClock {
        /// Constructor
        pub fn new() -> Self {
            Self::default()
        }

        /// Advance the monotonic clock by the given number of nanoseconds
        pub fn advance_ns(&self, delta: u64) {
            self.ns.fetch_add(delta, Ordering::Relaxed);
        }

        /// Advance both clocks by the given number of milliseconds
        pub fn advance_ms(&self, delta: u64) {
            self.ns.fetch_add(delta * 1_000_000, Ordering::Relaxed);
            self.ms.fetch_add(delta, Ordering::Relaxed);
        }

        /// Set the wall clock to an absolute unix-millisecond value
        pub fn set_ms(&self, ms: u64) {
            self.ms.store(ms, Ordering::Relaxed);
        }
    }

    impl Clock for MockClock {
        fn now_ns(&self) -> u64 {
            self.ns.load(Ordering::Relaxed)
        }

        fn now_ms(&self) -> u64 {
            self.ms.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod test {
    use super::{mocks::MockClock, Clock, SystemClock};

    /// Tests that the system clock's monotonic readings never move backwards
    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ns();
        let second = clock.now_ns();
        assert!(second >= first);
    }

    /// Tests driving the mock clock by hand
    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        clock.set_ms(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        assert_eq!(clock.now_ns(), 500 * 1_000_000);
    }
}
