use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// The scheduler's only source of "now". A trait rather than a bare
/// `Instant::now()` call so the S1/S2 property and scenario tests (spec
/// §8) can drive time deterministically instead of racing a real clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The host timer (spec §3: "absolute host-timer microseconds").
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock a test advances explicitly. `base` anchors the offsets so
/// `Instant` arithmetic never needs to go through `SystemTime`.
pub struct SimClock {
    base: Instant,
    offset_us: AtomicU64,
}

impl SimClock {
    pub fn new() -> SimClock {
        SimClock {
            base: Instant::now(),
            offset_us: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_us.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, offset: Duration) {
        self.offset_us.store(offset.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Default for SimClock {
    fn default() -> SimClock {
        SimClock::new()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_micros(self.offset_us.load(Ordering::SeqCst))
    }
}
