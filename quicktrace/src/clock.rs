use std::time::Instant;

/// Monotonic microsecond timestamp source.
///
/// The epoch is arbitrary but consistent within one session; values from
/// one thread are non-decreasing in capture order. The trait seam exists so
/// tests can substitute a deterministic (or capture-counting) clock.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// Default clock: microseconds since the session was opened.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}
