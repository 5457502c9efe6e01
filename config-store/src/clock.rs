use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of record timestamps, in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Deterministic clock that advances by a fixed step on every reading.
pub struct SteppingClock {
    next: AtomicU64,
    step: u64,
}

impl SteppingClock {
    pub fn new(start: u64, step: u64) -> Self {
        SteppingClock {
            next: AtomicU64::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now_millis(&self) -> u64 {
        self.next.fetch_add(self.step, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepping_clock() {
        let clock = SteppingClock::new(100, 10);
        assert_eq!(clock.now_millis(), 100);
        assert_eq!(clock.now_millis(), 110);
        assert_eq!(clock.now_millis(), 120);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
