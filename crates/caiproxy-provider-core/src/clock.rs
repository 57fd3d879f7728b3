use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

/// Wall-clock source for expiry decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;

    /// Time elapsed since `earlier`; zero when the clock went backwards.
    fn since(&self, earlier: SystemTime) -> Duration {
        self.now().duration_since(earlier).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let clock = ManualClock::default();
        let start = clock.now();
        assert_eq!(clock.since(start), Duration::ZERO);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.since(start), Duration::from_secs(90));
    }

    #[test]
    fn since_saturates_when_time_goes_backwards() {
        let clock = ManualClock::default();
        let future = clock.now() + Duration::from_secs(5);
        assert_eq!(clock.since(future), Duration::ZERO);
    }
}
