use std::thread;
use std::time::Duration;

use governor::Quota;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};

/// Blocking wait, swappable in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request pacing shared by every worker: one start per interval, no bursts.
pub struct RateLimiter {
    limiter: Option<DirectLimiter>,
    clock: DefaultClock,
    interval: Duration,
}

impl RateLimiter {
    pub fn per_second(requests_per_second: f64) -> Self {
        let interval = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        let clock = DefaultClock::default();
        let limiter = Quota::with_period(interval)
            .map(|quota| governor::RateLimiter::direct_with_clock(quota, &clock));
        Self {
            limiter,
            clock,
            interval,
        }
    }

    pub fn unlimited() -> Self {
        Self::per_second(0.0)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Blocks through `sleeper` until a slot is free. Returns the time waited.
    pub fn acquire(&self, sleeper: &dyn Sleeper) -> Duration {
        let Some(limiter) = &self.limiter else {
            return Duration::ZERO;
        };
        let mut waited = Duration::ZERO;
        while let Err(not_until) = limiter.check() {
            let wait = not_until.wait_time_from(self.clock.now());
            sleeper.sleep(wait);
            waited += wait;
        }
        waited
    }
}
