use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::modules::lock;

/// Time source shared by the scheduler, the request pipeline and the chat gateway.
///
/// `elapsed` is monotonic and drives cooldowns, cache expiry and result ages.
/// `utc` stamps persisted records.
pub trait Clock: Send + Sync {
    fn elapsed(&self) -> Duration;
    fn utc(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        if duration > Duration::ZERO {
            thread::sleep(duration);
        }
    }
}

/// Clock that only moves when told to. Sleeping advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = lock(&self.offset);
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        *lock(&self.offset)
    }

    fn utc(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::zero());
        self.origin + offset
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_both_views_together() {
        let clock = ManualClock::starting_now();
        let start = clock.utc();
        clock.advance(Duration::from_secs(90));
        clock.sleep(Duration::from_secs(30));

        assert_eq!(clock.elapsed(), Duration::from_secs(120));
        assert_eq!((clock.utc() - start).num_seconds(), 120);
    }
}
