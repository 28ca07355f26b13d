//! Bounded exponential backoff for the polling loops.
//!
//! The first `spins` rounds only issue a spin hint, after that the sleep
//! starts at `min` and doubles up to `max`. Callers `reset()` whenever they
//! made progress so an active channel is polled at the short interval.

use crate::config::PollConfig;
use std::hint;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Backoff {
    spins: u32,
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(spins: u32, min: Duration, max: Duration) -> Self {
        Self {
            spins,
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    pub fn from_config(poll: &PollConfig) -> Self {
        Self::new(
            poll.spins,
            Duration::from_micros(poll.min_sleep_us),
            Duration::from_micros(poll.max_sleep_us),
        )
    }

    /// Sleep the next round would take, `Duration::ZERO` while spinning.
    pub fn next_delay(&self) -> Duration {
        if self.attempt < self.spins {
            return Duration::ZERO;
        }
        let exp = (self.attempt - self.spins).min(20);
        self.min
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn snooze(&mut self) {
        let delay = self.next_delay();
        if delay.is_zero() {
            hint::spin_loop();
        } else {
            std::thread::sleep(delay);
        }
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Polls `done` with backoff until it returns `Some` or `timeout` elapses.
pub fn poll_until<T>(
    backoff: &mut Backoff,
    timeout: Duration,
    mut done: impl FnMut() -> Option<T>,
) -> Result<T, Duration> {
    let started = Instant::now();
    loop {
        if let Some(value) = done() {
            return Ok(value);
        }
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(waited);
        }
        backoff.snooze();
    }
}
