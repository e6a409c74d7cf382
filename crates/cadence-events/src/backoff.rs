//! Adaptive poll backoff.
//!
//! Each empty poll grows the wait geometrically within `[min, max]`. The wait
//! itself is consumed in `min`-sized ticks so the loop can notice a stop or a
//! "poll now" between them.

use cadence_core::config::EventsConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    scalar: f64,
    /// Last computed interval.
    cur_poll: Duration,
    /// Wait remaining before the next poll.
    poll_in: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, scalar: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            scalar: scalar.max(1.0),
            cur_poll: Duration::ZERO,
            poll_in: Duration::ZERO,
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.min_poll(), config.max_poll(), config.poll_backoff_scalar)
    }

    pub fn cur_poll(&self) -> Duration {
        self.cur_poll
    }

    pub fn poll_in(&self) -> Duration {
        self.poll_in
    }

    /// Grow the interval after an empty poll and arm the wait.
    pub fn next_interval(&mut self) -> Duration {
        let grown = scale(self.cur_poll.max(self.min), self.scalar);
        self.cur_poll = grown.min(self.max);
        self.poll_in = self.cur_poll;
        self.cur_poll
    }

    /// Poll again right away.
    pub fn reset(&mut self) {
        self.cur_poll = Duration::ZERO;
        self.poll_in = Duration::ZERO;
    }

    /// Take the next tick off the armed wait. `None` once it has run out.
    pub fn next_tick(&mut self) -> Option<Duration> {
        if self.poll_in.is_zero() {
            return None;
        }
        let step = self.min.min(self.poll_in);
        self.poll_in -= step;
        Some(step)
    }
}

fn scale(d: Duration, scalar: f64) -> Duration {
    Duration::from_nanos((d.as_nanos() as f64 * scalar).round() as u64)
}
