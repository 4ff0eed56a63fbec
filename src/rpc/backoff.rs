//! Reconnect pacing policies.

use std::time::Duration;

/// Decides how long to pause between reconnect attempts.
pub trait Backoff: Send {
    /// The pause before the next attempt, or None to give up.
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Restores the policy to its initial state.
    fn reset(&mut self);
}

/// Exponentially growing pauses, capped at max_interval. With max_elapsed
/// unset the policy never gives up.
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Total pause budget after which the policy gives up
    pub max_elapsed: Option<Duration>,
    current: Duration,
    elapsed: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            multiplier: 1.5,
            max_elapsed: None,
            current: initial_interval,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max_elapsed) = self.max_elapsed {
            if self.elapsed >= max_elapsed {
                return None;
            }
        }
        let pause = self.current;
        self.elapsed += pause;
        self.current = std::cmp::min(self.current.mul_f64(self.multiplier), self.max_interval);
        Some(pause)
    }

    fn reset(&mut self) {
        self.current = self.initial_interval;
        self.elapsed = Duration::ZERO;
    }
}

/// Fixed pause between attempts.
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.0)
    }

    fn reset(&mut self) {}
}

/// Gives up immediately.
pub struct StopBackoff;

impl Backoff for StopBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}
