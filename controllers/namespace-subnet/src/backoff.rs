//! # Fibonacci Backoff
//!
//! Delay between watch stream restarts. Grows more slowly than exponential
//! backoff so a briefly unavailable API server is picked up again quickly.
//!
//! Sequence with the watcher defaults: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 30s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next_seconds = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next_seconds, self.max_seconds);

        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}
