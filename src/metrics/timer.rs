use std::time::{Duration, Instant};

use super::histogram::Histogram;

/// Measures wall time since creation and records it into a [`Histogram`].
/// Values are recorded in multiples of `unit`, seconds unless told otherwise.
#[derive(Debug, Clone)]
pub struct DurationTimer {
    histogram: Histogram,
    start: Instant,
    unit: Duration,
}

impl DurationTimer {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
            unit: Duration::from_secs(1),
        }
    }

    /// Record in multiples of `unit`, eg `Duration::from_millis(1)` for
    /// milliseconds. A zero unit is ignored.
    pub fn with_unit(mut self, unit: Duration) -> Self {
        if !unit.is_zero() {
            self.unit = unit;
        }
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the time elapsed so far and return it. May be called more than
    /// once, each call records a new sample measured from the same start.
    pub fn observe_duration(&self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram
            .observe(elapsed.as_secs_f64() / self.unit.as_secs_f64());
        elapsed
    }
}
