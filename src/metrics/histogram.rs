use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use super::{timer::DurationTimer, CounterMode, MetricValue};
use crate::sketch::{BucketBudget, Sketch};

/// The aggregate state of a histogram at some instant: running stats plus the
/// bucket sketch used for quantile estimates.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub sum_squares: f64,
    sketch: Sketch,
}

impl HistogramSnapshot {
    /// Estimated value at quantile `q`, `None` if nothing was observed.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.sketch.quantile(q)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug)]
struct HistogramInner {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    sum_squares: f64,
    budget: BucketBudget,
    sketch: Sketch,
}

impl HistogramInner {
    fn new(budget: BucketBudget) -> Self {
        Self {
            count: 0,
            sum: 0f64,
            min: f64::MAX,
            max: f64::MIN,
            sum_squares: 0f64,
            budget,
            sketch: Sketch::new(budget),
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.sum_squares += value * value;
        self.sketch.insert(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        // min/max sentinels are meaningless to callers, report zeros instead.
        let (min, max) = if self.count == 0 {
            (0f64, 0f64)
        } else {
            (self.min, self.max)
        };
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            min,
            max,
            sum_squares: self.sum_squares,
            sketch: self.sketch.clone(),
        }
    }

    fn get_and_reset(&mut self) -> HistogramSnapshot {
        let fresh = HistogramInner::new(self.budget);
        let old = std::mem::replace(self, fresh);
        let mut snapshot = old.snapshot();
        // The old sketch is ours now, skip the clone snapshot() made.
        snapshot.sketch = old.sketch;
        snapshot
    }
}

/// A threadsafe histogram that tracks an approximate distribution of values
/// in bounded memory.
#[derive(Debug, Clone)]
pub struct Histogram {
    name: Arc<str>,
    inner: Arc<Mutex<HistogramInner>>,
}

impl Histogram {
    pub fn new(name: impl Into<String>, budget: BucketBudget) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(HistogramInner::new(budget))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a sample. Any float is accepted, including negatives and NaN.
    pub fn observe(&self, value: f64) {
        self.inner.lock().record(value);
    }

    /// Record a duration as fractional seconds.
    pub fn observe_duration(&self, value: Duration) {
        self.observe(value.as_secs_f64());
    }

    /// Start a timer that records into this histogram.
    pub fn start_timer(&self) -> DurationTimer {
        DurationTimer::new(self.clone())
    }

    /// Estimated value at quantile `q`, `None` if nothing has been observed
    /// since the last reset.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.inner.lock().sketch.quantile(q)
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// A copy of the current state. Does not reset anything.
    pub fn snapshot(&self) -> HistogramSnapshot {
        self.inner.lock().snapshot()
    }

    /// Swap in empty state and hand back what was accumulated. Only reporters
    /// call this, once per flush, so each period covers a fresh window.
    pub(crate) fn reset(&self) -> HistogramSnapshot {
        self.inner.lock().get_and_reset()
    }

    pub fn ptr_eq(&self, other: &Histogram) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl super::Recordable for Histogram {
    fn name(&self) -> &str {
        Histogram::name(self)
    }

    fn collect(&self, _mode: CounterMode) -> MetricValue {
        let snapshot = self.reset();
        tracing::trace!(message="histogram.collect", name=%self.name, count=snapshot.count, sum=snapshot.sum, min=snapshot.min, max=snapshot.max);
        MetricValue::Histogram(snapshot)
    }
}
