use std::sync::{atomic, Arc};

use super::{CounterMode, MetricValue};

#[derive(Debug)]
struct CounterInner {
    name: String,
    /// f64 bits, updated with a CAS loop since there is no atomic float add.
    bits: atomic::AtomicU64,
}

/// A monotonically increasing float counter. Cloning is cheap and every clone
/// shares the same running total.
#[derive(Debug, Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

impl Counter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                name: name.into(),
                bits: atomic::AtomicU64::new(0f64.to_bits()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add(&self, delta: f64) {
        // The closure always returns Some so this can't fail.
        let _ = self.inner.bits.fetch_update(
            atomic::Ordering::AcqRel,
            atomic::Ordering::Acquire,
            |bits| Some((f64::from_bits(bits) + delta).to_bits()),
        );
    }

    pub fn incr(&self) {
        self.add(1.0);
    }

    /// Read the running total without touching it.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.inner.bits.load(atomic::Ordering::Acquire))
    }

    /// Read the running total and zero it in a single step.
    pub fn value_reset(&self) -> f64 {
        f64::from_bits(
            self.inner
                .bits
                .swap(0f64.to_bits(), atomic::Ordering::AcqRel),
        )
    }

    /// True if both handles point at the same underlying counter.
    pub fn ptr_eq(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl super::Recordable for Counter {
    fn name(&self) -> &str {
        Counter::name(self)
    }

    fn collect(&self, mode: CounterMode) -> MetricValue {
        match mode {
            CounterMode::Cumulative => MetricValue::Counter(self.value()),
            CounterMode::Delta => MetricValue::Counter(self.value_reset()),
        }
    }
}
