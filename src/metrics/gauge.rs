use std::sync::{atomic, Arc};

use super::{CounterMode, MetricValue};

#[derive(Debug)]
struct GaugeInner {
    name: String,
    bits: atomic::AtomicU64,
}

/// A last-write-wins value. Reporting never resets a gauge.
#[derive(Debug, Clone)]
pub struct Gauge {
    inner: Arc<GaugeInner>,
}

impl Gauge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GaugeInner {
                name: name.into(),
                bits: atomic::AtomicU64::new(0f64.to_bits()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn set(&self, val: f64) {
        self.inner
            .bits
            .store(val.to_bits(), atomic::Ordering::Release)
    }

    pub fn add(&self, delta: f64) {
        let _ = self.inner.bits.fetch_update(
            atomic::Ordering::AcqRel,
            atomic::Ordering::Acquire,
            |bits| Some((f64::from_bits(bits) + delta).to_bits()),
        );
    }

    pub fn incr(&self) {
        self.add(1.0);
    }

    pub fn decr(&self) {
        self.add(-1.0)
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.inner.bits.load(atomic::Ordering::Acquire))
    }

    pub fn ptr_eq(&self, other: &Gauge) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl super::Recordable for Gauge {
    fn name(&self) -> &str {
        Gauge::name(self)
    }

    fn collect(&self, _mode: CounterMode) -> MetricValue {
        MetricValue::Gauge(self.value())
    }
}
