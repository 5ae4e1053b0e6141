pub(crate) mod counter;
pub(crate) mod gauge;
pub(crate) mod histogram;
pub(crate) mod timer;

use histogram::HistogramSnapshot;

/// How a reporter reads counters during a flush.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CounterMode {
    /// Report the running total every period and let the collector derive
    /// the rate.
    Cumulative,
    /// Report only what accumulated since the last flush, zeroing the counter
    /// as it is read.
    Delta,
}

/// A point-in-time reading of a single metric, produced once per flush.
#[derive(Debug, Clone)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramSnapshot),
}

/// A named [`MetricValue`], the unit every backend encodes.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub value: MetricValue,
}

/// A trait representing the reporter-facing half of a metric. Reporters and
/// backends never see concrete metric types, they collect samples through this
/// trait and encode the resulting [`MetricValue`].
pub trait Recordable: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Read the current value for a flush. Depending on the metric kind and
    /// `mode` this may reset the underlying state.
    fn collect(&self, mode: CounterMode) -> MetricValue;

    fn sample(&self, mode: CounterMode) -> Sample {
        Sample {
            name: self.name().to_owned(),
            value: self.collect(mode),
        }
    }
}
