//! The batch JSON format: one object per flush holding every counter and
//! gauge, POSTed to the collector. Histograms are flattened into gauges.
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::{Backend, Batch};
use crate::{
    error::{Rejection, ReportError},
    metrics::{histogram::HistogramSnapshot, CounterMode, MetricValue},
    transport::{HttpTransport, Transport},
};

pub const RATE_LIMIT_AGG_HEADER: &str = "X-Librato-RateLimit-Agg";
pub const RATE_LIMIT_STD_HEADER: &str = "X-Librato-RateLimit-Std";
const CONTENT_TYPE: &str = "application/json";

/// Percentile gauges emitted for every histogram, as (suffix, quantile).
const PERCENTILES: [(&str, f64); 3] = [("p50", 0.50), ("p95", 0.95), ("p99", 0.99)];

#[derive(Debug, Serialize, PartialEq)]
pub struct CounterPayload {
    pub name: String,
    pub period: f64,
    pub value: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct GaugePayload {
    pub name: String,
    pub period: f64,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub sum_squares: f64,
}

impl GaugePayload {
    /// A gauge that saw exactly one sample.
    fn single(name: String, period: f64, value: f64) -> Self {
        Self {
            name,
            period,
            count: 1,
            sum: value,
            min: value,
            max: value,
            sum_squares: value * value,
        }
    }

    fn aggregate(name: String, period: f64, hist: &HistogramSnapshot) -> Self {
        Self {
            name,
            period,
            count: hist.count,
            sum: hist.sum,
            min: hist.min,
            max: hist.max,
            sum_squares: hist.sum_squares,
        }
    }

    /// JSON has no NaN or infinity, serde_json would write `null` instead.
    fn is_finite(&self) -> bool {
        [self.sum, self.min, self.max, self.sum_squares]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BatchPayload {
    pub source: String,
    pub measure_time: i64,
    pub counters: Vec<CounterPayload>,
    pub gauges: Vec<GaugePayload>,
}

impl BatchPayload {
    /// Flatten a batch into the collector's shape. Counters and gauges with
    /// a non-finite value are left out since JSON can't carry them.
    pub fn from_batch(source: &str, batch: &Batch) -> Self {
        let period = batch.period.as_secs_f64();
        let mut counters = Vec::new();
        let mut gauges = Vec::new();
        let mut push_gauge = |gauge: GaugePayload| {
            if gauge.is_finite() {
                gauges.push(gauge);
            }
        };
        for sample in &batch.samples {
            match &sample.value {
                MetricValue::Counter(value) => {
                    if value.is_finite() {
                        counters.push(CounterPayload {
                            name: sample.name.clone(),
                            period,
                            value: *value,
                        })
                    }
                }
                MetricValue::Gauge(value) => {
                    push_gauge(GaugePayload::single(sample.name.clone(), period, *value))
                }
                MetricValue::Histogram(hist) => {
                    if hist.is_empty() {
                        continue;
                    }
                    push_gauge(GaugePayload::aggregate(sample.name.clone(), period, hist));
                    for (suffix, q) in PERCENTILES {
                        if let Some(value) = hist.quantile(q) {
                            push_gauge(GaugePayload::single(
                                format!("{}.{}", sample.name, suffix),
                                period,
                                value,
                            ));
                        }
                    }
                }
            }
        }
        Self {
            source: source.to_owned(),
            measure_time: batch.measure_time,
            counters,
            gauges,
        }
    }
}

/// Delivers batches as a single JSON document per flush.
pub struct BatchJsonBackend {
    url: String,
    source: String,
    transport: Arc<dyn Transport>,
}

impl BatchJsonBackend {
    /// The source defaults to this machine's hostname.
    pub fn new<T: Transport>(url: impl Into<String>, transport: T) -> Self {
        Self {
            url: url.into(),
            source: gethostname::gethostname().to_string_lossy().into_owned(),
            transport: Arc::new(transport),
        }
    }

    /// A backend that POSTs with a default [`HttpTransport`].
    pub fn http(url: impl Into<String>) -> Self {
        Self::new(url, HttpTransport::new())
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn encode(&self, batch: &Batch) -> Result<Vec<u8>, ReportError> {
        Ok(serde_json::to_vec(&BatchPayload::from_batch(
            &self.source,
            batch,
        ))?)
    }
}

#[async_trait]
impl Backend for BatchJsonBackend {
    fn counter_mode(&self) -> CounterMode {
        CounterMode::Cumulative
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), ReportError> {
        let body = self.encode(batch)?;
        let response = self
            .transport
            .post(&self.url, CONTENT_TYPE, body)
            .await
            .map_err(ReportError::Delivery)?;
        if response.is_success() {
            return Ok(());
        }
        Err(ReportError::Rejected(Rejection {
            status: response.status,
            rate_limit_agg: response.header(RATE_LIMIT_AGG_HEADER).map(str::to_owned),
            rate_limit_std: response.header(RATE_LIMIT_STD_HEADER).map(str::to_owned),
            body: response.body,
        }))
    }
}
