//! Thread-safe counters, gauges and approximate histograms plus a reporter
//! that periodically flushes them to a collector.
//!
//! ```no_run
//! use std::time::Duration;
//! use metrics_flush::{BatchJsonBackend, BucketBudget, Registry, Reporter, ReporterConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReporterConfig::new(Duration::from_secs(60))?;
//! let reporter = Reporter::start(config, BatchJsonBackend::http("https://collector/v1/metrics"))?;
//! let registry = Registry::new(reporter.clone()).prefixed("api");
//!
//! registry.get_or_register_counter("requests").incr();
//! let latency = registry.get_or_register_histogram("latency", BucketBudget::default());
//! let timer = latency.start_timer();
//! // ... do work ...
//! timer.observe_duration();
//!
//! reporter.stop().await;
//! # Ok(())
//! # }
//! ```
pub mod encoding;
pub mod error;
pub(crate) mod metrics;
pub mod registry;
pub mod reporter;
pub mod sketch;
pub mod transport;

pub use encoding::{
    align_measure_time, batch::BatchJsonBackend, line::LineBackend, Backend, Batch,
};
pub use error::{ConfigError, Rejection, ReportError, TransportError};
pub use metrics::{
    counter::Counter,
    gauge::Gauge,
    histogram::{Histogram, HistogramSnapshot},
    timer::DurationTimer,
    CounterMode, MetricValue, Recordable, Sample,
};
pub use registry::{Provider, Registry};
pub use reporter::{Reporter, ReporterConfig};
pub use sketch::{BucketBudget, Sketch};
pub use transport::{HttpTransport, Response, Transport};
