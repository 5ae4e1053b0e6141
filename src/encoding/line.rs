//! A line oriented `key#name=value` format, one metric per line, suitable for
//! log drains that parse measurements out of log output.
use std::{fmt::Write as _, io, io::Write, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Backend, Batch};
use crate::{
    error::ReportError,
    metrics::{CounterMode, MetricValue},
};

const PERCENTILES: [(&str, f64); 4] = [
    ("perc50", 0.50),
    ("perc90", 0.90),
    ("perc95", 0.95),
    ("perc99", 0.99),
];

/// Fixed-point with nine decimals. Never uses exponent notation.
pub fn format_float(value: f64) -> String {
    format!("{value:.9}")
}

/// Render a batch as newline terminated lines.
pub fn encode(batch: &Batch) -> String {
    let mut out = String::new();
    for sample in &batch.samples {
        let name = &sample.name;
        // Writing into a String can't fail.
        match &sample.value {
            MetricValue::Counter(v) => {
                let _ = writeln!(out, "count#{name}={}", format_float(*v));
            }
            MetricValue::Gauge(v) => {
                let _ = writeln!(out, "measure#{name}={}", format_float(*v));
            }
            MetricValue::Histogram(hist) => {
                for (suffix, q) in PERCENTILES {
                    if let Some(v) = hist.quantile(q) {
                        let _ = writeln!(out, "measure#{name}.{suffix}={}", format_float(v));
                    }
                }
            }
        }
    }
    out
}

/// Writes each flush to an arbitrary sink, counters read as deltas. Writes
/// run on tokio's blocking pool so a slow sink (a socket, a pipe) never
/// stalls a runtime worker.
pub struct LineBackend<W> {
    sink: Arc<Mutex<W>>,
}

impl<W: Write + Send + 'static> LineBackend<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Hand back the sink. `None` while a write is still in flight.
    pub fn into_inner(self) -> Option<W> {
        Arc::try_unwrap(self.sink).ok().map(Mutex::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send + 'static> Backend for LineBackend<W> {
    fn counter_mode(&self) -> CounterMode {
        CounterMode::Delta
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), ReportError> {
        let lines = encode(batch);
        if lines.is_empty() {
            return Ok(());
        }
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut sink = sink.lock();
            sink.write_all(lines.as_bytes())?;
            sink.flush()
        })
        .await
        .map_err(io::Error::other)??;
        Ok(())
    }
}
