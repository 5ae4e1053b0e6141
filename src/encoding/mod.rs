//! Wire formats. A [`Backend`] takes one flush worth of [`Sample`]s, encodes
//! them for a particular collector and delivers the result.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::{
    error::ReportError,
    metrics::{CounterMode, Sample},
};

pub mod batch;
pub mod line;

/// Everything collected during a single flush.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Unix seconds, aligned down to a multiple of `period`.
    pub measure_time: i64,
    pub period: Duration,
    pub samples: Vec<Sample>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The counter read policy this collector expects.
    fn counter_mode(&self) -> CounterMode;

    /// Encode and ship a batch. Called from the reporter's flush task, one
    /// batch at a time.
    async fn deliver(&self, batch: &Batch) -> Result<(), ReportError>;
}

/// Align `now` down to a multiple of `interval`, in unix seconds. This keeps
/// reported windows on interval boundaries regardless of ticker jitter.
pub fn align_measure_time(now: SystemTime, interval: Duration) -> i64 {
    let now = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let interval = interval.as_nanos().max(1);
    let aligned = now / interval * interval;
    (aligned / 1_000_000_000) as i64
}
