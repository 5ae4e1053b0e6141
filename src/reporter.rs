//! The reporter owns a set of metrics and a background task that flushes them
//! to a [`Backend`] every interval.
//!
//! Errors from a flush go onto a capacity-1 channel. If nobody drains it the
//! next failing flush blocks on the send, which stalls the flush loop until
//! the owner catches up. This is load shedding of last resort: a reporter
//! whose errors are ignored stops generating traffic rather than piling up
//! errors in memory.
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    encoding::{align_measure_time, Backend, Batch},
    error::{ConfigError, ReportError},
    metrics::{
        counter::Counter, gauge::Gauge, histogram::Histogram, CounterMode, Recordable, Sample,
    },
    registry::Provider,
    sketch::BucketBudget,
};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) mod metrics {
    pub const REGISTERED_METRICS: &str = "metrics.reporter.registered";
    pub const FLUSH_LATENCY_MS: &str = "metrics.reporter.flush_ms";
}

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    interval: Duration,
    counter_mode: Option<CounterMode>,
    self_metrics: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            counter_mode: None,
            self_metrics: false,
        }
    }
}

impl ReporterConfig {
    pub fn new(interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(Self {
            interval,
            ..Default::default()
        })
    }

    /// Override the backend's preferred counter read policy.
    pub fn with_counter_mode(mut self, mode: CounterMode) -> Self {
        self.counter_mode = Some(mode);
        self
    }

    /// Have the reporter track its own metric count and flush latency.
    pub fn with_self_metrics(mut self, enabled: bool) -> Self {
        self.self_metrics = enabled;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Everything a reporter has handed out, ordered by name so every flush
/// encodes in the same order.
#[derive(Default)]
struct MetricSet {
    counters: BTreeMap<String, Counter>,
    gauges: BTreeMap<String, Gauge>,
    histograms: BTreeMap<String, Histogram>,
}

impl MetricSet {
    fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.histograms.len()
    }

    fn collect(&self, mode: CounterMode) -> Vec<Sample> {
        let mut samples = Vec::with_capacity(self.len());
        samples.extend(self.counters.values().map(|m| m.sample(mode)));
        samples.extend(self.gauges.values().map(|m| m.sample(mode)));
        samples.extend(self.histograms.values().map(|m| m.sample(mode)));
        samples
    }
}

struct SelfMetrics {
    registered: Gauge,
    flush_latency_ms: Histogram,
}

struct ReporterShared {
    interval: Duration,
    counter_mode: CounterMode,
    backend: Box<dyn Backend>,
    metrics: Mutex<MetricSet>,
    self_metrics: Option<SelfMetrics>,
    /// Asks the flush task to drain and exit.
    shutdown: CancellationToken,
    /// Fired by the flush task once the final flush is done and the error
    /// channel is closed.
    terminated: CancellationToken,
    errors: Mutex<Option<mpsc::Receiver<ReportError>>>,
}

impl ReporterShared {
    /// Snapshot under the metric lock, then encode and deliver without it so
    /// registration never waits on the network.
    async fn flush(&self, errors: &mpsc::Sender<ReportError>) {
        let started = Instant::now();
        let measure_time = align_measure_time(SystemTime::now(), self.interval);
        let samples = {
            let metrics = self.metrics.lock();
            if let Some(self_metrics) = &self.self_metrics {
                self_metrics.registered.set(metrics.len() as f64);
            }
            metrics.collect(self.counter_mode)
        };
        tracing::debug!(message="collected metrics", measure_time=measure_time, metrics=samples.len(), duration=?started.elapsed());

        let batch = Batch {
            measure_time,
            period: self.interval,
            samples,
        };
        let result = self.backend.deliver(&batch).await;
        let flush_dur = started.elapsed();
        tracing::debug!(message="flushed metrics", ok=result.is_ok(), duration=?flush_dur);
        if let Some(self_metrics) = &self.self_metrics {
            self_metrics
                .flush_latency_ms
                .observe(flush_dur.as_secs_f64() * 1000.0);
        }
        if let Err(err) = result {
            Self::push_error(errors, err).await;
        }
    }

    async fn push_error(errors: &mpsc::Sender<ReportError>, err: ReportError) {
        match errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                tracing::warn!(
                    message = "reporter error channel is full, flushing paused until errors are drained"
                );
                // Only fails if the receiver was dropped, in which case
                // nobody wants the error.
                let _ = errors.send(err).await;
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn run(self: Arc<Self>, errors: mpsc::Sender<ReportError>) {
        // Locals drop in reverse order, so the sender goes before the guard
        // fires, even if a backend panics.
        let _terminated = self.terminated.clone().drop_guard();
        let errors = errors;
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(message="reporter started", interval=?self.interval);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.flush(&errors).await,
            }
        }
        tracing::debug!(message = "reporter draining");
        self.flush(&errors).await;
        tracing::debug!(message = "reporter terminated");
    }
}

/// A [`Provider`] that periodically flushes everything it created to a
/// [`Backend`]. Clones share the same metrics and background task.
#[derive(Clone)]
pub struct Reporter {
    shared: Arc<ReporterShared>,
}

impl Reporter {
    /// Start reporting in the background. Must be called from within a tokio
    /// runtime. The reporter runs until [`Reporter::stop`] is called.
    pub fn start<B: Backend>(config: ReporterConfig, backend: B) -> Result<Self, ConfigError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let mut set = MetricSet::default();
        let self_metrics = config.self_metrics.then(|| {
            let registered = Gauge::new(metrics::REGISTERED_METRICS);
            let flush_latency_ms =
                Histogram::new(metrics::FLUSH_LATENCY_MS, BucketBudget::default());
            set.gauges
                .insert(registered.name().to_owned(), registered.clone());
            set.histograms
                .insert(flush_latency_ms.name().to_owned(), flush_latency_ms.clone());
            SelfMetrics {
                registered,
                flush_latency_ms,
            }
        });

        let shared = Arc::new(ReporterShared {
            interval: config.interval,
            counter_mode: config.counter_mode.unwrap_or(backend.counter_mode()),
            backend: Box::new(backend),
            metrics: Mutex::new(set),
            self_metrics,
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
            errors: Mutex::new(Some(errors_rx)),
        });
        runtime.spawn(Arc::clone(&shared).run(errors_tx));
        Ok(Self { shared })
    }

    /// Take the receiving half of the error channel. Only the first call gets
    /// it. The channel closes once the reporter has stopped and every error
    /// has been read. Owners are expected to drain it, an undrained channel
    /// pauses flushing after the second failure.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<ReportError>> {
        self.shared.errors.lock().take()
    }

    pub fn counter_mode(&self) -> CounterMode {
        self.shared.counter_mode
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Stop the background task after one last flush. Safe to call any number
    /// of times from any clone, and safe to abandon part way: every call
    /// waits until the final flush is done and the error channel is closed.
    ///
    /// If the final flush fails its error is still pushed to the error
    /// channel, so a full, undrained channel will keep this waiting.
    pub async fn stop(&self) {
        if !self.shared.shutdown.is_cancelled() {
            tracing::debug!(message = "stopping reporter");
            self.shared.shutdown.cancel();
        }
        self.shared.terminated.cancelled().await;
    }
}

#[async_trait]
impl Provider for Reporter {
    fn new_counter(&self, name: &str) -> Counter {
        self.shared
            .metrics
            .lock()
            .counters
            .entry(name.to_owned())
            .or_insert_with(|| Counter::new(name))
            .clone()
    }

    fn new_gauge(&self, name: &str) -> Gauge {
        self.shared
            .metrics
            .lock()
            .gauges
            .entry(name.to_owned())
            .or_insert_with(|| Gauge::new(name))
            .clone()
    }

    fn new_histogram(&self, name: &str, budget: BucketBudget) -> Histogram {
        self.shared
            .metrics
            .lock()
            .histograms
            .entry(name.to_owned())
            .or_insert_with(|| Histogram::new(name, budget))
            .clone()
    }

    async fn stop(&self) {
        Reporter::stop(self).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::{
        encoding::{batch::BatchJsonBackend, line::LineBackend},
        error::TransportError,
        metrics::MetricValue,
        registry::Registry,
        transport::{Response, Transport},
    };

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    #[derive(Default)]
    struct TestBackend {
        fail: AtomicBool,
        delay: Option<Duration>,
        attempts: AtomicUsize,
        completed: AtomicUsize,
        batches: Mutex<Vec<Batch>>,
    }

    impl TestBackend {
        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay: Some(delay),
                ..Default::default()
            })
        }


        fn failing() -> Arc<Self> {
            let backend = Self::default();
            backend.fail.store(true, Ordering::SeqCst);
            Arc::new(backend)
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn counter(&self, name: &str) -> Vec<f64> {
            self.batches
                .lock()
                .iter()
                .flat_map(|b| b.samples.iter())
                .filter(|s| s.name == name)
                .filter_map(|s| match s.value {
                    MetricValue::Counter(v) => Some(v),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Backend for Arc<TestBackend> {
        fn counter_mode(&self) -> CounterMode {
            CounterMode::Cumulative
        }

        async fn deliver(&self, batch: &Batch) -> Result<(), ReportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(batch.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ReportError::Delivery("connection refused".into()));
            }
            Ok(())
        }
    }

    fn hourly() -> ReporterConfig {
        ReporterConfig::new(Duration::from_secs(3600)).unwrap()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn zero_interval_rejected() {
        assert_eq!(
            ReporterConfig::new(Duration::ZERO).unwrap_err(),
            ConfigError::ZeroInterval
        );
    }

    #[test]
    fn start_requires_runtime() {
        let err = Reporter::start(hourly(), Arc::new(TestBackend::default())).err();
        assert_eq!(err, Some(ConfigError::NoRuntime));
    }

    #[tokio::test]
    async fn flushes_on_interval() {
        let backend = Arc::new(TestBackend::default());
        let config = ReporterConfig::new(Duration::from_millis(20)).unwrap();
        let reporter = Reporter::start(config, backend.clone()).unwrap();
        let registry = Registry::new(reporter.clone());
        registry.get_or_register_counter("requests").add(4.0);

        wait_for(|| !backend.counter("requests").is_empty()).await;
        reporter.stop().await;
        // Cumulative reads never reset, every flush sees the total.
        assert!(backend.counter("requests").iter().all(|v| *v == 4.0));
    }

    #[tokio::test]
    async fn stop_runs_a_final_flush() {
        let backend = Arc::new(TestBackend::default());
        let reporter = Reporter::start(hourly(), backend.clone()).unwrap();
        let registry = Registry::new(reporter.clone()).prefixed("web");
        registry.get_or_register_counter("hits").add(5.0);
        registry.get_or_register_counter("hits").add(3.0);
        registry.get_or_register_gauge("conns").set(2.0);

        reporter.stop().await;
        assert_eq!(backend.attempts(), 1);
        let batches = backend.batches.lock();
        let names: Vec<&str> = batches[0].samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["web.hits", "web.conns"]);
        assert_eq!(batches[0].period, Duration::from_secs(3600));
        assert_eq!(batches[0].measure_time % 3600, 0);
        drop(batches);
        assert_eq!(backend.counter("web.hits"), vec![8.0]);
    }

    #[tokio::test]
    async fn delta_mode_resets_counters() {
        let backend = Arc::new(TestBackend::default());
        let config = hourly().with_counter_mode(CounterMode::Delta);
        let reporter = Reporter::start(config, backend.clone()).unwrap();
        assert_eq!(reporter.counter_mode(), CounterMode::Delta);
        let counter = Registry::new(reporter.clone()).get_or_register_counter("jobs");
        counter.add(8.0);
        reporter.stop().await;
        assert_eq!(backend.counter("jobs"), vec![8.0]);
        assert_eq!(counter.value(), 0.0);
    }

    #[tokio::test]
    async fn flush_resets_histograms() {
        let backend = Arc::new(TestBackend::default());
        let reporter = Reporter::start(hourly(), backend.clone()).unwrap();
        let hist = Registry::new(reporter.clone())
            .get_or_register_histogram("latency", BucketBudget::default());
        for v in [10.0, 100.0, 150.0] {
            hist.observe(v);
        }
        reporter.stop().await;

        assert_eq!(hist.count(), 0);
        assert_eq!(hist.quantile(0.5), None);
        let batches = backend.batches.lock();
        match &batches[0].samples[0].value {
            MetricValue::Histogram(snap) => {
                assert_eq!(snap.count, 3);
                assert_eq!(snap.quantile(0.5), Some(100.0));
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_errors() {
        let backend = TestBackend::failing();
        let reporter = Reporter::start(hourly(), backend.clone()).unwrap();
        let mut errors = reporter.take_errors().unwrap();
        assert!(reporter.take_errors().is_none());

        reporter.stop().await;
        reporter.stop().await;
        Provider::stop(&reporter).await;
        assert_eq!(backend.attempts(), 1);

        // The final flush error is still delivered before the channel closes.
        assert!(matches!(errors.recv().await, Some(ReportError::Delivery(_))));
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn abandoned_stop_still_waits_for_final_flush() -> anyhow::Result<()> {
        init_tracing();
        let backend = TestBackend::slow(Duration::from_millis(300));
        let reporter = Reporter::start(hourly(), backend.clone())?;
        let mut errors = reporter
            .take_errors()
            .ok_or_else(|| anyhow::anyhow!("error receiver already taken"))?;

        let first = tokio::time::timeout(Duration::from_millis(20), reporter.stop()).await;
        assert!(first.is_err(), "stop finished before the slow flush");
        assert_eq!(backend.completed.load(Ordering::SeqCst), 0);

        reporter.stop().await;
        assert_eq!(backend.completed.load(Ordering::SeqCst), 1);
        assert!(errors.recv().await.is_none());
        Ok(())
    }

    struct OkTransport;

    #[async_trait]
    impl Transport for OkTransport {
        async fn post(
            &self,
            _url: &str,
            _content_type: &'static str,
            _body: Vec<u8>,
        ) -> Result<Response, TransportError> {
            Ok(Response {
                status: 200,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn line_backend_reads_counters_as_deltas() -> anyhow::Result<()> {
        let reporter = Reporter::start(hourly(), LineBackend::new(std::io::sink()))?;
        assert_eq!(reporter.counter_mode(), CounterMode::Delta);
        let counter = Registry::new(reporter.clone()).get_or_register_counter("jobs");
        counter.add(3.0);
        reporter.stop().await;
        assert_eq!(counter.value(), 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn batch_backend_reads_counters_cumulatively() -> anyhow::Result<()> {
        let backend = BatchJsonBackend::new("http://collector", OkTransport);
        let reporter = Reporter::start(hourly(), backend)?;
        assert_eq!(reporter.counter_mode(), CounterMode::Cumulative);
        let counter = Registry::new(reporter.clone()).get_or_register_counter("jobs");
        counter.add(3.0);
        reporter.stop().await;
        assert_eq!(counter.value(), 3.0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_stops_wait_for_final_flush() {
        let backend = Arc::new(TestBackend::default());
        let reporter = Reporter::start(hourly(), backend.clone()).unwrap();
        let a = reporter.clone();
        let b = reporter.clone();
        tokio::join!(a.stop(), b.stop());
        assert_eq!(backend.attempts(), 1);
    }

    #[tokio::test]
    async fn undrained_errors_pause_flushing() {
        init_tracing();
        let backend = TestBackend::failing();
        let config = ReporterConfig::new(Duration::from_millis(10)).unwrap();
        let reporter = Reporter::start(config, backend.clone()).unwrap();
        let mut errors = reporter.take_errors().unwrap();

        // First failure fills the channel, the second blocks the loop.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.attempts(), 2);

        // Draining one error lets exactly one more flush through.
        assert!(errors.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.attempts(), 3);

        let stopping = tokio::spawn({
            let reporter = reporter.clone();
            async move { reporter.stop().await }
        });
        let mut drained = 0;
        while errors.recv().await.is_some() {
            drained += 1;
        }
        stopping.await.unwrap();
        // Every attempt failed and only the first error was read earlier.
        assert!(backend.attempts() >= 4);
        assert_eq!(drained + 1, backend.attempts());
    }

    #[tokio::test]
    async fn self_metrics_are_reported() {
        let backend = Arc::new(TestBackend::default());
        let config = hourly().with_self_metrics(true);
        let reporter = Reporter::start(config, backend.clone()).unwrap();
        Registry::new(reporter.clone()).get_or_register_counter("x");
        reporter.stop().await;

        let batches = backend.batches.lock();
        let registered = batches[0]
            .samples
            .iter()
            .find(|s| s.name == metrics::REGISTERED_METRICS)
            .map(|s| s.value.clone());
        assert!(matches!(registered, Some(MetricValue::Gauge(v)) if v == 3.0));
    }
}
