use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    metrics::{counter::Counter, gauge::Gauge, histogram::Histogram},
    sketch::BucketBudget,
};

/// A factory for metrics backed by some reporting backend. The [`Registry`]
/// dedupes by name in front of a provider, so providers are free to hand out
/// a fresh instance on every call.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn new_counter(&self, name: &str) -> Counter;
    fn new_gauge(&self, name: &str) -> Gauge;
    fn new_histogram(&self, name: &str, budget: BucketBudget) -> Histogram;
    /// Flush whatever is outstanding and shut the provider down.
    async fn stop(&self);
}

#[derive(Default)]
struct RegisteredMetrics {
    counters: HashMap<String, Counter>,
    gauges: HashMap<String, Gauge>,
    histograms: HashMap<String, Histogram>,
}

struct RegistryShared {
    provider: Arc<dyn Provider>,
    metrics: Mutex<RegisteredMetrics>,
}

/// A name keyed store of live metrics. Every lookup for a name returns the
/// same instance for the lifetime of the registry.
///
/// Registration takes a single lock, which is fine since we expect metrics to
/// be looked up once and cached by callers rather than on every request.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegistryShared>,
    prefix: Option<Arc<str>>,
}

impl Registry {
    pub fn new<P: Provider>(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<dyn Provider>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                provider,
                metrics: Default::default(),
            }),
            prefix: None,
        }
    }

    /// A view over this registry that registers every name as
    /// `prefix.name`. The view shares storage with `self`.
    pub fn prefixed(&self, prefix: &str) -> Registry {
        let prefix = match &self.prefix {
            Some(existing) => format!("{existing}.{prefix}"),
            None => prefix.to_owned(),
        };
        Registry {
            shared: Arc::clone(&self.shared),
            prefix: Some(prefix.into()),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.shared.provider
    }

    fn qualify(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_owned(),
        }
    }

    pub fn get_or_register_counter(&self, name: &str) -> Counter {
        let name = self.qualify(name);
        let mut metrics = self.shared.metrics.lock();
        if let Some(counter) = metrics.counters.get(&name) {
            return counter.clone();
        }
        let counter = self.shared.provider.new_counter(&name);
        metrics.counters.insert(name, counter.clone());
        counter
    }

    pub fn get_or_register_gauge(&self, name: &str) -> Gauge {
        let name = self.qualify(name);
        let mut metrics = self.shared.metrics.lock();
        if let Some(gauge) = metrics.gauges.get(&name) {
            return gauge.clone();
        }
        let gauge = self.shared.provider.new_gauge(&name);
        metrics.gauges.insert(name, gauge.clone());
        gauge
    }

    /// `budget` only applies the first time `name` is registered.
    pub fn get_or_register_histogram(&self, name: &str, budget: BucketBudget) -> Histogram {
        let name = self.qualify(name);
        let mut metrics = self.shared.metrics.lock();
        if let Some(histogram) = metrics.histograms.get(&name) {
            return histogram.clone();
        }
        let histogram = self.shared.provider.new_histogram(&name, budget);
        metrics.histograms.insert(name, histogram.clone());
        histogram
    }

    /// Number of distinct metrics registered across all kinds.
    pub fn len(&self) -> usize {
        let metrics = self.shared.metrics.lock();
        metrics.counters.len() + metrics.gauges.len() + metrics.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
