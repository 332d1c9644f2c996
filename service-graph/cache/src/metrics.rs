use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    entries: Gauge,
    hits: Counter,
    misses: Counter,
    queries: Family<QueryLabels, Counter>,
    evictions: Family<EvictionLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct QueryLabels {
    trigger: Trigger,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EvictionLabels {
    reason: Eviction,
}

/// What started a backend query.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum Trigger {
    Miss,
    ForceRefresh,
    Poll,
}

/// Why an entry left the cache.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum Eviction {
    Failed,
    Empty,
    SlowQuery,
    Idle,
    Capacity,
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "entries",
            "Gauge of the number of entries in the cache",
            metrics.entries.clone(),
        );
        reg.register(
            "hits",
            "Count of requests served by an existing entry",
            metrics.hits.clone(),
        );
        reg.register(
            "misses",
            "Count of requests that created an entry",
            metrics.misses.clone(),
        );
        reg.register(
            "backend_queries",
            "Count of queries issued to the log store, by what triggered them",
            metrics.queries.clone(),
        );
        reg.register(
            "evictions",
            "Count of entries removed from the cache",
            metrics.evictions.clone(),
        );
        metrics
    }

    pub(crate) fn set_entries(&self, n: usize) {
        self.entries.set(n as i64);
    }

    pub(crate) fn hit(&self) {
        self.hits.inc();
    }

    pub(crate) fn miss(&self) {
        self.misses.inc();
    }

    pub(crate) fn query(&self, trigger: Trigger) {
        self.queries.get_or_create(&QueryLabels { trigger }).inc();
    }

    pub(crate) fn evict(&self, reason: Eviction) {
        self.evictions.get_or_create(&EvictionLabels { reason }).inc();
    }

    #[cfg(test)]
    pub(crate) fn queries(&self, trigger: Trigger) -> u64 {
        self.queries.get_or_create(&QueryLabels { trigger }).get()
    }

    #[cfg(test)]
    pub(crate) fn evictions(&self, reason: Eviction) -> u64 {
        self.evictions.get_or_create(&EvictionLabels { reason }).get()
    }
}
