#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Caches raw service graph data per cluster and time window.
//!
//! Requests for the same window share a single backend query. Each build runs in its own task
//! and publishes its result on a watch channel, so a caller that gives up waiting never cancels
//! the query other callers are waiting on.
//!
//! ```text
//!  request ──► get_raw_data ──► entry ──► build task ──► Backend
//!                                  ▲                         │
//!                                  └──── completion ◄────────┘
//!                                  ▲
//!  poll_loop ── tidy, refresh ─────┘
//! ```
//!
//! Entries keyed by a relative window ("the last 15 minutes") are refreshed in the background
//! while they are being requested and dropped once they go idle. Entries keyed by a fixed window
//! are refreshed until the data for the window has settled and are never capped.

mod key;
mod metrics;
mod populate;

pub use self::{
    key::{CacheKey, Window},
    metrics::CacheMetrics,
};
use self::metrics::{Eviction, Trigger};
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use service_graph_core::{
    graph::ServiceGraphResponse, request::ServiceGraphRequest, Error, Result,
};
use service_graph_flows::{Backend, RawData};
use service_graph_index::{
    Labels, NameHelper, ParsedView, Permission, RbacFilter, ServiceGraphData,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    sync::watch,
    task::AbortHandle,
    time::{self, Duration, Instant},
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Answers what the requesting user may see.
///
/// Implementations carry the user's credentials, so one is created per request.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorization_review(&self, cluster: &str) -> Result<Vec<Permission>>;

    /// The labels of each host in the cluster, used to aggregate hosts by selector.
    async fn host_labels(&self, cluster: &str) -> Result<BTreeMap<String, Labels>>;
}

#[derive(Clone, Debug)]
pub struct Config {
    /// The number of relative entries kept once they are no longer being waited on.
    pub max_entries: usize,
    pub polled_entry_age_out: Duration,
    pub slow_query_entry_age_out: Duration,
    pub poll_loop_interval: Duration,
    pub poll_query_interval: Duration,
    pub data_settle_time: Duration,
    pub max_aggregated_records: usize,
    pub relative_key_quantum: Duration,
    pub default_timeout: Duration,
}

#[derive(Clone)]
pub struct ServiceGraphCache {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    backend: Arc<dyn Backend>,
    metrics: CacheMetrics,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, CacheEntry>,
    sequence: u64,
}

struct CacheEntry {
    relative: bool,

    /// The data served to requests. Pending until the first build completes.
    data: Build,

    /// The build in flight, if any. While the first build is pending this is the same build as
    /// `data`.
    update: Option<Build>,

    waiters: usize,
    accessed: Instant,
    accessed_seq: u64,
}

type Outcome = Result<Arc<RawData>>;

#[derive(Clone)]
struct Build {
    id: u64,
    started: Instant,
    rx: watch::Receiver<Option<Outcome>>,
    task: AbortHandle,
}

/// Registers a caller waiting on an entry for the duration of the wait.
struct Waiting<'c> {
    shared: &'c Shared,
    key: &'c CacheKey,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 10,
            polled_entry_age_out: Duration::from_secs(5 * 60),
            slow_query_entry_age_out: Duration::from_secs(5 * 60),
            poll_loop_interval: Duration::from_secs(2 * 60),
            poll_query_interval: Duration::from_secs(5),
            data_settle_time: Duration::from_secs(15 * 60),
            max_aggregated_records: 100_000,
            relative_key_quantum: Duration::from_secs(1),
            default_timeout: Duration::from_secs(60),
        }
    }
}

// === impl ServiceGraphCache ===

impl ServiceGraphCache {
    pub fn new(config: Config, backend: Arc<dyn Backend>, metrics: CacheMetrics) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                backend,
                metrics,
                state: Mutex::default(),
            }),
        }
    }

    /// Builds the service graph for a request.
    #[instrument(skip_all, fields(cluster = %req.cluster, range = %req.time_range))]
    pub async fn service_graph(
        &self,
        req: &ServiceGraphRequest,
        authz: &dyn Authorizer,
    ) -> Result<ServiceGraphResponse> {
        req.validate()?;
        let data = self.service_graph_data(req, authz).await?;
        let view = ParsedView::parse(&req.selected_view, &data.service_groups)?;
        let graph = service_graph_index::service_graph(&data, &view);
        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            truncated = graph.truncated,
            "Built service graph"
        );
        Ok(graph)
    }

    /// Returns the cached data for a request, filtered by what the requesting user may see.
    pub async fn service_graph_data(
        &self,
        req: &ServiceGraphRequest,
        authz: &dyn Authorizer,
    ) -> Result<ServiceGraphData> {
        let selectors = &req.selected_view.host_aggregation_selectors;
        let names = async {
            let hosts = if selectors.is_empty() {
                BTreeMap::new()
            } else {
                authz.host_labels(&req.cluster).await?
            };
            NameHelper::new(selectors, &hosts)
        };
        let (permissions, names, raw) = tokio::try_join!(
            authz.authorization_review(&req.cluster),
            names,
            self.get_raw_data(req),
        )?;
        Ok(ServiceGraphData::filtered(
            &raw,
            &RbacFilter::new(permissions),
            names,
        ))
    }

    /// Returns the unfiltered data for the request's cluster and time window.
    ///
    /// Fails with [`Error::CacheTimeout`] when the data is not ready within the request timeout.
    /// The query keeps running, so the same request can be retried to pick up its result.
    pub async fn get_raw_data(&self, req: &ServiceGraphRequest) -> Result<Arc<RawData>> {
        let shared = &self.shared;
        let key = CacheKey::new(
            &req.cluster,
            &req.time_range,
            shared.config.relative_key_quantum,
        );
        let timeout = req.timeout(shared.config.default_timeout);

        let build = shared.attach(&key, req.force_refresh);
        let _waiting = Waiting {
            shared,
            key: &key,
        };

        let mut rx = build.rx.clone();
        let outcome = match time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => outcome.clone(),
            Ok(Err(_)) => {
                return Err(Error::Backend(format!("query for {key} was cancelled")));
            }
            Err(_) => {
                let elapsed = build.started.elapsed();
                info!(%key, ?elapsed, "Timed out waiting for data");
                return Err(Error::CacheTimeout(elapsed));
            }
        };
        match outcome {
            Some(Ok(raw)) if raw.truncated && raw.l3.is_empty() => Err(Error::DataTruncated),
            Some(outcome) => outcome,
            None => Err(Error::Internal(format!("no data published for {key}"))),
        }
    }

    /// Refreshes and expires entries until the process exits.
    pub async fn poll_loop(self) {
        let shared = &self.shared;
        loop {
            time::sleep(jittered(shared.config.poll_loop_interval)).await;
            for key in shared.stale_keys() {
                time::sleep(jittered(shared.config.poll_query_interval)).await;
                shared.refresh(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl Shared ===

impl Shared {
    /// Returns the build a request should wait on, starting one when needed.
    fn attach(self: &Arc<Self>, key: &CacheKey, force_refresh: bool) -> Build {
        let mut state = self.state.lock();
        let id = state.next();
        if let Some(entry) = state.entries.get_mut(key) {
            self.metrics.hit();
            entry.waiters += 1;
            if !force_refresh {
                return entry.data.clone();
            }
            if entry.update.is_none() {
                debug!(%key, "Refreshing data on request");
                entry.update = Some(self.spawn_build(key, id, Trigger::ForceRefresh));
            }
            return entry.update.clone().unwrap_or_else(|| entry.data.clone());
        }

        self.metrics.miss();
        debug!(%key, "Creating cache entry");
        let build = self.spawn_build(key, id, Trigger::Miss);
        let seq = state.next();
        state.entries.insert(
            key.clone(),
            CacheEntry {
                relative: key.is_relative(),
                data: build.clone(),
                update: Some(build.clone()),
                waiters: 1,
                accessed: Instant::now(),
                accessed_seq: seq,
            },
        );
        // Make room before the build completes. The new entry has a waiter, so it stays.
        self.tidy(&mut state);
        build
    }

    fn spawn_build(self: &Arc<Self>, key: &CacheKey, id: u64, trigger: Trigger) -> Build {
        self.metrics.query(trigger);
        let (tx, rx) = watch::channel(None);
        let shared = self.clone();
        let range = key.time_range(Utc::now());
        let k = key.clone();
        let task = tokio::spawn(
            async move {
                let outcome = populate::populate(
                    &*shared.backend,
                    &k.cluster,
                    &range,
                    shared.config.max_aggregated_records,
                )
                .await
                .map(Arc::new);
                if let Err(error) = &outcome {
                    warn!(%error, "Failed to gather service graph data");
                }
                let succeeded = outcome.is_ok();
                tx.send_replace(Some(outcome));
                shared.complete(&k, id, succeeded);
            }
            .instrument(info_span!("build", key = %key, ?trigger)),
        );
        Build {
            id,
            started: Instant::now(),
            rx,
            task: task.abort_handle(),
        }
    }

    /// Records the result of a build once its task has published it.
    fn complete(&self, key: &CacheKey, id: u64, succeeded: bool) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            debug!(%key, "Discarding data for removed entry");
            return;
        };
        match entry.update.take() {
            Some(update) if update.id == id => {
                if succeeded {
                    entry.data = update;
                }
            }
            other => {
                entry.update = other;
                debug!(%key, "Discarding data from superseded query");
                return;
            }
        }

        let eviction = match entry.data.outcome() {
            Some(Err(_)) => Some(Eviction::Failed),
            Some(Ok(raw)) if raw.l3.is_empty() => Some(Eviction::Empty),
            _ => None,
        };
        if let Some(reason) = eviction {
            debug!(%key, ?reason, "Removing entry");
            state.entries.remove(key);
            self.metrics.evict(reason);
        }
        self.tidy(&mut state);
    }

    fn tidy(&self, state: &mut State) {
        let now = Instant::now();
        let Config {
            max_entries,
            polled_entry_age_out,
            slow_query_entry_age_out,
            ..
        } = self.config;

        state.entries.retain(|key, entry| {
            if entry.waiters > 0 {
                return true;
            }
            let idle = now.saturating_duration_since(entry.accessed);
            if entry.data.is_pending() && idle > slow_query_entry_age_out {
                debug!(%key, ?idle, "Abandoning slow query");
                entry.data.task.abort();
                if let Some(update) = &entry.update {
                    update.task.abort();
                }
                self.metrics.evict(Eviction::SlowQuery);
                return false;
            }
            if entry.relative && idle > polled_entry_age_out {
                debug!(%key, ?idle, "Removing idle entry");
                self.metrics.evict(Eviction::Idle);
                return false;
            }
            true
        });

        let relative = state.entries.values().filter(|e| e.relative).count();
        if relative > max_entries {
            let mut lru = state
                .entries
                .iter()
                .filter(|(_, e)| e.relative && e.waiters == 0)
                .map(|(k, e)| (e.accessed_seq, k.clone()))
                .collect::<Vec<_>>();
            lru.sort_unstable_by_key(|(seq, _)| *seq);
            for (_, key) in lru.into_iter().take(relative - max_entries) {
                debug!(%key, "Evicting least recently used entry");
                state.entries.remove(&key);
                self.metrics.evict(Eviction::Capacity);
            }
        }

        self.metrics.set_entries(state.entries.len());
    }

    /// Tidies the cache and lists the entries due a refresh, most recently used first.
    fn stale_keys(&self) -> Vec<CacheKey> {
        let mut state = self.state.lock();
        self.tidy(&mut state);

        let now = Instant::now();
        let settled = self.settled_before();
        let mut stale = state
            .entries
            .iter()
            .filter(|(key, e)| e.needs_update(key, now, self.min_refresh_age(), settled))
            .map(|(k, e)| (e.accessed_seq, k.clone()))
            .collect::<Vec<_>>();
        stale.sort_unstable_by_key(|(seq, _)| std::cmp::Reverse(*seq));
        debug!(entries = state.entries.len(), stale = stale.len(), "Tidied cache");
        stale.into_iter().map(|(_, k)| k).collect()
    }

    fn refresh(self: &Arc<Self>, key: &CacheKey) {
        let mut state = self.state.lock();
        let id = state.next();
        let now = Instant::now();
        let settled = self.settled_before();
        let min_age = self.min_refresh_age();
        if let Some(entry) = state.entries.get_mut(key) {
            if entry.needs_update(key, now, min_age, settled) {
                debug!(%key, "Refreshing data");
                entry.update = Some(self.spawn_build(key, id, Trigger::Poll));
            }
        }
    }

    /// Data gathered within half a poll interval is fresh enough.
    fn min_refresh_age(&self) -> Duration {
        self.config.poll_loop_interval / 2
    }

    /// Data for windows ending before this time no longer changes.
    fn settled_before(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.data_settle_time)
            .ok()
            .and_then(|settle| Utc::now().checked_sub_signed(settle))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

// === impl State ===

impl State {
    fn next(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

// === impl CacheEntry ===

impl CacheEntry {
    fn needs_update(
        &self,
        key: &CacheKey,
        now: Instant,
        min_age: Duration,
        settled: DateTime<Utc>,
    ) -> bool {
        if self.update.is_some() {
            return false;
        }
        match self.data.outcome() {
            None => false,
            Some(Err(_)) => true,
            Some(Ok(raw)) if raw.truncated => true,
            Some(Ok(_)) if now.saturating_duration_since(self.data.started) < min_age => false,
            Some(Ok(_)) => key.fixed_end().map_or(true, |end| end > settled),
        }
    }
}

// === impl Build ===

impl Build {
    fn outcome(&self) -> Option<Outcome> {
        self.rx.borrow().clone()
    }

    fn is_pending(&self) -> bool {
        self.rx.borrow().is_none()
    }
}

// === impl Waiting ===

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let seq = state.next();
        if let Some(entry) = state.entries.get_mut(self.key) {
            entry.waiters = entry.waiters.saturating_sub(1);
            entry.accessed = Instant::now();
            entry.accessed_seq = seq;
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
}
