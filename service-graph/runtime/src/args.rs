use crate::{api::Api, authz::AuthzClient, client::JsonClient, server, store::LogStore};
use anyhow::{Context, Result};
use clap::Parser;
use hyper::Uri;
use prometheus_client::registry::Registry;
use service_graph_cache::{CacheMetrics, Config, ServiceGraphCache};
use std::{net::SocketAddr, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "service-graph", about = "Serves service graphs built from flow logs")]
pub struct Args {
    #[clap(long, default_value = "service_graph=info,warn", env = "SERVICE_GRAPH_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "SERVICE_GRAPH_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8090")]
    api_addr: SocketAddr,

    /// Base URL of the log store gateway.
    #[clap(long, env = "SERVICE_GRAPH_LOG_STORE_URL")]
    log_store_url: Uri,

    /// Base URL of the authorization service.
    #[clap(long, env = "SERVICE_GRAPH_AUTHZ_URL")]
    authz_url: Uri,

    /// The number of records read from the log store per request.
    #[clap(long, default_value = "1000", env = "SERVICE_GRAPH_MAX_BUCKETS_PER_QUERY")]
    max_buckets_per_query: usize,

    /// The number of flows, HTTP flows or DNS clients gathered before the data is truncated.
    #[clap(long, default_value = "100000", env = "SERVICE_GRAPH_MAX_AGGREGATED_RECORDS")]
    max_aggregated_records: usize,

    /// The number of idle relative time windows kept in the cache.
    #[clap(long, default_value = "10", env = "SERVICE_GRAPH_CACHE_MAX_ENTRIES")]
    cache_max_entries: usize,

    #[clap(long, default_value = "300", env = "SERVICE_GRAPH_CACHE_POLLED_ENTRY_AGE_OUT_SECS")]
    cache_polled_entry_age_out_secs: u64,

    #[clap(long, default_value = "300", env = "SERVICE_GRAPH_CACHE_SLOW_QUERY_ENTRY_AGE_OUT_SECS")]
    cache_slow_query_entry_age_out_secs: u64,

    #[clap(long, default_value = "120", env = "SERVICE_GRAPH_CACHE_POLL_LOOP_INTERVAL_SECS")]
    cache_poll_loop_interval_secs: u64,

    #[clap(long, default_value = "5", env = "SERVICE_GRAPH_CACHE_POLL_QUERY_INTERVAL_SECS")]
    cache_poll_query_interval_secs: u64,

    /// How long after a window ends its data may still change.
    #[clap(long, default_value = "900", env = "SERVICE_GRAPH_CACHE_DATA_SETTLE_TIME_SECS")]
    cache_data_settle_time_secs: u64,

    /// Relative windows within this many seconds of each other share a cache entry.
    #[clap(long, default_value = "1", env = "SERVICE_GRAPH_CACHE_RELATIVE_KEY_QUANTUM_SECS")]
    cache_relative_key_quantum_secs: u64,

    /// How long a request waits for data when it does not set its own timeout.
    #[clap(long, default_value = "60", env = "SERVICE_GRAPH_DEFAULT_TIMEOUT_SECS")]
    default_timeout_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin,
            api_addr,
            log_store_url,
            authz_url,
            max_buckets_per_query,
            max_aggregated_records,
            cache_max_entries,
            cache_polled_entry_age_out_secs,
            cache_slow_query_entry_age_out_secs,
            cache_poll_loop_interval_secs,
            cache_poll_query_interval_secs,
            cache_data_settle_time_secs,
            cache_relative_key_quantum_secs,
            default_timeout_secs,
        } = self;

        log_format.try_init(log_level)?;

        let config = Config {
            max_entries: cache_max_entries,
            polled_entry_age_out: Duration::from_secs(cache_polled_entry_age_out_secs),
            slow_query_entry_age_out: Duration::from_secs(cache_slow_query_entry_age_out_secs),
            poll_loop_interval: Duration::from_secs(cache_poll_loop_interval_secs),
            poll_query_interval: Duration::from_secs(cache_poll_query_interval_secs),
            data_settle_time: Duration::from_secs(cache_data_settle_time_secs),
            max_aggregated_records,
            relative_key_quantum: Duration::from_secs(cache_relative_key_quantum_secs),
            default_timeout: Duration::from_secs(default_timeout_secs),
        };
        info!(?config, %log_store_url, %authz_url, "Starting");

        let mut prom = <Registry>::default();
        let metrics = CacheMetrics::register(prom.sub_registry_with_prefix("service_graph_cache"));

        let store = LogStore::new(JsonClient::new(&log_store_url), max_buckets_per_query);
        let cache = ServiceGraphCache::new(config, Arc::new(store), metrics);
        tokio::spawn(cache.clone().poll_loop().instrument(info_span!("poll")));

        let admin = admin
            .into_builder()
            .with_prometheus(prom)
            .bind()
            .context("failed to bind admin server")?
            .spawn();

        let api = server::bind("api", api_addr).await?;
        let authz = AuthzClient::new(JsonClient::new(&authz_url));
        tokio::spawn(server::serve(api, Api::new(cache, authz)).instrument(info_span!("api")));
        admin.readiness().set(true);

        // Block the main thread on the shutdown signal. In-flight requests are dropped with the
        // runtime.
        shutdown().await?;
        info!("Shutting down");
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_and_admin_flags() {
        let args = Args::try_parse_from([
            "service-graph",
            "--log-store-url=http://store:8080",
            "--authz-url=http://authz:8080",
            "--log-level=service_graph=debug,warn",
            "--log-format=json",
            "--admin-addr=127.0.0.1:9990",
        ])
        .expect("args must parse");
        assert_eq!(args.api_addr, SocketAddr::from(([0, 0, 0, 0], 8090)));
        assert_eq!(args.cache_max_entries, 10);

        Args::try_parse_from(["service-graph", "--authz-url=http://authz:8080"])
            .expect_err("the log store URL is required");
    }
}
