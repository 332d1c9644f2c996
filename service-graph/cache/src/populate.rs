use service_graph_core::{Error, Result, TimeRange};
use service_graph_flows::{dns, events, l3, l7, Backend, RawData, RawEvent};
use tracing::{debug, instrument, warn};

/// Gathers everything the graph needs for one time window.
///
/// The flow configuration is read first since L3 reconciliation depends on the flush interval.
/// The remaining queries run concurrently and the first to fail fails the whole build.
#[instrument(skip(backend, range), fields(range = %range))]
pub(crate) async fn populate(
    backend: &dyn Backend,
    cluster: &str,
    range: &TimeRange,
    max_records: usize,
) -> Result<RawData> {
    let config = backend.flow_config(cluster).await?;
    let (l3, l7, dns, raw_events) = tokio::try_join!(
        l3::l3_flows(
            backend,
            cluster,
            range,
            config.l3_flush_interval,
            max_records
        ),
        l7::l7_flows(backend, cluster, range, max_records),
        dns::dns_logs(backend, cluster, range, max_records),
        fetch_events(backend, cluster, range, max_records),
    )?;
    let (raw_events, events_truncated) = raw_events;
    let events = events::parse_events(raw_events);

    let truncated = l3.truncated || l7.truncated || dns.truncated || events_truncated;
    debug!(
        l3 = l3.flows.len(),
        l7 = l7.flows.len(),
        dns = dns.flows.len(),
        events = events.len(),
        truncated,
        "Gathered service graph data"
    );
    Ok(RawData {
        time_range: range.clone(),
        l3: l3.flows,
        l7: l7.flows,
        dns: dns.flows,
        events,
        truncated,
    })
}

async fn fetch_events(
    backend: &dyn Backend,
    cluster: &str,
    range: &TimeRange,
    max_records: usize,
) -> Result<(Vec<RawEvent>, bool)> {
    match backend.events(cluster, range).await {
        Ok(mut events) if events.len() > max_records => {
            warn!(events = events.len(), "Events truncated");
            events.truncate(max_records);
            Ok((events, true))
        }
        Ok(events) => Ok((events, false)),
        Err(Error::DataTruncated) => {
            warn!("Events truncated");
            Ok((Vec::new(), true))
        }
        Err(error) => Err(error),
    }
}
