//! Reconciles flow records reported by either end of a connection into one flow per source,
//! destination and service.
//!
//! Both ends of a connection may log it. The source knows the service it addressed but may not
//! know whether the destination's policy dropped the traffic; the destination knows that but
//! usually not the service. Records for one destination group arrive contiguously, so the
//! reconciler accumulates a group at a time and flushes when the group changes.

use crate::{Action, Backend, L3Bucket, Reconciled, Reporter};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use service_graph_core::{
    ports::{AggregatedProtoPorts, PortRangeSet},
    stats::{
        combined, Combine, GraphConnectionStats, GraphEndpointProcess, GraphEndpointProcesses,
        GraphL3Stats, GraphPacketStats, GraphProcesses, GraphTcpStats,
    },
    Error, FlowEdge, FlowEndpoint, Result, ServicePort, TimeRange,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use tracing::{debug, error, instrument, trace, warn};

#[cfg(test)]
mod tests;

const MAX_AGGREGATED_PROTOCOLS: usize = 10;
const MAX_PORT_RANGES_PER_PROTOCOL: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct L3Flow {
    pub edge: FlowEdge,

    /// The ports accessed on the destination when the flow does not go through a service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_proto_ports: Option<AggregatedProtoPorts>,

    pub stats: GraphL3Stats,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<GraphProcesses>,
}

/// Accumulates records one destination group at a time.
#[derive(Debug)]
pub struct L3Reconciler {
    flows: Vec<L3Flow>,
    current: Option<(FlowEndpoint, DestinationGroup)>,
    max_records: usize,
    truncated: bool,
}

#[derive(Debug, Default)]
struct DestinationGroup {
    sources: BTreeMap<FlowEndpoint, SourceData>,

    /// Destinations seen with a service in this group.
    service_destinations: HashSet<FlowEndpoint>,
}

#[derive(Debug, Default)]
struct SourceData {
    service_destinations: BTreeMap<FlowEndpoint, Reconciliation>,
    other: Reconciliation,
    other_ports: BTreeMap<String, Option<PortRangeSet>>,
}

#[derive(Debug, Default)]
struct Reconciliation {
    source: Reports,
    dest: Reports,
}

#[derive(Debug, Default)]
struct Reports {
    allowed: HashMap<ServicePort, FlowStats>,
    denied: HashMap<ServicePort, FlowStats>,
}

#[derive(Clone, Debug, Default)]
struct FlowStats {
    packets: Option<GraphPacketStats>,
    connections: GraphConnectionStats,
    tcp: Option<GraphTcpStats>,
    processes: GraphEndpointProcesses,
}

static NO_STATS: FlowStats = FlowStats {
    packets: None,
    connections: GraphConnectionStats {
        total_per_sample_interval: 0,
        started: 0,
        completed: 0,
    },
    tcp: None,
    processes: BTreeMap::new(),
};

/// Reads and reconciles all flow records for a time range.
///
/// Stops reading once more than `max_records` flows would be produced, returning the first
/// `max_records` flows marked as truncated.
#[instrument(skip(backend, range, flush_interval), fields(range = %range))]
pub async fn l3_flows(
    backend: &dyn Backend,
    cluster: &str,
    range: &TimeRange,
    flush_interval: Duration,
    max_records: usize,
) -> Result<Reconciled<L3Flow>> {
    let mut buckets = backend.l3_flows(cluster, range).await?;
    let mut reconciler = L3Reconciler::new(max_records);
    let mut truncated = false;
    let mut raw = 0usize;
    while let Some(bucket) = buckets.next().await {
        raw += 1;
        match bucket.and_then(|b| reconciler.add(&b)) {
            Ok(()) => {}
            Err(Error::DataTruncated) => {
                warn!(raw, "Flow records truncated");
                truncated = true;
                break;
            }
            Err(error) => return Err(error),
        }
    }

    let out = reconciler.finish(range.duration(), flush_interval);
    if out.truncated && !truncated {
        warn!(raw, "Flow records truncated");
    }
    debug!(raw, flows = out.flows.len(), "Reconciled flows");
    Ok(Reconciled {
        flows: out.flows,
        truncated: truncated || out.truncated,
    })
}

fn no_process_name(name: &str) -> &str {
    if name.is_empty() {
        "-"
    } else {
        name
    }
}

fn processes(
    source: GraphEndpointProcesses,
    dest: GraphEndpointProcesses,
) -> Option<GraphProcesses> {
    if source.is_empty() && dest.is_empty() {
        return None;
    }
    Some(GraphProcesses { source, dest })
}

fn flow(
    source: &FlowEndpoint,
    dest: &FlowEndpoint,
    svc: &ServicePort,
    stats: GraphL3Stats,
    processes: Option<GraphProcesses>,
) -> L3Flow {
    L3Flow {
        edge: FlowEdge {
            source: source.clone(),
            dest: dest.clone(),
            service_port: (!svc.name.is_empty()).then(|| svc.clone()),
        },
        aggregated_proto_ports: None,
        stats,
        processes,
    }
}

// === impl L3Reconciler ===

impl L3Reconciler {
    pub fn new(max_records: usize) -> Self {
        Self {
            flows: Vec::new(),
            current: None,
            max_records,
            truncated: false,
        }
    }

    /// Adds a record, failing with [`Error::DataTruncated`] once too many flows were produced.
    pub fn add(&mut self, bucket: &L3Bucket) -> Result<()> {
        let source = bucket.source.to_endpoint()?;
        let dest = bucket.dest.to_dest_endpoint(&bucket.protocol)?;
        let service = bucket
            .service
            .as_ref()
            .and_then(|svc| svc.to_service_port(&bucket.protocol));
        let stats = FlowStats::from_bucket(bucket, &source, &dest);

        let group = dest.service_group_key();
        if !matches!(&self.current, Some((key, _)) if *key == group) {
            self.flush();
            if self.drop_excess() {
                return Err(Error::DataTruncated);
            }
            trace!(%group, "Collating flows");
        }
        let (_, data) = self
            .current
            .get_or_insert_with(|| (group, DestinationGroup::default()));

        match &service {
            Some(svc) => trace!(reporter = ?bucket.reporter, "{source} -> {svc} -> {dest}"),
            None => trace!(reporter = ?bucket.reporter, "{source} -> {dest}"),
        }
        data.add(bucket.reporter, bucket.action, source, service, dest, stats);
        Ok(())
    }

    /// Returns at most `max_records` flows with connection counts scaled to one collector flush
    /// interval.
    pub fn finish(mut self, window: Duration, flush_interval: Duration) -> Reconciled<L3Flow> {
        // A group cut short by truncation is incomplete.
        if !self.truncated {
            self.flush();
            self.drop_excess();
        }

        let flushes = window.as_secs_f64() / flush_interval.as_secs_f64();
        if flushes.is_finite() && flushes > 0.0 {
            for flow in &mut self.flows {
                let total = &mut flow.stats.connections.total_per_sample_interval;
                *total = (*total as f64 / flushes) as i64;
            }
        }
        Reconciled {
            flows: self.flows,
            truncated: self.truncated,
        }
    }

    /// Drops flows past `max_records`, returning true if any were dropped.
    fn drop_excess(&mut self) -> bool {
        if self.flows.len() <= self.max_records {
            return false;
        }
        self.flows.truncate(self.max_records);
        self.truncated = true;
        true
    }

    fn flush(&mut self) {
        if let Some((group, data)) = self.current.take() {
            let before = self.flows.len();
            self.flows.extend(data.into_flows(&group));
            trace!(%group, flows = self.flows.len() - before, "Flushed destination group");
        }
    }
}

// === impl DestinationGroup ===

impl DestinationGroup {
    fn add(
        &mut self,
        reporter: Reporter,
        action: Action,
        source: FlowEndpoint,
        service: Option<ServicePort>,
        dest: FlowEndpoint,
        stats: FlowStats,
    ) {
        if service.is_some() {
            self.service_destinations.insert(dest.clone());
        }
        let is_service = self.service_destinations.contains(&dest);
        self.sources
            .entry(source)
            .or_default()
            .add(reporter, action, service, dest, stats, is_service);
    }

    fn into_flows(self, group: &FlowEndpoint) -> Vec<L3Flow> {
        self.sources
            .into_iter()
            .flat_map(|(source, data)| data.into_flows(&source, group))
            .collect()
    }
}

// === impl SourceData ===

impl SourceData {
    fn add(
        &mut self,
        reporter: Reporter,
        action: Action,
        service: Option<ServicePort>,
        dest: FlowEndpoint,
        stats: FlowStats,
        is_service: bool,
    ) {
        if is_service {
            // Records without a service are keyed by protocol so they match any service on it.
            let svc = service.unwrap_or_else(|| ServicePort {
                protocol: dest.protocol.clone(),
                ..Default::default()
            });
            self.service_destinations
                .entry(dest)
                .or_default()
                .add(reporter, action, svc, stats);
            return;
        }

        let ports = self.other_ports.entry(dest.protocol.clone()).or_default();
        if let Some(port) = dest.port {
            ports.get_or_insert_with(Default::default).insert(port.get());
        }
        self.other
            .add(reporter, action, ServicePort::default(), stats);
    }

    fn into_flows(self, source: &FlowEndpoint, group: &FlowEndpoint) -> Vec<L3Flow> {
        let mut flows = Vec::new();
        for (dest, rc) in self.service_destinations {
            flows.extend(rc.into_flows(source, &dest));
        }

        if self.other.is_empty() {
            return flows;
        }
        let dest = group.without_port();
        let mut other = self.other.into_flows(source, &dest);
        if other.len() != 1 {
            error!(%source, %dest, flows = other.len(), "Expected a single unserviced flow");
            return flows;
        }
        let mut flow = other.remove(0);
        flow.aggregated_proto_ports = Some(AggregatedProtoPorts::summarize(
            self.other_ports.iter().map(|(p, s)| (p.as_str(), s.as_ref())),
            MAX_AGGREGATED_PROTOCOLS,
            MAX_PORT_RANGES_PER_PROTOCOL,
        ));
        flows.push(flow);
        flows
    }
}

// === impl Reconciliation ===

impl Reconciliation {
    fn is_empty(&self) -> bool {
        self.source.is_empty() && self.dest.is_empty()
    }

    fn add(&mut self, reporter: Reporter, action: Action, svc: ServicePort, stats: FlowStats) {
        match reporter {
            Reporter::Src => self.source.add(action, svc, stats),
            Reporter::Dst => self.dest.add(action, svc, stats),
        }
    }

    fn into_flows(self, source: &FlowEndpoint, dest: &FlowEndpoint) -> Vec<L3Flow> {
        match (self.source.is_empty(), self.dest.is_empty()) {
            (true, true) => Vec::new(),
            (false, true) => self
                .source
                .services()
                .into_iter()
                .map(|svc| {
                    let (allowed, denied) = (self.source.allowed(svc), self.source.denied(svc));
                    let stats = GraphL3Stats {
                        allowed: allowed.packets,
                        denied_at_source: denied.packets,
                        connections: allowed.connections_with(denied),
                        tcp: allowed.tcp,
                        ..Default::default()
                    };
                    let procs = processes(allowed.processes_with(denied), Default::default());
                    flow(source, dest, svc, stats, procs)
                })
                .collect(),
            (true, false) => self
                .dest
                .services()
                .into_iter()
                .map(|svc| {
                    let (allowed, denied) = (self.dest.allowed(svc), self.dest.denied(svc));
                    let stats = GraphL3Stats {
                        allowed: allowed.packets,
                        denied_at_dest: denied.packets,
                        connections: allowed.connections_with(denied),
                        tcp: allowed.tcp,
                        ..Default::default()
                    };
                    let procs = processes(Default::default(), allowed.processes_with(denied));
                    flow(source, dest, svc, stats, procs)
                })
                .collect(),
            (false, false) => self
                .source
                .services()
                .into_iter()
                .map(|svc| self.reconcile(source, dest, svc))
                .collect(),
        }
    }

    /// Splits the source-reported traffic between allowed and denied at the destination.
    fn reconcile(&self, source: &FlowEndpoint, dest: &FlowEndpoint, svc: &ServicePort) -> L3Flow {
        let bare = ServicePort {
            protocol: svc.protocol.clone(),
            ..Default::default()
        };
        let (src_allowed, src_denied) = (self.source.allowed(svc), self.source.denied(svc));

        let mut allowed_at_dest = None;
        for stats in matching(&self.dest.allowed, svc, &bare) {
            allowed_at_dest.combine(&stats.packets);
        }
        let mut denied_at_dest = None;
        for stats in matching(&self.dest.denied, svc, &bare) {
            denied_at_dest.combine(&stats.packets);
        }

        let mut stats = GraphL3Stats {
            denied_at_source: src_denied.packets,
            connections: src_allowed.connections_with(src_denied),
            ..Default::default()
        };
        match (allowed_at_dest, denied_at_dest) {
            (None, _) => stats.denied_at_dest = src_allowed.packets,
            (Some(_), None) => stats.allowed = src_allowed.packets,
            (Some(allowed_at_dest), Some(denied_at_dest)) => {
                let prop = allowed_at_dest.prop(&denied_at_dest);
                if let Some(total) = src_allowed.packets {
                    let allowed = total.multiply(prop);
                    stats.denied_at_dest = Some(total.sub(&allowed));
                    stats.allowed = Some(allowed);
                }
            }
        }

        let mut tcp = combined(&src_allowed.tcp, &src_denied.tcp);
        tcp.combine(&self.dest.allowed(svc).tcp);
        tcp.combine(&self.dest.denied(svc).tcp);
        stats.tcp = tcp;

        let mut dest_processes = GraphEndpointProcesses::new();
        for stats in matching(&self.dest.allowed, svc, &bare)
            .chain(matching(&self.dest.denied, svc, &bare))
        {
            dest_processes.combine(&stats.processes);
        }
        let procs = processes(src_allowed.processes_with(src_denied), dest_processes);

        flow(source, dest, svc, stats, procs)
    }
}

/// The reports for a service along with reports that only know the protocol.
fn matching<'a>(
    reports: &'a HashMap<ServicePort, FlowStats>,
    svc: &'a ServicePort,
    bare: &'a ServicePort,
) -> impl Iterator<Item = &'a FlowStats> + 'a {
    let bare = (bare != svc).then_some(bare);
    std::iter::once(svc)
        .chain(bare)
        .filter_map(move |key| reports.get(key))
}

// === impl Reports ===

impl Reports {
    fn is_empty(&self) -> bool {
        self.allowed.is_empty() && self.denied.is_empty()
    }

    fn add(&mut self, action: Action, svc: ServicePort, stats: FlowStats) {
        let reports = match action {
            Action::Allow => &mut self.allowed,
            Action::Deny => &mut self.denied,
        };
        reports.entry(svc).or_default().add(stats);
    }

    fn services(&self) -> BTreeSet<&ServicePort> {
        self.allowed.keys().chain(self.denied.keys()).collect()
    }

    fn allowed(&self, svc: &ServicePort) -> &FlowStats {
        self.allowed.get(svc).unwrap_or(&NO_STATS)
    }

    fn denied(&self, svc: &ServicePort) -> &FlowStats {
        self.denied.get(svc).unwrap_or(&NO_STATS)
    }
}

// === impl FlowStats ===

impl FlowStats {
    fn from_bucket(bucket: &L3Bucket, source: &FlowEndpoint, dest: &FlowEndpoint) -> Self {
        let log = bucket.log_stats.unwrap_or_default();

        let tcp = bucket
            .tcp
            .filter(|_| bucket.protocol == "tcp")
            .map(|t| GraphTcpStats {
                sum_total_retransmissions: t.total_retransmissions,
                sum_lost_packets: t.lost_packets,
                sum_unrecovered_to: t.unrecovered_to,
                min_send_congestion_window: t.min_send_congestion_window,
                min_send_mss: t.min_mss,
                max_smooth_rtt: t.max_smooth_rtt,
                max_min_rtt: t.max_min_rtt,
                mean_send_congestion_window: t.mean_send_congestion_window,
                mean_smooth_rtt: t.mean_smooth_rtt,
                mean_min_rtt: t.mean_min_rtt,
                mean_mss: t.mean_mss,
                count: 0,
            })
            // All-zero statistics mean there was no data. Counting them would dilute the means.
            .filter(|t| !t.is_empty())
            .and_then(|t| {
                let log = bucket.log_stats?;
                Some(GraphTcpStats {
                    count: log.flow_log_count,
                    ..t
                })
            });

        let name = bucket.process.as_deref().unwrap_or_default();
        let ps = bucket.process_stats.unwrap_or_default();
        let mut processes = GraphEndpointProcesses::new();
        processes.insert(
            format!("{}:{}:{}", source.name_aggr, dest.name_aggr, name),
            GraphEndpointProcess {
                name: no_process_name(name).to_string(),
                source: source.name_aggr.clone(),
                destination: dest.name_aggr.clone(),
                min_num_names_per_flow: ps.min_num_names_per_flow,
                max_num_names_per_flow: ps.max_num_names_per_flow,
                min_num_ids_per_flow: ps.min_num_ids_per_flow,
                max_num_ids_per_flow: ps.max_num_ids_per_flow,
            },
        );

        Self {
            packets: Some(bucket.traffic.unwrap_or_default()),
            connections: GraphConnectionStats {
                total_per_sample_interval: log.log_count,
                started: log.started,
                completed: log.completed,
            },
            tcp,
            processes,
        }
    }

    fn add(&mut self, other: Self) {
        self.packets.combine(&other.packets);
        self.connections.combine(&other.connections);
        self.tcp.combine(&other.tcp);
        self.processes.combine(&other.processes);
    }

    fn connections_with(&self, other: &Self) -> GraphConnectionStats {
        let mut connections = self.connections;
        connections.combine(&other.connections);
        connections
    }

    fn processes_with(&self, other: &Self) -> GraphEndpointProcesses {
        let mut processes = self.processes.clone();
        processes.combine(&other.processes);
        processes
    }
}
