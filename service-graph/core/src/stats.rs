//! Statistics attached to flows, nodes and edges.
//!
//! Every statistics type implements [`Combine`], which merges statistics gathered for the same
//! entity from different flows. Absent statistics are `None` and act as the identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Merges statistics for the same entity.
pub trait Combine {
    fn combine(&mut self, other: &Self);
}

impl<T: Combine + Clone> Combine for Option<T> {
    fn combine(&mut self, other: &Self) {
        let Some(other) = other else { return };
        match self {
            Some(this) => this.combine(other),
            None => *self = Some(other.clone()),
        }
    }
}

/// Combines two optional values into a new value.
pub fn combined<T: Combine + Clone>(a: &Option<T>, b: &Option<T>) -> Option<T> {
    let mut out = a.clone();
    out.combine(b);
    out
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPacketStats {
    pub packets_in: i64,
    pub packets_out: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConnectionStats {
    pub total_per_sample_interval: i64,
    pub started: i64,
    pub completed: i64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphTcpStats {
    pub sum_total_retransmissions: i64,
    pub sum_lost_packets: i64,
    pub sum_unrecovered_to: i64,
    pub min_send_congestion_window: f64,
    pub min_send_mss: f64,
    pub max_smooth_rtt: f64,
    pub max_min_rtt: f64,
    pub mean_send_congestion_window: f64,
    pub mean_smooth_rtt: f64,
    pub mean_min_rtt: f64,
    pub mean_mss: f64,
    pub count: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphL3Stats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<GraphPacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_at_source: Option<GraphPacketStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_at_dest: Option<GraphPacketStats>,
    pub connections: GraphConnectionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<GraphTcpStats>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphL7PacketStats {
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub mean_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub count: i64,
}

/// HTTP statistics bucketed by response code class.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphL7Stats {
    #[serde(default, skip_serializing_if = "GraphL7PacketStats::is_empty")]
    pub response_code_1xx: GraphL7PacketStats,
    #[serde(default, skip_serializing_if = "GraphL7PacketStats::is_empty")]
    pub response_code_2xx: GraphL7PacketStats,
    #[serde(default, skip_serializing_if = "GraphL7PacketStats::is_empty")]
    pub response_code_3xx: GraphL7PacketStats,
    #[serde(default, skip_serializing_if = "GraphL7PacketStats::is_empty")]
    pub response_code_4xx: GraphL7PacketStats,
    #[serde(default, skip_serializing_if = "GraphL7PacketStats::is_empty")]
    pub response_code_5xx: GraphL7PacketStats,
    #[serde(default, skip_serializing_if = "GraphL7PacketStats::is_empty")]
    pub no_response: GraphL7PacketStats,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphLatency {
    pub mean: f64,
    pub max: f64,
    pub count: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDnsResponseCode {
    pub code: String,
    pub count: i64,
    pub latency: GraphLatency,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDnsStats {
    pub latency: GraphLatency,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_codes: BTreeMap<String, GraphDnsResponseCode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEndpointProcess {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub min_num_names_per_flow: i64,
    pub max_num_names_per_flow: i64,
    pub min_num_ids_per_flow: i64,
    pub max_num_ids_per_flow: i64,
}

/// Processes keyed by `source:destination:process`.
pub type GraphEndpointProcesses = BTreeMap<String, GraphEndpointProcess>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphProcesses {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source: GraphEndpointProcesses,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dest: GraphEndpointProcesses,
}

/// All statistics for one time interval.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3: Option<GraphL3Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l7: Option<GraphL7Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<GraphDnsStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<GraphProcesses>,
}

/// Combines two time series element-wise.
pub fn combine_series(series: &mut Vec<GraphStats>, other: &[GraphStats]) {
    if series.len() < other.len() {
        series.resize_with(other.len(), GraphStats::default);
    }
    for (stats, other) in series.iter_mut().zip(other) {
        stats.combine(other);
    }
}

fn weighted_mean(a: f64, a_count: i64, b: f64, b_count: i64) -> f64 {
    let total = a_count + b_count;
    if total == 0 {
        return 0.0;
    }
    (a * a_count as f64 + b * b_count as f64) / total as f64
}

// === impl GraphPacketStats ===

impl GraphPacketStats {
    /// The proportion of traffic attributed to `self` when traffic is split between `self` and
    /// `other`. Bytes are used where present, falling back to packets.
    pub fn prop(&self, other: &Self) -> f64 {
        let bytes = self.bytes_in + self.bytes_out;
        let other_bytes = other.bytes_in + other.bytes_out;
        if bytes + other_bytes > 0 {
            return bytes as f64 / (bytes + other_bytes) as f64;
        }

        let packets = self.packets_in + self.packets_out;
        let other_packets = other.packets_in + other.packets_out;
        if packets + other_packets > 0 {
            return packets as f64 / (packets + other_packets) as f64;
        }

        1.0
    }

    pub fn multiply(&self, factor: f64) -> Self {
        let scale = |v: i64| (v as f64 * factor) as i64;
        Self {
            packets_in: scale(self.packets_in),
            packets_out: scale(self.packets_out),
            bytes_in: scale(self.bytes_in),
            bytes_out: scale(self.bytes_out),
        }
    }

    pub fn sub(&self, other: &Self) -> Self {
        Self {
            packets_in: self.packets_in - other.packets_in,
            packets_out: self.packets_out - other.packets_out,
            bytes_in: self.bytes_in - other.bytes_in,
            bytes_out: self.bytes_out - other.bytes_out,
        }
    }
}

impl Combine for GraphPacketStats {
    fn combine(&mut self, other: &Self) {
        self.packets_in += other.packets_in;
        self.packets_out += other.packets_out;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
    }
}

// === impl GraphConnectionStats ===

impl Combine for GraphConnectionStats {
    fn combine(&mut self, other: &Self) {
        self.total_per_sample_interval += other.total_per_sample_interval;
        self.started += other.started;
        self.completed += other.completed;
    }
}

// === impl GraphTcpStats ===

impl GraphTcpStats {
    /// All-zero statistics carry no information; they indicate a missing TCP block.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Combine for GraphTcpStats {
    fn combine(&mut self, other: &Self) {
        let (c1, c2) = (self.count, other.count);
        self.sum_total_retransmissions += other.sum_total_retransmissions;
        self.sum_lost_packets += other.sum_lost_packets;
        self.sum_unrecovered_to += other.sum_unrecovered_to;
        self.min_send_congestion_window = self
            .min_send_congestion_window
            .min(other.min_send_congestion_window);
        self.min_send_mss = self.min_send_mss.min(other.min_send_mss);
        self.max_smooth_rtt = self.max_smooth_rtt.max(other.max_smooth_rtt);
        self.max_min_rtt = self.max_min_rtt.max(other.max_min_rtt);
        self.mean_send_congestion_window = weighted_mean(
            self.mean_send_congestion_window,
            c1,
            other.mean_send_congestion_window,
            c2,
        );
        self.mean_smooth_rtt = weighted_mean(self.mean_smooth_rtt, c1, other.mean_smooth_rtt, c2);
        self.mean_min_rtt = weighted_mean(self.mean_min_rtt, c1, other.mean_min_rtt, c2);
        self.mean_mss = weighted_mean(self.mean_mss, c1, other.mean_mss, c2);
        self.count = c1 + c2;
    }
}

// === impl GraphL3Stats ===

impl Combine for GraphL3Stats {
    fn combine(&mut self, other: &Self) {
        self.allowed.combine(&other.allowed);
        self.denied_at_source.combine(&other.denied_at_source);
        self.denied_at_dest.combine(&other.denied_at_dest);
        self.connections.combine(&other.connections);
        self.tcp.combine(&other.tcp);
    }
}

// === impl GraphL7PacketStats ===

impl GraphL7PacketStats {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Combine for GraphL7PacketStats {
    fn combine(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.mean_duration =
            weighted_mean(self.mean_duration, self.count, other.mean_duration, other.count);
        self.min_duration = self.min_duration.min(other.min_duration);
        self.max_duration = self.max_duration.max(other.max_duration);
        self.count += other.count;
    }
}

// === impl GraphL7Stats ===

impl GraphL7Stats {
    /// The bucket for an HTTP response code. Anything outside 100..600 counts as no response.
    pub fn bucket_mut(&mut self, code: u16) -> &mut GraphL7PacketStats {
        match code {
            100..=199 => &mut self.response_code_1xx,
            200..=299 => &mut self.response_code_2xx,
            300..=399 => &mut self.response_code_3xx,
            400..=499 => &mut self.response_code_4xx,
            500..=599 => &mut self.response_code_5xx,
            _ => &mut self.no_response,
        }
    }
}

impl Combine for GraphL7Stats {
    fn combine(&mut self, other: &Self) {
        self.response_code_1xx.combine(&other.response_code_1xx);
        self.response_code_2xx.combine(&other.response_code_2xx);
        self.response_code_3xx.combine(&other.response_code_3xx);
        self.response_code_4xx.combine(&other.response_code_4xx);
        self.response_code_5xx.combine(&other.response_code_5xx);
        self.no_response.combine(&other.no_response);
    }
}

// === impl GraphDnsStats ===

impl Combine for GraphLatency {
    fn combine(&mut self, other: &Self) {
        self.mean = weighted_mean(self.mean, self.count, other.mean, other.count);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }
}

impl Combine for GraphDnsStats {
    fn combine(&mut self, other: &Self) {
        self.latency.combine(&other.latency);
        for (code, rc) in &other.response_codes {
            let entry = self
                .response_codes
                .entry(code.clone())
                .or_insert_with(|| GraphDnsResponseCode {
                    code: rc.code.clone(),
                    ..Default::default()
                });
            entry.count += rc.count;
            entry.latency.combine(&rc.latency);
        }
    }
}

// === impl GraphProcesses ===

impl Combine for GraphEndpointProcess {
    fn combine(&mut self, other: &Self) {
        self.min_num_names_per_flow = self.min_num_names_per_flow.min(other.min_num_names_per_flow);
        self.max_num_names_per_flow = self.max_num_names_per_flow.max(other.max_num_names_per_flow);
        self.min_num_ids_per_flow = self.min_num_ids_per_flow.min(other.min_num_ids_per_flow);
        self.max_num_ids_per_flow = self.max_num_ids_per_flow.max(other.max_num_ids_per_flow);
    }
}

impl Combine for GraphEndpointProcesses {
    fn combine(&mut self, other: &Self) {
        for (key, process) in other {
            match self.get_mut(key) {
                Some(existing) => existing.combine(process),
                None => {
                    self.insert(key.clone(), process.clone());
                }
            }
        }
    }
}

impl Combine for GraphProcesses {
    fn combine(&mut self, other: &Self) {
        self.source.combine(&other.source);
        self.dest.combine(&other.dest);
    }
}

// === impl GraphStats ===

impl Combine for GraphStats {
    fn combine(&mut self, other: &Self) {
        self.l3.combine(&other.l3);
        self.l7.combine(&other.l7);
        self.dns.combine(&other.dns);
        self.processes.combine(&other.processes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(packets_in: i64, bytes_in: i64) -> GraphPacketStats {
        GraphPacketStats {
            packets_in,
            packets_out: 0,
            bytes_in,
            bytes_out: 0,
        }
    }

    #[test]
    fn absent_stats_are_identity() {
        let mut a = None;
        a.combine(&Some(packets(1, 10)));
        assert_eq!(a, Some(packets(1, 10)));
        a.combine(&None);
        assert_eq!(a, Some(packets(1, 10)));
        a.combine(&Some(packets(2, 5)));
        assert_eq!(a, Some(packets(3, 15)));
    }

    #[test]
    fn prop_prefers_bytes_then_packets() {
        assert_eq!(packets(1, 30).prop(&packets(100, 10)), 0.75);
        assert_eq!(packets(1, 0).prop(&packets(3, 0)), 0.25);
        assert_eq!(packets(0, 0).prop(&packets(0, 0)), 1.0);
    }

    #[test]
    fn multiply_and_sub_partition_stats() {
        let total = packets(10, 101);
        let allowed = total.multiply(0.5);
        assert_eq!(allowed, packets(5, 50));
        assert_eq!(total.sub(&allowed), packets(5, 51));
    }

    #[test]
    fn tcp_means_are_count_weighted() {
        let mut a = GraphTcpStats {
            min_send_mss: 1400.0,
            max_smooth_rtt: 3.0,
            mean_smooth_rtt: 1.0,
            sum_lost_packets: 2,
            count: 1,
            ..Default::default()
        };
        let b = GraphTcpStats {
            min_send_mss: 1200.0,
            max_smooth_rtt: 2.0,
            mean_smooth_rtt: 4.0,
            sum_lost_packets: 3,
            count: 3,
            ..Default::default()
        };
        a.combine(&b);
        assert_eq!(a.min_send_mss, 1200.0);
        assert_eq!(a.max_smooth_rtt, 3.0);
        assert_eq!(a.mean_smooth_rtt, 3.25);
        assert_eq!(a.sum_lost_packets, 5);
        assert_eq!(a.count, 4);
        assert!(!a.is_empty());
        assert!(GraphTcpStats::default().is_empty());
    }

    #[test]
    fn l7_buckets_by_response_class() {
        let mut stats = GraphL7Stats::default();
        stats.bucket_mut(204).count += 1;
        stats.bucket_mut(503).count += 2;
        stats.bucket_mut(0).count += 3;
        stats.bucket_mut(700).count += 1;
        assert_eq!(stats.response_code_2xx.count, 1);
        assert_eq!(stats.response_code_5xx.count, 2);
        assert_eq!(stats.no_response.count, 4);
    }

    #[test]
    fn empty_l7_bucket_does_not_skew_min() {
        let mut a = GraphL7PacketStats::default();
        let b = GraphL7PacketStats {
            min_duration: 5.0,
            max_duration: 9.0,
            mean_duration: 7.0,
            count: 2,
            ..Default::default()
        };
        a.combine(&b);
        assert_eq!(a, b);
    }

    #[test]
    fn processes_combine_min_max() {
        let process = |min: i64, max: i64| GraphEndpointProcess {
            name: "curl".to_string(),
            source: "a".to_string(),
            destination: "b".to_string(),
            min_num_names_per_flow: min,
            max_num_names_per_flow: max,
            min_num_ids_per_flow: min,
            max_num_ids_per_flow: max,
        };
        let mut a = GraphEndpointProcesses::new();
        a.insert("a:b:curl".to_string(), process(2, 3));
        let mut b = GraphEndpointProcesses::new();
        b.insert("a:b:curl".to_string(), process(1, 2));
        b.insert("a:b:-".to_string(), process(0, 0));
        a.combine(&b);
        assert_eq!(a.len(), 2);
        assert_eq!(a["a:b:curl"], process(1, 3));
    }

    #[test]
    fn series_combine_element_wise() {
        let l3 = |n| GraphStats {
            l3: Some(GraphL3Stats {
                allowed: Some(packets(n, n)),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut series = vec![l3(1)];
        combine_series(&mut series, &[l3(2), l3(3)]);
        assert_eq!(series, vec![l3(3), l3(3)]);
    }
}
