//! Service graph response types.

use crate::{
    ports::AggregatedProtoPorts,
    selector::GraphSelectors,
    stats::{combine_series, GraphStats},
    GraphNodeId, GraphNodeType, ServicePort,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, time::Duration};

/// A time window for a graph query.
///
/// When `now` is set, the range is relative to it, e.g. "the last 15 minutes", and the cache
/// refreshes the data as time moves on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: GraphNodeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<GraphNodeId>,

    #[serde(rename = "type")]
    pub node_type: Option<GraphNodeType>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub layer: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub service_ports: BTreeSet<ServicePort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_protocol_ports: Option<AggregatedProtoPorts>,

    /// Traffic between children of this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats_within: Vec<GraphStats>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats_ingress: Vec<GraphStats>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats_egress: Vec<GraphStats>,

    pub expandable: bool,
    pub expanded: bool,

    /// Set when some ingress connections are outside of the view.
    pub follow_ingress: bool,

    /// Set when some egress connections are outside of the view.
    pub follow_egress: bool,

    #[serde(default, skip_serializing_if = "is_zero_count")]
    pub events_count: u32,

    pub selectors: GraphSelectors,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdgeId {
    pub source_node_id: GraphNodeId,
    pub dest_node_id: GraphNodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: GraphEdgeId,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<GraphStats>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub service_ports: BTreeSet<ServicePort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_protocol_ports: Option<AggregatedProtoPorts>,

    pub selectors: GraphSelectors,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceGraphResponse {
    /// The time ranges the statistics were gathered over, one per statistics entry.
    pub time_intervals: Vec<TimeRange>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub selectors: GraphSelectors,
    pub truncated: bool,
}

fn is_zero(n: &u16) -> bool {
    *n == 0
}

fn is_zero_count(n: &u32) -> bool {
    *n == 0
}

// === impl TimeRange ===

impl TimeRange {
    pub fn duration(&self) -> Duration {
        (self.to - self.from).to_std().unwrap_or_default()
    }

    pub fn is_relative(&self) -> bool {
        self.now.is_some()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

// === impl GraphNode ===

impl GraphNode {
    pub fn include_service_port(&mut self, sp: &ServicePort) {
        self.service_ports.insert(sp.clone());
    }

    pub fn include_aggregated_proto_ports(&mut self, ports: &AggregatedProtoPorts) {
        match &mut self.aggregated_protocol_ports {
            Some(existing) => existing.include(ports),
            None => self.aggregated_protocol_ports = Some(ports.clone()),
        }
    }

    pub fn include_stats_within(&mut self, stats: &[GraphStats]) {
        combine_series(&mut self.stats_within, stats);
    }

    pub fn include_stats_ingress(&mut self, stats: &[GraphStats]) {
        combine_series(&mut self.stats_ingress, stats);
    }

    pub fn include_stats_egress(&mut self, stats: &[GraphStats]) {
        combine_series(&mut self.stats_egress, stats);
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({}", self.id)?;
        if let Some(parent) = &self.parent_id {
            write!(f, "; parent={parent}")?;
        }
        write!(
            f,
            "; expandable={}; expanded={})",
            self.expandable, self.expanded
        )
    }
}

// === impl GraphEdge ===

impl GraphEdge {
    pub fn new(id: GraphEdgeId, stats: &[GraphStats]) -> Self {
        Self {
            id,
            stats: stats.to_vec(),
            ..Default::default()
        }
    }

    pub fn include_stats(&mut self, stats: &[GraphStats]) {
        combine_series(&mut self.stats, stats);
    }

    pub fn include_service_port(&mut self, sp: &ServicePort) {
        self.service_ports.insert(sp.clone());
    }

    pub fn include_endpoint_proto_ports(&mut self, ports: Option<&AggregatedProtoPorts>) {
        let Some(ports) = ports else { return };
        match &mut self.endpoint_protocol_ports {
            Some(existing) => existing.include(ports),
            None => self.endpoint_protocol_ports = Some(ports.clone()),
        }
    }
}

impl fmt::Display for GraphEdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_node_id, self.dest_node_id)
    }
}
