use crate::{Error, GraphNodeId, Result, TimeRange};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A request for the service graph of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGraphRequest {
    #[serde(default = "default_cluster")]
    pub cluster: String,

    pub time_range: TimeRange,

    #[serde(default)]
    pub selected_view: SelectedView,

    /// Seconds to wait for the data before failing with a retryable timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Requests fresh data even when cached data is available.
    #[serde(default)]
    pub force_refresh: bool,
}

/// The parts of the graph the user has selected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectedView {
    /// Nodes shown in full, along with their direct connections. Empty means the whole graph.
    pub focus: Vec<GraphNodeId>,

    pub expanded: Vec<GraphNodeId>,

    pub followed_egress: Vec<GraphNodeId>,

    pub followed_ingress: Vec<GraphNodeId>,

    pub layers: Vec<Layer>,

    pub host_aggregation_selectors: Vec<NamedSelector>,

    /// Show ports as separate nodes.
    pub expand_ports: bool,

    /// Keep following connections away from the focus in the direction of traffic.
    pub follow_connection_direction: bool,

    /// Separate sources and sinks of networks and network sets.
    pub split_ingress_egress: bool,
}

/// A user-defined group of nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<GraphNodeId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedSelector {
    pub name: String,
    pub selector: String,
}

fn default_cluster() -> String {
    "cluster".to_string()
}

impl ServiceGraphRequest {
    pub fn validate(&self) -> Result<()> {
        if self.cluster.is_empty() {
            return Err(Error::InvalidRequest("cluster must be set".to_string()));
        }
        if self.time_range.to < self.time_range.from {
            return Err(Error::InvalidRequest(format!(
                "time range {} ends before it starts",
                self.time_range
            )));
        }
        if self.timeout == Some(0) {
            return Err(Error::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_request() {
        let req = serde_json::from_str::<ServiceGraphRequest>(
            r#"{
                "time_range": {"from": "2026-01-01T10:00:00Z", "to": "2026-01-01T10:15:00Z"},
                "selected_view": {"focus": ["namespace/shop"], "expand_ports": true}
            }"#,
        )
        .expect("request must parse");
        assert_eq!(req.cluster, "cluster");
        assert_eq!(req.selected_view.focus, vec![GraphNodeId::from("namespace/shop")]);
        assert!(req.selected_view.expand_ports);
        assert!(!req.force_refresh);
        assert_eq!(req.time_range.duration(), Duration::from_secs(900));
        assert_eq!(req.timeout(Duration::from_secs(60)), Duration::from_secs(60));
        req.validate().expect("request must be valid");
    }

    #[test]
    fn rejects_reversed_time_range() {
        let req = serde_json::from_str::<ServiceGraphRequest>(
            r#"{
                "cluster": "c1",
                "time_range": {"from": "2026-01-01T10:15:00Z", "to": "2026-01-01T10:00:00Z"},
                "timeout": 5
            }"#,
        )
        .expect("request must parse");
        assert_eq!(req.timeout(Duration::from_secs(60)), Duration::from_secs(5));
        assert!(matches!(req.validate(), Err(Error::InvalidRequest(_))));
    }
}
