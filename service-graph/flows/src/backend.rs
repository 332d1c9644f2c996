use crate::events::RawEvent;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use service_graph_core::{
    stats::GraphPacketStats, EndpointType, Error, FlowEndpoint, Result, ServicePort, TimeRange,
};
use std::{num::NonZeroU16, time::Duration};

/// A stream of aggregated records, in the order the log store returns them.
pub type Buckets<T> = BoxStream<'static, Result<T>>;

/// The log store.
///
/// Each query returns records pre-aggregated by a composite key. Records are ordered by key with
/// the destination fields varying slowest, service-qualified records for a destination precede
/// unqualified records and all sources of a destination are contiguous. A store that stops early
/// because a query grew too large yields [`Error::DataTruncated`] as its last item.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn flow_config(&self, cluster: &str) -> Result<FlowConfig>;

    async fn l3_flows(&self, cluster: &str, range: &TimeRange) -> Result<Buckets<L3Bucket>>;

    async fn l7_flows(&self, cluster: &str, range: &TimeRange) -> Result<Buckets<L7Bucket>>;

    async fn dns_logs(&self, cluster: &str, range: &TimeRange) -> Result<Buckets<DnsBucket>>;

    async fn events(&self, cluster: &str, range: &TimeRange) -> Result<Vec<RawEvent>>;
}

/// How often the cluster's collectors flush each kind of log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(with = "secs")]
    pub l3_flush_interval: Duration,
    #[serde(with = "secs")]
    pub l7_flush_interval: Duration,
    #[serde(with = "secs")]
    pub dns_flush_interval: Duration,
}

/// Whether a record was reported by the source or the destination of the traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reporter {
    Src,
    Dst,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

/// An endpoint as it appears in the log store. Missing values may be rendered as `-`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEndpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub namespace: String,
    pub name_aggr: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawService {
    pub namespace: String,
    pub name: String,
    pub port_name: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct L3Bucket {
    pub source: RawEndpoint,
    pub dest: RawEndpoint,
    pub protocol: String,
    pub reporter: Reporter,
    pub action: Action,

    #[serde(default)]
    pub service: Option<RawService>,

    #[serde(default)]
    pub process: Option<String>,

    #[serde(default)]
    pub log_stats: Option<LogStats>,

    #[serde(default)]
    pub traffic: Option<GraphPacketStats>,

    #[serde(default)]
    pub tcp: Option<TcpStats>,

    #[serde(default)]
    pub process_stats: Option<ProcessStats>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStats {
    pub log_count: i64,
    pub flow_log_count: i64,
    pub started: i64,
    pub completed: i64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpStats {
    pub total_retransmissions: i64,
    pub lost_packets: i64,
    pub unrecovered_to: i64,
    pub min_send_congestion_window: f64,
    pub min_mss: f64,
    pub max_smooth_rtt: f64,
    pub max_min_rtt: f64,
    pub mean_send_congestion_window: f64,
    pub mean_smooth_rtt: f64,
    pub mean_min_rtt: f64,
    pub mean_mss: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessStats {
    pub min_num_names_per_flow: i64,
    pub max_num_names_per_flow: i64,
    pub min_num_ids_per_flow: i64,
    pub max_num_ids_per_flow: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L7Bucket {
    pub source: RawEndpoint,
    pub dest: RawEndpoint,
    pub service: Option<RawService>,
    pub response_code: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub count: i64,
    pub mean_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsBucket {
    pub client: RawEndpoint,
    pub response_code: String,
    pub count: i64,
    pub mean_latency: f64,
    pub max_latency: f64,
}

/// Treats a lone `-` as no value.
pub(crate) fn blank(value: &str) -> &str {
    if value == "-" {
        ""
    } else {
        value
    }
}

// === impl RawEndpoint ===

impl RawEndpoint {
    /// The aggregated endpoint, without port.
    pub fn to_endpoint(&self) -> Result<FlowEndpoint> {
        let kind = match self.kind.as_str() {
            "wep" => EndpointType::ReplicaSet,
            "hep" => EndpointType::Host,
            "net" => EndpointType::Network,
            "ns" => EndpointType::NetworkSet,
            kind => {
                return Err(Error::Internal(format!(
                    "unexpected endpoint type in flow log: {kind:?}"
                )))
            }
        };
        Ok(FlowEndpoint::new(
            kind,
            blank(&self.namespace),
            blank(&self.name_aggr),
        ))
    }

    /// The aggregated endpoint with the port and protocol the traffic was addressed to.
    pub fn to_dest_endpoint(&self, protocol: &str) -> Result<FlowEndpoint> {
        Ok(self
            .to_endpoint()?
            .with_port(protocol, NonZeroU16::new(self.port)))
    }
}

// === impl RawService ===

impl RawService {
    /// The service port, if the record was addressed to a service.
    pub fn to_service_port(&self, protocol: &str) -> Option<ServicePort> {
        let name = blank(&self.name);
        if name.is_empty() {
            return None;
        }
        Some(ServicePort {
            namespace: blank(&self.namespace).to_string(),
            name: name.to_string(),
            port_name: blank(&self.port_name).to_string(),
            port: self.port,
            protocol: protocol.to_string(),
        })
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_raw_endpoint_types() {
        let ep = RawEndpoint {
            kind: "wep".to_string(),
            namespace: "shop".to_string(),
            name_aggr: "cart-5d8f9-*".to_string(),
            port: 8080,
        };
        assert_eq!(
            ep.to_dest_endpoint("tcp").expect("wep must map"),
            FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "cart-5d8f9-*")
                .with_port("tcp", NonZeroU16::new(8080)),
        );

        let ep = RawEndpoint {
            kind: "net".to_string(),
            namespace: "-".to_string(),
            name_aggr: "pub".to_string(),
            port: 0,
        };
        assert_eq!(
            ep.to_dest_endpoint("udp").expect("net must map"),
            FlowEndpoint::new(EndpointType::Network, "", "pub").with_port("udp", None),
        );

        let ep = RawEndpoint {
            kind: "pod".to_string(),
            ..Default::default()
        };
        assert!(matches!(ep.to_endpoint(), Err(Error::Internal(_))));
    }

    #[test]
    fn parses_flow_config_in_seconds() {
        let config = serde_json::from_str::<FlowConfig>(
            r#"{"l3_flush_interval": 300, "l7_flush_interval": 300, "dns_flush_interval": 60}"#,
        )
        .expect("config must parse");
        assert_eq!(config.l3_flush_interval, Duration::from_secs(300));
        assert_eq!(config.dns_flush_interval, Duration::from_secs(60));
    }
}
