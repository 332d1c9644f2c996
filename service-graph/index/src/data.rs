use crate::{NameHelper, RbacFilter, ServiceGroups, ServiceGroupsBuilder};
use service_graph_core::{
    ports::AggregatedProtoPorts, stats::GraphStats, FlowEdge, FlowEndpoint, TimeRange,
};
use service_graph_flows::{Event, RawData};
use tracing::debug;

/// A flow with one statistics entry per time interval.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeriesFlow {
    pub edge: FlowEdge,
    pub aggregated_proto_ports: Option<AggregatedProtoPorts>,
    pub stats: Vec<GraphStats>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeriesDns {
    pub endpoint: FlowEndpoint,
    pub stats: Vec<GraphStats>,
}

/// The data visible to one user, ready for graph construction.
#[derive(Debug)]
pub struct ServiceGraphData {
    pub time_intervals: Vec<TimeRange>,
    pub flows: Vec<TimeSeriesFlow>,
    pub dns: Vec<TimeSeriesDns>,
    pub events: Vec<Event>,
    pub service_groups: ServiceGroups,
    pub names: NameHelper,
    pub truncated: bool,
}

impl ServiceGraphData {
    /// Filters the cached data by the user's permissions, applies host naming and discovers
    /// service groups from what remains.
    pub fn filtered(raw: &RawData, rbac: &RbacFilter, names: NameHelper) -> Self {
        let mut groups = ServiceGroupsBuilder::default();
        let mut flows = Vec::with_capacity(raw.l3.len());

        for flow in raw.l3.iter().filter(|f| rbac.include_flow(&f.edge)) {
            let mut edge = flow.edge.clone();
            names.convert_edge(&mut edge);
            if let Some(sp) = &edge.service_port {
                groups.add_mapping(sp, &edge.dest);
            }
            flows.push(TimeSeriesFlow {
                edge,
                aggregated_proto_ports: flow.aggregated_proto_ports.clone(),
                stats: vec![GraphStats {
                    l3: Some(flow.stats.clone()),
                    processes: flow.processes.clone(),
                    ..Default::default()
                }],
            });
        }

        if rbac.include_l7_logs() {
            for flow in raw.l7.iter().filter(|f| rbac.include_flow(&f.edge)) {
                let mut edge = flow.edge.clone();
                names.convert_edge(&mut edge);
                if let Some(sp) = &edge.service_port {
                    groups.add_mapping(sp, &edge.dest);
                }
                flows.push(TimeSeriesFlow {
                    edge,
                    aggregated_proto_ports: None,
                    stats: vec![GraphStats {
                        l7: Some(flow.stats.clone()),
                        ..Default::default()
                    }],
                });
            }
        }

        let dns = if rbac.include_dns_logs() {
            raw.dns
                .iter()
                .filter(|log| rbac.include_endpoint(&log.endpoint))
                .map(|log| TimeSeriesDns {
                    endpoint: log.endpoint.clone(),
                    stats: vec![GraphStats {
                        dns: Some(log.stats.clone()),
                        ..Default::default()
                    }],
                })
                .collect()
        } else {
            Vec::new()
        };

        let events = if rbac.include_alerts() {
            raw.events
                .iter()
                .map(|event| {
                    let mut event = event.clone();
                    names.convert_event(&mut event);
                    event
                })
                .collect()
        } else {
            Vec::new()
        };

        let service_groups = groups.finish_mappings();
        debug!(
            flows = flows.len(),
            dns = dns.len(),
            events = events.len(),
            groups = service_groups.len(),
            "Filtered service graph data"
        );
        Self {
            time_intervals: vec![raw.time_range.clone()],
            flows,
            dns,
            events,
            service_groups,
            names,
            truncated: raw.truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Permission, Verb};
    use chrono::{TimeZone, Utc};
    use service_graph_core::{
        stats::{GraphDnsStats, GraphL3Stats, GraphL7Stats},
        EndpointType, ServiceGroupLookup, ServicePort,
    };
    use service_graph_flows::{DnsLog, L3Flow, L7Flow};
    use std::num::NonZeroU16;

    fn range() -> TimeRange {
        TimeRange {
            from: Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2026, 1, 1, 10, 15, 0).unwrap(),
            now: None,
        }
    }

    fn rep(ns: &str, name: &str) -> FlowEndpoint {
        FlowEndpoint::new(EndpointType::ReplicaSet, ns, name)
    }

    fn raw() -> RawData {
        let cart = ServicePort {
            namespace: "shop".to_string(),
            name: "cart".to_string(),
            port_name: "http".to_string(),
            port: 80,
            protocol: "tcp".to_string(),
        };
        let cart_pods = rep("shop", "cart-*").with_port("tcp", NonZeroU16::new(8080));
        RawData {
            time_range: range(),
            l3: vec![
                L3Flow {
                    edge: FlowEdge {
                        source: rep("web", "web-*"),
                        dest: cart_pods.clone(),
                        service_port: Some(cart.clone()),
                    },
                    aggregated_proto_ports: None,
                    stats: GraphL3Stats::default(),
                    processes: None,
                },
                L3Flow {
                    edge: FlowEdge {
                        source: rep("db", "db-*"),
                        dest: rep("db", "replica-*"),
                        service_port: None,
                    },
                    aggregated_proto_ports: None,
                    stats: GraphL3Stats::default(),
                    processes: None,
                },
                L3Flow {
                    edge: FlowEdge {
                        source: FlowEndpoint::new(EndpointType::Host, "", "node-1"),
                        dest: rep("web", "web-*"),
                        service_port: None,
                    },
                    aggregated_proto_ports: None,
                    stats: GraphL3Stats::default(),
                    processes: None,
                },
            ],
            l7: vec![L7Flow {
                edge: FlowEdge {
                    source: rep("web", "web-*"),
                    dest: cart_pods,
                    service_port: Some(cart),
                },
                stats: GraphL7Stats::default(),
            }],
            dns: vec![
                DnsLog {
                    endpoint: rep("web", "web-*"),
                    stats: GraphDnsStats::default(),
                },
                DnsLog {
                    endpoint: rep("db", "db-*"),
                    stats: GraphDnsStats::default(),
                },
            ],
            events: Vec::new(),
            truncated: true,
        }
    }

    fn list_pods(ns: &str) -> Permission {
        Permission {
            resource: "pods".to_string(),
            namespace: Some(ns.to_string()),
            verb: Verb::List,
        }
    }

    #[test]
    fn filters_by_permissions() {
        let rbac = RbacFilter::new(vec![list_pods("web")]);
        let data = ServiceGraphData::filtered(&raw(), &rbac, NameHelper::default());

        assert_eq!(data.time_intervals, vec![range()]);
        assert!(data.truncated);

        // The db flow is not visible, and neither are L7 or DNS logs.
        assert_eq!(data.flows.len(), 2);
        assert!(data.flows.iter().all(|f| f.stats[0].l3.is_some()));
        assert!(data.dns.is_empty());

        // Hosts are moved under the default host group.
        let host = &data.flows[1].edge.source;
        assert_eq!(host.name, "node-1");
        assert_eq!(host.name_aggr, "*");

        let sg = data
            .service_groups
            .by_endpoint(&rep("shop", "cart-*"))
            .expect("cart pods are grouped");
        assert_eq!(sg.id.as_str(), "svcgp;svc/shop/cart");
    }

    #[test]
    fn includes_logs_when_permitted() {
        let get = |resource: &str| Permission {
            resource: resource.to_string(),
            namespace: None,
            verb: Verb::Get,
        };
        let rbac = RbacFilter::new(vec![list_pods("web"), get("l7"), get("dns")]);
        let data = ServiceGraphData::filtered(&raw(), &rbac, NameHelper::default());

        assert_eq!(data.flows.len(), 3);
        assert!(data.flows[2].stats[0].l7.is_some());
        assert_eq!(data.dns.len(), 1);
        assert_eq!(data.dns[0].endpoint, rep("web", "web-*"));
        assert_eq!(data.service_groups.len(), 1);
    }
}
