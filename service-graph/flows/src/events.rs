//! Security events and the graph endpoints they may relate to.
//!
//! Events come from several detectors that describe the affected endpoints in different ways.
//! The endpoints extracted here are only used to find existing nodes, never to create nodes, so
//! an event may name several candidates when its record is ambiguous.

use crate::backend::blank;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use service_graph_core::{EndpointType, FlowEndpoint, GraphNodeType, NamespacedName};
use std::num::NonZeroU16;
use tracing::trace;

/// Pod names generated by a replica set end in a five character suffix.
static POD_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new("-[a-z0-9]{5}$").expect("should compile"));

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEvent {
    pub id: String,

    /// Nanoseconds since the Unix epoch.
    pub time: i64,

    pub description: String,
    pub source_namespace: String,
    pub source_name: String,
    pub dest_namespace: String,
    pub dest_name: String,
    pub dest_port: u16,
    pub protocol: String,
    pub record: Option<RawEventRecord>,
}

/// The log record an event was raised for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEventRecord {
    #[serde(rename = "responseObject.kind")]
    pub response_object_kind: String,
    #[serde(rename = "objectRef.resource")]
    pub object_ref_resource: String,
    #[serde(rename = "objectRef.namespace")]
    pub object_ref_namespace: String,
    #[serde(rename = "objectRef.name")]
    pub object_ref_name: String,

    pub client_namespace: String,
    pub client_name: String,
    pub client_name_aggr: String,

    pub source_type: String,
    pub source_namespace: String,
    pub source_name: String,
    pub source_name_aggr: String,

    pub dest_type: String,
    pub dest_namespace: String,
    pub dest_name: String,
    pub dest_name_aggr: String,
    pub dest_port: u16,

    #[serde(rename = "proto")]
    pub protocol: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub description: String,
    pub time: Option<DateTime<Utc>>,
    pub endpoints: Vec<EventEndpoint>,
}

/// A node an event may relate to. Unlike a flow endpoint this may be a namespace or a service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEndpoint {
    #[serde(rename = "type")]
    pub node_type: GraphNodeType,
    pub namespace: String,
    pub name: String,
    pub name_aggr: String,
    pub port: Option<NonZeroU16>,
    pub protocol: String,
}

/// Extracts the events that can be related to at least one graph node.
pub fn parse_events(raw: impl IntoIterator<Item = RawEvent>) -> Vec<Event> {
    raw.into_iter().filter_map(parse_event).collect()
}

fn parse_event(raw: RawEvent) -> Option<Event> {
    let mut endpoints = Vec::new();
    endpoints.extend(from_flow_endpoint(
        "",
        &raw.source_namespace,
        &raw.source_name,
        "",
        0,
        "",
    ));
    endpoints.extend(from_flow_endpoint(
        "",
        &raw.dest_namespace,
        &raw.dest_name,
        "",
        raw.dest_port,
        &raw.protocol,
    ));
    if let Some(rec) = &raw.record {
        endpoints.extend(from_flow_endpoint(
            &rec.source_type,
            &rec.source_namespace,
            &rec.source_name,
            &rec.source_name_aggr,
            0,
            "",
        ));
        endpoints.extend(from_flow_endpoint(
            &rec.dest_type,
            &rec.dest_namespace,
            &rec.dest_name,
            &rec.dest_name_aggr,
            rec.dest_port,
            &rec.protocol,
        ));
        endpoints.extend(from_flow_endpoint(
            "wep",
            &rec.client_namespace,
            &rec.client_name,
            &rec.client_name_aggr,
            0,
            "",
        ));
        let resource = if rec.object_ref_resource.is_empty() {
            &rec.response_object_kind
        } else {
            &rec.object_ref_resource
        };
        endpoints.extend(from_object(
            resource,
            &rec.object_ref_namespace,
            &rec.object_ref_name,
        ));
    }

    if endpoints.is_empty() {
        trace!(id = %raw.id, "Event has no graph endpoints");
        return None;
    }
    Some(Event {
        id: raw.id,
        description: raw.description,
        time: (raw.time != 0).then(|| DateTime::from_timestamp_nanos(raw.time)),
        endpoints,
    })
}

/// The aggregated name of a pod, guessed from its generated name.
pub fn aggregated_name(name: &str) -> String {
    if POD_SUFFIX.is_match(name) {
        return POD_SUFFIX.replace(name, "-*").into_owned();
    }
    name.to_string()
}

fn from_flow_endpoint(
    kind: &str,
    namespace: &str,
    name: &str,
    name_aggr: &str,
    port: u16,
    protocol: &str,
) -> Vec<EventEndpoint> {
    let (kind, namespace, mut name, mut name_aggr) =
        (blank(kind), blank(namespace), blank(name), blank(name_aggr).to_string());
    if namespace.is_empty() && name.is_empty() && name_aggr.is_empty() {
        return Vec::new();
    }

    if name.ends_with("-*") {
        name_aggr = name.to_string();
        name = "";
    }
    if !name.is_empty() && name_aggr.is_empty() {
        name_aggr = aggregated_name(name);
    }
    if kind.is_empty() && name.is_empty() && name_aggr.is_empty() {
        return vec![EventEndpoint::namespace(namespace)];
    }

    // Without a type, the endpoint may be any type that fits.
    let typed = [kind];
    let kinds: &[&str] = match (kind, namespace.is_empty()) {
        ("", true) => &["hep", "ns"],
        ("", false) => &["wep", "ns"],
        _ => &typed,
    };

    kinds
        .iter()
        .filter_map(|kind| {
            let node_type = match *kind {
                "wep" if name.is_empty() => GraphNodeType::ReplicaSet,
                "wep" => GraphNodeType::Workload,
                "hep" => GraphNodeType::Host,
                "net" => GraphNodeType::Network,
                "ns" => GraphNodeType::NetworkSet,
                _ => return None,
            };
            let mut ep = EventEndpoint {
                node_type,
                namespace: namespace.to_string(),
                name: name.to_string(),
                name_aggr: name_aggr.clone(),
                port: NonZeroU16::new(port),
                protocol: protocol.to_string(),
            };
            // Hosts are aggregated under `*` until host aggregation assigns a group.
            if node_type == GraphNodeType::Host {
                if ep.name.is_empty() && ep.name_aggr != "*" {
                    ep.name = std::mem::take(&mut ep.name_aggr);
                }
                ep.name_aggr = "*".to_string();
            }
            Some(ep)
        })
        .collect()
}

fn from_object(resource: &str, namespace: &str, name: &str) -> Vec<EventEndpoint> {
    let ep = |node_type, namespace: &str, name: &str, name_aggr: String| EventEndpoint {
        node_type,
        namespace: namespace.to_string(),
        name: name.to_string(),
        name_aggr,
        port: None,
        protocol: String::new(),
    };
    let ep = match resource {
        "pods" | "Pod" => ep(GraphNodeType::Workload, namespace, name, aggregated_name(name)),
        "hostendpoints" | "HostEndpoint" | "nodes" | "Node" => {
            ep(GraphNodeType::Host, "", name, "*".to_string())
        }
        "networksets" | "NetworkSet" | "globalnetworksets" | "GlobalNetworkSet" => {
            ep(GraphNodeType::NetworkSet, namespace, "", name.to_string())
        }
        "replicasets" | "ReplicaSet" | "daemonsets" | "DaemonSet" => {
            ep(GraphNodeType::ReplicaSet, namespace, "", format!("{name}-*"))
        }
        "endpoints" | "Endpoints" | "services" | "Service" => {
            ep(GraphNodeType::Service, namespace, name, String::new())
        }
        "namespaces" | "Namespace" => EventEndpoint::namespace(name),
        _ if !namespace.is_empty() => EventEndpoint::namespace(namespace),
        _ => return Vec::new(),
    };
    vec![ep]
}

// === impl EventEndpoint ===

impl EventEndpoint {
    fn namespace(namespace: &str) -> Self {
        Self {
            node_type: GraphNodeType::Namespace,
            namespace: namespace.to_string(),
            name: String::new(),
            name_aggr: String::new(),
            port: None,
            protocol: String::new(),
        }
    }

    /// The flow endpoint, for endpoint types.
    pub fn flow_endpoint(&self) -> Option<FlowEndpoint> {
        let kind: EndpointType = self.node_type.endpoint_type()?;
        Some(
            FlowEndpoint::new(kind, &self.namespace, &self.name_aggr)
                .with_name(&self.name)
                .with_port(&self.protocol, self.port),
        )
    }

    pub fn service(&self) -> Option<NamespacedName> {
        (self.node_type == GraphNodeType::Service)
            .then(|| NamespacedName::new(&self.namespace, &self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_aggregated_pod_names() {
        assert_eq!(aggregated_name("cart-7d9c5b-x2k4q"), "cart-7d9c5b-*");
        assert_eq!(aggregated_name("etcd"), "etcd");
        assert_eq!(aggregated_name("Cart-ABCDE"), "Cart-ABCDE");
    }

    #[test]
    fn untyped_endpoints_name_all_candidates() {
        let event = parse_event(RawEvent {
            id: "e1".to_string(),
            time: 1_700_000_000_000_000_000,
            source_namespace: "shop".to_string(),
            source_name: "cart-7d9c5b-x2k4q".to_string(),
            dest_name: "node-1".to_string(),
            ..Default::default()
        })
        .expect("event must have endpoints");

        let types: Vec<_> = event.endpoints.iter().map(|ep| ep.node_type).collect();
        assert_eq!(
            types,
            vec![
                GraphNodeType::Workload,
                GraphNodeType::NetworkSet,
                GraphNodeType::Host,
                GraphNodeType::NetworkSet,
            ]
        );
        assert_eq!(event.endpoints[0].name_aggr, "cart-7d9c5b-*");
        assert_eq!(event.endpoints[2].name, "node-1");
        assert_eq!(event.endpoints[2].name_aggr, "*");
        assert!(event.time.is_some());
    }

    #[test]
    fn records_name_typed_endpoints_and_objects() {
        let event = parse_event(RawEvent {
            id: "e2".to_string(),
            record: Some(RawEventRecord {
                dest_type: "wep".to_string(),
                dest_namespace: "shop".to_string(),
                dest_name: "-".to_string(),
                dest_name_aggr: "cart-*".to_string(),
                dest_port: 8080,
                protocol: "tcp".to_string(),
                object_ref_resource: "services".to_string(),
                object_ref_namespace: "shop".to_string(),
                object_ref_name: "cart".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .expect("event must have endpoints");

        assert_eq!(event.endpoints.len(), 2);
        assert_eq!(
            event.endpoints[0].flow_endpoint(),
            Some(
                FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "cart-*")
                    .with_port("tcp", NonZeroU16::new(8080))
            )
        );
        assert_eq!(
            event.endpoints[1].service(),
            Some(NamespacedName::new("shop", "cart"))
        );
    }

    #[test]
    fn events_without_endpoints_are_dropped() {
        let events = parse_events(vec![
            RawEvent {
                id: "empty".to_string(),
                ..Default::default()
            },
            RawEvent {
                id: "ns".to_string(),
                source_namespace: "shop".to_string(),
                ..Default::default()
            },
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].endpoints[0].node_type, GraphNodeType::Namespace);
        assert_eq!(events[0].endpoints[0].namespace, "shop");
    }
}
