//! Graph node identities.
//!
//! A node ID is a `;`-separated chain of `type/field/...` segments, starting with the node itself
//! and followed by the ancestors that qualify it, e.g. `port/tcp/8080;rep/shop/cart-*`. IDs are
//! part of the request contract: the UI echoes IDs from one response in the view of the next
//! request, so decoding validates every segment against a fixed shape table and a fixed
//! parent-type table.

use crate::{
    group::{ServiceGroup, ServiceGroupLookup},
    Direction, EndpointType, Error, FlowEndpoint, NamespacedName, Result, ServicePort,
};
use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU16, str::FromStr, sync::Arc};


/// An encoded node identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphNodeId(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GraphNodeType {
    #[serde(rename = "layer")]
    Layer,
    #[serde(rename = "namespace")]
    Namespace,
    #[serde(rename = "svcgp")]
    ServiceGroup,
    #[serde(rename = "svc")]
    Service,
    #[serde(rename = "svcport")]
    ServicePort,
    #[serde(rename = "rep")]
    ReplicaSet,
    #[serde(rename = "wep")]
    Workload,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "hosts")]
    Hosts,
    #[serde(rename = "net")]
    Network,
    #[serde(rename = "ns")]
    NetworkSet,
    #[serde(rename = "port")]
    Port,
}

/// One decoded segment of a node ID.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Layer(String),
    Namespace(String),
    ServiceGroup,
    Service(NamespacedName),
    ServicePort {
        protocol: String,
        name: String,
        port: u16,
    },
    ReplicaSet {
        namespace: String,
        name_aggr: String,
    },
    Workload {
        namespace: String,
        name: String,
        name_aggr: String,
    },
    Host {
        name: String,
        name_aggr: String,
    },
    Hosts {
        name_aggr: String,
    },
    Network {
        name_aggr: String,
    },
    NetworkSet {
        namespace: Option<String>,
        name_aggr: String,
    },
    Port {
        protocol: String,
        port: u16,
    },
    Direction(Direction),
}

/// A fully decoded node ID: the node segment followed by its qualifying ancestors.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParsedId {
    segments: Vec<Segment>,
}

/// Everything that can be parsed from, or used to build, a node ID.
#[derive(Clone, Debug, Default)]
pub struct IdInfo {
    pub parsed_type: Option<GraphNodeType>,
    pub endpoint_type: Option<EndpointType>,
    pub namespace: String,
    pub name: String,
    pub name_aggr: String,
    pub protocol: String,
    pub port: Option<NonZeroU16>,
    pub service: Option<ServicePort>,
    pub service_group: Option<Arc<ServiceGroup>>,
    pub layer: Option<String>,
    pub direction: Option<Direction>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Node(GraphNodeType),
    Direction,
}

/// Validation classes for segment fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Field {
    Value,
    MaybeEmpty,
    Port,
    Direction,
}

const DIRECTION_TAG: &str = "dir";

// === impl GraphNodeId ===

impl GraphNodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segment(segment: Segment) -> Self {
        Self(segment.to_string())
    }

    fn qualified(segment: Segment, parent: &GraphNodeId) -> Self {
        Self(format!("{};{}", segment, parent.0))
    }
}

impl fmt::Display for GraphNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for GraphNodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for GraphNodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<&ParsedId> for GraphNodeId {
    fn from(id: &ParsedId) -> Self {
        Self(id.to_string())
    }
}

// === impl GraphNodeType ===

impl GraphNodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Layer => "layer",
            Self::Namespace => "namespace",
            Self::ServiceGroup => "svcgp",
            Self::Service => "svc",
            Self::ServicePort => "svcport",
            Self::ReplicaSet => "rep",
            Self::Workload => "wep",
            Self::Host => "host",
            Self::Hosts => "hosts",
            Self::Network => "net",
            Self::NetworkSet => "ns",
            Self::Port => "port",
        }
    }

    /// The endpoint type for endpoint nodes.
    pub fn endpoint_type(self) -> Option<EndpointType> {
        match self {
            Self::ReplicaSet => Some(EndpointType::ReplicaSet),
            Self::Workload => Some(EndpointType::Workload),
            Self::Host => Some(EndpointType::Host),
            Self::Hosts => Some(EndpointType::Hosts),
            Self::Network => Some(EndpointType::Network),
            Self::NetworkSet => Some(EndpointType::NetworkSet),
            Self::Layer
            | Self::Namespace
            | Self::ServiceGroup
            | Self::Service
            | Self::ServicePort
            | Self::Port => None,
        }
    }

    pub fn is_endpoint(self) -> bool {
        self.endpoint_type().is_some()
    }
}

impl From<EndpointType> for GraphNodeType {
    fn from(t: EndpointType) -> Self {
        match t {
            EndpointType::ReplicaSet => Self::ReplicaSet,
            EndpointType::Workload => Self::Workload,
            EndpointType::Host => Self::Host,
            EndpointType::Hosts => Self::Hosts,
            EndpointType::Network => Self::Network,
            EndpointType::NetworkSet => Self::NetworkSet,
        }
    }
}

impl fmt::Display for GraphNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Kind ===

impl Kind {
    const ALL_NODES: [GraphNodeType; 12] = [
        GraphNodeType::Layer,
        GraphNodeType::Namespace,
        GraphNodeType::ServiceGroup,
        GraphNodeType::Service,
        GraphNodeType::ServicePort,
        GraphNodeType::ReplicaSet,
        GraphNodeType::Workload,
        GraphNodeType::Host,
        GraphNodeType::Hosts,
        GraphNodeType::Network,
        GraphNodeType::NetworkSet,
        GraphNodeType::Port,
    ];

    fn from_tag(tag: &str) -> Option<Self> {
        if tag == DIRECTION_TAG {
            return Some(Self::Direction);
        }
        Self::ALL_NODES
            .iter()
            .find(|t| t.as_str() == tag)
            .map(|t| Self::Node(*t))
    }

    /// The field shapes accepted for each segment type, excluding the type tag.
    fn shapes(self) -> &'static [&'static [Field]] {
        use Field::*;
        let t = match self {
            Self::Direction => return &[&[Direction]],
            Self::Node(t) => t,
        };
        match t {
            GraphNodeType::Layer | GraphNodeType::Namespace => &[&[Value]],
            GraphNodeType::ServiceGroup => &[&[]],
            GraphNodeType::Service => &[&[Value, Value]],
            GraphNodeType::ServicePort => &[&[Value, MaybeEmpty, Port]],
            GraphNodeType::ReplicaSet | GraphNodeType::Host => &[&[Value, Value]],
            GraphNodeType::Workload => &[&[Value, Value, Value]],
            GraphNodeType::Hosts | GraphNodeType::Network => &[&[Value]],
            GraphNodeType::NetworkSet => &[&[Value], &[Value, Value]],
            GraphNodeType::Port => &[&[Value, Port]],
        }
    }

    /// The segment types that may follow a segment of this type.
    fn allowed_parents(self) -> &'static [Kind] {
        use GraphNodeType as T;
        let t = match self {
            Self::Direction => return &[],
            Self::Node(t) => t,
        };
        match t {
            T::Port => &[
                Kind::Node(T::ReplicaSet),
                Kind::Node(T::Workload),
                Kind::Node(T::Host),
                Kind::Node(T::Hosts),
                Kind::Node(T::Network),
                Kind::Node(T::NetworkSet),
            ],
            T::Network | T::NetworkSet => &[Kind::Node(T::ServiceGroup), Kind::Direction],
            T::Host | T::Hosts => &[Kind::Node(T::ServiceGroup)],
            T::ServicePort | T::ServiceGroup | T::Service => &[Kind::Node(T::Service)],
            T::Layer | T::Namespace | T::ReplicaSet | T::Workload => &[],
        }
    }
}

// === impl Field ===

impl Field {
    fn validate(self, value: &str) -> Result<(), &'static str> {
        match self {
            Self::Value if value.is_empty() => Err("unexpected empty segment"),
            Self::Value | Self::MaybeEmpty => {
                if value.chars().all(is_id_char) {
                    Ok(())
                } else {
                    Err("badly formatted segment")
                }
            }
            Self::Port => value
                .parse::<u16>()
                .map(|_| ())
                .map_err(|_| "port is not a number"),
            Self::Direction => match value {
                "ingress" | "egress" => Ok(()),
                _ => Err("unknown direction"),
            },
        }
    }
}

/// Characters permitted in ID fields. `*` and `|` appear in aggregated names.
fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '*' | '|')
}

/// Whether the value may be used as a non-empty ID field, e.g. a layer name.
pub fn is_valid_field(value: &str) -> bool {
    Field::Value.validate(value).is_ok()
}

// === impl Segment ===

impl Segment {
    fn kind(&self) -> Kind {
        let t = match self {
            Self::Direction(_) => return Kind::Direction,
            Self::Layer(_) => GraphNodeType::Layer,
            Self::Namespace(_) => GraphNodeType::Namespace,
            Self::ServiceGroup => GraphNodeType::ServiceGroup,
            Self::Service(_) => GraphNodeType::Service,
            Self::ServicePort { .. } => GraphNodeType::ServicePort,
            Self::ReplicaSet { .. } => GraphNodeType::ReplicaSet,
            Self::Workload { .. } => GraphNodeType::Workload,
            Self::Host { .. } => GraphNodeType::Host,
            Self::Hosts { .. } => GraphNodeType::Hosts,
            Self::Network { .. } => GraphNodeType::Network,
            Self::NetworkSet { .. } => GraphNodeType::NetworkSet,
            Self::Port { .. } => GraphNodeType::Port,
        };
        Kind::Node(t)
    }

    /// Builds a segment from fields that have already been checked against a shape.
    fn build(kind: Kind, values: &[&str]) -> Option<Self> {
        use GraphNodeType as T;
        let s = |v: &&str| v.to_string();
        let t = match (kind, values) {
            (Kind::Direction, ["ingress"]) => return Some(Self::Direction(Direction::Ingress)),
            (Kind::Direction, ["egress"]) => return Some(Self::Direction(Direction::Egress)),
            (Kind::Direction, _) => return None,
            (Kind::Node(t), _) => t,
        };
        let segment = match (t, values) {
            (T::Layer, [name]) => Self::Layer(s(name)),
            (T::Namespace, [name]) => Self::Namespace(s(name)),
            (T::ServiceGroup, []) => Self::ServiceGroup,
            (T::Service, [ns, name]) => Self::Service(NamespacedName::new(*ns, *name)),
            (T::ServicePort, [protocol, name, port]) => Self::ServicePort {
                protocol: s(protocol),
                name: s(name),
                port: port.parse().ok()?,
            },
            (T::ReplicaSet, [ns, name_aggr]) => Self::ReplicaSet {
                namespace: s(ns),
                name_aggr: s(name_aggr),
            },
            (T::Workload, [ns, name, name_aggr]) => Self::Workload {
                namespace: s(ns),
                name: s(name),
                name_aggr: s(name_aggr),
            },
            (T::Host, [name, name_aggr]) => Self::Host {
                name: s(name),
                name_aggr: s(name_aggr),
            },
            (T::Hosts, [name_aggr]) => Self::Hosts {
                name_aggr: s(name_aggr),
            },
            (T::Network, [name_aggr]) => Self::Network {
                name_aggr: s(name_aggr),
            },
            (T::NetworkSet, [name_aggr]) => Self::NetworkSet {
                namespace: None,
                name_aggr: s(name_aggr),
            },
            (T::NetworkSet, [ns, name_aggr]) => Self::NetworkSet {
                namespace: Some(s(ns)),
                name_aggr: s(name_aggr),
            },
            (T::Port, [protocol, port]) => Self::Port {
                protocol: s(protocol),
                port: port.parse().ok()?,
            },
            _ => return None,
        };
        Some(segment)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind() {
            Kind::Direction => DIRECTION_TAG,
            Kind::Node(t) => t.as_str(),
        };
        f.write_str(tag)?;
        match self {
            Self::ServiceGroup => Ok(()),
            Self::Layer(name) | Self::Namespace(name) => write!(f, "/{name}"),
            Self::Service(svc) => write!(f, "/{}/{}", svc.namespace, svc.name),
            Self::ServicePort {
                protocol,
                name,
                port,
            } => write!(f, "/{protocol}/{name}/{port}"),
            Self::ReplicaSet {
                namespace,
                name_aggr,
            } => write!(f, "/{namespace}/{name_aggr}"),
            Self::Workload {
                namespace,
                name,
                name_aggr,
            } => write!(f, "/{namespace}/{name}/{name_aggr}"),
            Self::Host { name, name_aggr } => write!(f, "/{name}/{name_aggr}"),
            Self::Hosts { name_aggr } | Self::Network { name_aggr } => write!(f, "/{name_aggr}"),
            Self::NetworkSet {
                namespace: Some(namespace),
                name_aggr,
            } => write!(f, "/{namespace}/{name_aggr}"),
            Self::NetworkSet {
                namespace: None,
                name_aggr,
            } => write!(f, "/{name_aggr}"),
            Self::Port { protocol, port } => write!(f, "/{protocol}/{port}"),
            Self::Direction(Direction::Ingress) => f.write_str("/ingress"),
            Self::Direction(Direction::Egress) => f.write_str("/egress"),
        }
    }
}

// === impl ParsedId ===

impl ParsedId {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The type of the node this ID identifies.
    pub fn node_type(&self) -> Option<GraphNodeType> {
        match self.segments.first()?.kind() {
            Kind::Node(t) => Some(t),
            Kind::Direction => None,
        }
    }
}

impl FromStr for ParsedId {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut previous: Option<Kind> = None;
        for component in id.split(';') {
            let mut parts = component.split('/');
            let tag = parts.next().unwrap_or_default();
            let kind = Kind::from_tag(tag).ok_or_else(|| Error::node_id(id, "unknown node type"))?;

            match previous {
                None if kind == Kind::Direction => {
                    return Err(Error::node_id(id, "unexpected node type"));
                }
                Some(prev) if !prev.allowed_parents().contains(&kind) => {
                    return Err(Error::node_id(id, "unexpected parent type"));
                }
                _ => {}
            }

            let values = parts.collect::<Vec<_>>();
            let shape = kind
                .shapes()
                .iter()
                .find(|shape| shape.len() == values.len())
                .ok_or_else(|| Error::node_id(id, "unexpected number of fields"))?;
            for (field, value) in shape.iter().zip(&values) {
                field
                    .validate(value)
                    .map_err(|reason| Error::node_id(id, reason))?;
            }

            let segment = Segment::build(kind, &values)
                .ok_or_else(|| Error::node_id(id, "unexpected number of fields"))?;
            segments.push(segment);
            previous = Some(kind);
        }

        Ok(Self { segments })
    }
}

impl fmt::Display for ParsedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut segments = self.segments.iter();
        if let Some(first) = segments.next() {
            write!(f, "{first}")?;
        }
        for segment in segments {
            write!(f, ";{segment}")?;
        }
        Ok(())
    }
}

// === impl IdInfo ===

impl IdInfo {
    pub fn for_endpoint(
        endpoint: &FlowEndpoint,
        service: Option<&ServicePort>,
        service_group: Option<Arc<ServiceGroup>>,
        direction: Option<Direction>,
    ) -> Self {
        Self {
            parsed_type: None,
            endpoint_type: Some(endpoint.kind),
            namespace: endpoint.namespace.clone(),
            name: endpoint.name.clone(),
            name_aggr: endpoint.name_aggr.clone(),
            protocol: endpoint.protocol.clone(),
            port: endpoint.port,
            service: service.cloned(),
            service_group,
            layer: None,
            direction,
        }
    }

    /// Decodes an ID, resolving the service group it belongs to.
    ///
    /// A service group ID lists its services. Services that are unknown in the current data are
    /// ignored, but services that belong to different groups are rejected.
    pub fn parse(id: &GraphNodeId, groups: &dyn ServiceGroupLookup) -> Result<Self> {
        let parsed = id.as_str().parse::<ParsedId>()?;
        let mut info = Self {
            parsed_type: parsed.node_type(),
            ..Self::default()
        };

        let mut in_group = false;
        let mut service = ServicePort::default();
        for segment in parsed.segments {
            match segment {
                Segment::Layer(name) => info.layer = Some(name),
                Segment::Namespace(ns) => info.namespace = ns,
                Segment::ServiceGroup => in_group = true,
                Segment::Service(svc) if in_group => {
                    if let Some(sg) = groups.by_service(&svc) {
                        match &info.service_group {
                            Some(existing) if existing.id != sg.id => {
                                return Err(Error::node_id(
                                    id,
                                    "unrelated services specified as a group",
                                ));
                            }
                            _ => info.service_group = Some(sg),
                        }
                    }
                }
                Segment::Service(svc) => {
                    service.namespace = svc.namespace;
                    service.name = svc.name;
                    info.service = Some(service.clone());
                }
                Segment::ServicePort {
                    protocol,
                    name,
                    port,
                } => {
                    service.protocol = protocol;
                    service.port_name = name;
                    service.port = port;
                }
                Segment::ReplicaSet {
                    namespace,
                    name_aggr,
                } => {
                    info.endpoint_type = Some(EndpointType::ReplicaSet);
                    info.namespace = namespace;
                    info.name_aggr = name_aggr;
                }
                Segment::Workload {
                    namespace,
                    name,
                    name_aggr,
                } => {
                    info.endpoint_type = Some(EndpointType::Workload);
                    info.namespace = namespace;
                    info.name = name;
                    info.name_aggr = name_aggr;
                }
                Segment::Host { name, name_aggr } => {
                    info.endpoint_type = Some(EndpointType::Host);
                    info.name = name;
                    info.name_aggr = name_aggr;
                }
                Segment::Hosts { name_aggr } => {
                    info.endpoint_type = Some(EndpointType::Hosts);
                    info.name_aggr = name_aggr;
                }
                Segment::Network { name_aggr } => {
                    info.endpoint_type = Some(EndpointType::Network);
                    info.name_aggr = name_aggr;
                }
                Segment::NetworkSet {
                    namespace,
                    name_aggr,
                } => {
                    info.endpoint_type = Some(EndpointType::NetworkSet);
                    info.namespace = namespace.unwrap_or_default();
                    info.name_aggr = name_aggr;
                }
                Segment::Port { protocol, port } => {
                    info.protocol = protocol;
                    info.port = NonZeroU16::new(port);
                }
                Segment::Direction(direction) => info.direction = Some(direction),
            }
        }

        if info.service_group.is_none() {
            if let Some(endpoint) = info.endpoint() {
                info.service_group = groups.by_endpoint(&endpoint);
            }
        }

        Ok(info)
    }

    /// The endpoint described by this ID, if any.
    pub fn endpoint(&self) -> Option<FlowEndpoint> {
        let kind = self.endpoint_type?;
        Some(FlowEndpoint {
            kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            name_aggr: self.name_aggr.clone(),
            port: self.port,
            protocol: self.protocol.clone(),
        })
    }

    /// The namespace used to group the node: the service group namespace when grouped.
    pub fn effective_namespace(&self) -> &str {
        match &self.service_group {
            Some(sg) => &sg.namespace,
            None => &self.namespace,
        }
    }

    pub fn layer_id(&self) -> Option<GraphNodeId> {
        let layer = self.layer.as_ref()?;
        Some(GraphNodeId::segment(Segment::Layer(layer.clone())))
    }

    pub fn namespace_id(&self) -> Option<GraphNodeId> {
        let ns = self.effective_namespace();
        if ns.is_empty() {
            return None;
        }
        Some(GraphNodeId::segment(Segment::Namespace(ns.to_string())))
    }

    pub fn service_group_id(&self) -> Option<GraphNodeId> {
        self.service_group.as_ref().map(|sg| sg.id.clone())
    }

    pub fn service_id(&self) -> Option<GraphNodeId> {
        let svc = self.service.as_ref().filter(|svc| !svc.name.is_empty())?;
        Some(GraphNodeId::segment(Segment::Service(svc.service())))
    }

    pub fn service_port_id(&self) -> Option<GraphNodeId> {
        let parent = self.service_id()?;
        let svc = self.service.as_ref()?;
        let segment = Segment::ServicePort {
            protocol: svc.protocol.clone(),
            name: svc.port_name.clone(),
            port: svc.port,
        };
        Some(GraphNodeId::qualified(segment, &parent))
    }

    pub fn aggr_endpoint_type(&self) -> Option<EndpointType> {
        self.endpoint_type.map(EndpointType::aggregated)
    }

    /// The ID of the aggregated endpoint node.
    ///
    /// Networks and network sets are qualified by their service group, or otherwise by direction
    /// so that sources and sinks are kept apart. Hosts are qualified by their service group.
    pub fn aggr_endpoint_id(&self) -> Option<GraphNodeId> {
        let segment = match self.aggr_endpoint_type()? {
            EndpointType::ReplicaSet => {
                return Some(GraphNodeId::segment(Segment::ReplicaSet {
                    namespace: self.namespace.clone(),
                    name_aggr: self.name_aggr.clone(),
                }));
            }
            EndpointType::Hosts => {
                let segment = Segment::Hosts {
                    name_aggr: self.name_aggr.clone(),
                };
                return Some(self.qualify_by_group(segment));
            }
            EndpointType::Network => Segment::Network {
                name_aggr: self.name_aggr.clone(),
            },
            EndpointType::NetworkSet => Segment::NetworkSet {
                namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
                name_aggr: self.name_aggr.clone(),
            },
            EndpointType::Workload | EndpointType::Host => return None,
        };

        if self.service_group.is_some() {
            return Some(self.qualify_by_group(segment));
        }
        match self.direction {
            Some(direction) => Some(GraphNodeId(format!(
                "{};{}",
                segment,
                Segment::Direction(direction)
            ))),
            None => Some(GraphNodeId::segment(segment)),
        }
    }

    /// The ID of the non-aggregated endpoint node. Only workloads and hosts have one.
    pub fn endpoint_id(&self) -> Option<GraphNodeId> {
        match self.endpoint_type? {
            EndpointType::Workload => Some(GraphNodeId::segment(Segment::Workload {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                name_aggr: self.name_aggr.clone(),
            })),
            EndpointType::Host => Some(self.qualify_by_group(Segment::Host {
                name: self.name.clone(),
                name_aggr: self.name_aggr.clone(),
            })),
            EndpointType::ReplicaSet
            | EndpointType::Hosts
            | EndpointType::Network
            | EndpointType::NetworkSet => None,
        }
    }

    /// The ID of the port on the non-aggregated endpoint, falling back to the aggregated
    /// endpoint when there is no finer-grained endpoint.
    pub fn endpoint_port_id(&self) -> Option<GraphNodeId> {
        self.port?;
        match self.endpoint_id() {
            Some(parent) => Some(GraphNodeId::qualified(self.port_segment()?, &parent)),
            None => self.aggr_endpoint_port_id(),
        }
    }

    pub fn aggr_endpoint_port_id(&self) -> Option<GraphNodeId> {
        let segment = self.port_segment()?;
        let parent = self.aggr_endpoint_id()?;
        Some(GraphNodeId::qualified(segment, &parent))
    }

    fn port_segment(&self) -> Option<Segment> {
        let port = self.port?;
        Some(Segment::Port {
            protocol: self.protocol.clone(),
            port: port.get(),
        })
    }

    fn qualify_by_group(&self, segment: Segment) -> GraphNodeId {
        match &self.service_group {
            Some(sg) => GraphNodeId::qualified(segment, &sg.id),
            None => GraphNodeId::segment(segment),
        }
    }

    /// The ID of this node in its canonical form for the current data.
    fn normalized_id(&self) -> Option<GraphNodeId> {
        match self.parsed_type? {
            GraphNodeType::Layer => self.layer_id(),
            GraphNodeType::Namespace => self.namespace_id(),
            GraphNodeType::ServiceGroup => self.service_group_id(),
            GraphNodeType::Service => self.service_id(),
            GraphNodeType::ServicePort => self.service_port_id(),
            GraphNodeType::ReplicaSet
            | GraphNodeType::Hosts
            | GraphNodeType::Network
            | GraphNodeType::NetworkSet => self.aggr_endpoint_id(),
            GraphNodeType::Host | GraphNodeType::Workload => self.endpoint_id(),
            GraphNodeType::Port => self.endpoint_port_id(),
        }
    }
}

/// Normalizes an ID supplied by a client against the current service groups.
///
/// Service group IDs are rebuilt from the groups in the current data. When ingress and egress
/// are split, an undirected ID expands into both directed IDs; otherwise any direction is
/// dropped. IDs that do not correspond to anything in the current data normalize to nothing.
pub fn normalized_ids(
    id: &GraphNodeId,
    groups: &dyn ServiceGroupLookup,
    split_ingress_egress: bool,
) -> Result<Vec<GraphNodeId>> {
    let mut info = IdInfo::parse(id, groups)?;

    if !split_ingress_egress {
        info.direction = None;
        return Ok(info.normalized_id().into_iter().collect());
    }

    if info.direction.is_some() {
        return Ok(info.normalized_id().into_iter().collect());
    }

    info.direction = Some(Direction::Ingress);
    let ingress = info.normalized_id();
    info.direction = Some(Direction::Egress);
    let egress = info.normalized_id();

    let mut ids = Vec::with_capacity(2);
    ids.extend(ingress.clone());
    if egress != ingress {
        ids.extend(egress);
    }
    Ok(ids)
}
