use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU16};

/// The kinds of endpoint that appear at either end of a flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EndpointType {
    /// A set of pods sharing an aggregated name.
    #[serde(rename = "rep")]
    ReplicaSet,

    /// A single pod.
    #[serde(rename = "wep")]
    Workload,

    /// A single host endpoint.
    #[serde(rename = "host")]
    Host,

    /// Host endpoints aggregated under a host-group name.
    #[serde(rename = "hosts")]
    Hosts,

    #[serde(rename = "net")]
    Network,

    #[serde(rename = "ns")]
    NetworkSet,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePort {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub port_name: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowEndpoint {
    #[serde(rename = "type")]
    pub kind: EndpointType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name_aggr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<NonZeroU16>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: FlowEndpoint,
    pub dest: FlowEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<ServicePort>,
}

/// Separates the source and sink roles of an otherwise identical node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

// === impl EndpointType ===

impl EndpointType {
    /// The type of the aggregated node that owns an endpoint of this type.
    pub fn aggregated(self) -> Self {
        match self {
            Self::Workload => Self::ReplicaSet,
            Self::Host => Self::Hosts,
            other => other,
        }
    }

    /// Workloads and replica sets are grouped by aggregated name regardless of port.
    pub fn is_workload(self) -> bool {
        matches!(self, Self::Workload | Self::ReplicaSet)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplicaSet => "rep",
            Self::Workload => "wep",
            Self::Host => "host",
            Self::Hosts => "hosts",
            Self::Network => "net",
            Self::NetworkSet => "ns",
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl NamespacedName ===

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl ServicePort ===

impl ServicePort {
    pub fn service(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }
}

impl fmt::Display for ServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}/{}/{}",
            self.namespace, self.name, self.port_name, self.protocol, self.port
        )
    }
}

// === impl FlowEndpoint ===

impl FlowEndpoint {
    pub fn new(kind: EndpointType, namespace: impl Into<String>, name_aggr: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: String::new(),
            name_aggr: name_aggr.into(),
            port: None,
            protocol: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_port(mut self, protocol: impl Into<String>, port: Option<NonZeroU16>) -> Self {
        self.protocol = protocol.into();
        self.port = port;
        self
    }

    /// The key used to group endpoints into service groups.
    ///
    /// Pods behind an aggregated name form one logical target regardless of port. Hosts and
    /// networks may expose unrelated services on different ports, so their key keeps the port.
    pub fn service_group_key(&self) -> Self {
        if self.kind.is_workload() {
            return Self::new(EndpointType::ReplicaSet, &self.namespace, &self.name_aggr);
        }
        self.clone()
    }

    /// The same endpoint without port or protocol.
    pub fn without_port(&self) -> Self {
        Self {
            port: None,
            protocol: String::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for FlowEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}/{}/{}",
            self.kind, self.namespace, self.name, self.name_aggr
        )?;
        if let Some(port) = self.port {
            write!(f, ":{}/{}", self.protocol, port)?;
        }
        f.write_str(")")
    }
}

// === impl FlowEdge ===

impl fmt::Display for FlowEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service_port {
            Some(svc) => write!(f, "{} -> {} -> {}", self.source, svc, self.dest),
            None => write!(f, "{} -> {}", self.source, self.dest),
        }
    }
}
