//! Service graph data model.
//!
//! Types shared by the reconcilers, the graph constructor and the cache: flow endpoints and
//! edges, the hierarchical node identity grammar, graph statistics, log-query selectors and the
//! request/response wire types.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoint;
mod error;
pub mod graph;
mod group;
pub mod id;
pub mod ports;
pub mod request;
pub mod selector;
pub mod stats;

pub use self::{
    endpoint::{Direction, EndpointType, FlowEdge, FlowEndpoint, NamespacedName, ServicePort},
    error::{Error, Result},
    graph::TimeRange,
    group::{ServiceGroup, ServiceGroupLookup},
    id::{GraphNodeId, GraphNodeType},
};

/// The value used for an aggregated name or namespace when group members disagree.
pub const AGGREGATED: &str = "*";
