//! Service graph construction.
//!
//! Reconciled flows are filtered by the caller's permissions and turned into a graph for the
//! view the caller selected:
//!
//! - Each flow endpoint is placed in a hierarchy of layer, namespace, service group, aggregated
//!   endpoint, endpoint and port nodes. The hierarchy is only as deep as the view has expanded.
//! - Services that share endpoints are merged into service groups, so that an endpoint is never
//!   split across groups.
//! - Only the groups in focus, and the groups connected to them, are kept in view. Connections
//!   may be followed further, either explicitly or in the direction of traffic.
//!
//! ```text
//! [ RawData ] -> [ ServiceGraphData ] -> [ ServiceGraphResponse ]
//!                        ^                          ^
//!                 [ RbacFilter ]             [ ParsedView ]
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod data;
mod graph;
mod names;
pub mod rbac;
mod selectors;
mod service_groups;
pub mod view;

pub use self::{
    data::{ServiceGraphData, TimeSeriesDns, TimeSeriesFlow},
    graph::service_graph,
    names::{LabelSelector, Labels, NameHelper},
    rbac::{Permission, RbacFilter, Verb},
    selectors::SelectorHelper,
    service_groups::{ServiceGroups, ServiceGroupsBuilder},
    view::{NodeViewData, ParsedLayers, ParsedView},
};
