#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Turns aggregated flow, HTTP and DNS log records into canonical flows.

mod backend;
pub mod dns;
pub mod events;
pub mod l3;
pub mod l7;

pub use self::{
    backend::{
        Action, Backend, Buckets, DnsBucket, FlowConfig, L3Bucket, L7Bucket, LogStats,
        ProcessStats, RawEndpoint, RawService, Reporter, TcpStats,
    },
    dns::DnsLog,
    events::{Event, EventEndpoint, RawEvent},
    l3::L3Flow,
    l7::L7Flow,
};
use service_graph_core::TimeRange;

/// The output of a reconciler.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled<T> {
    pub flows: Vec<T>,

    /// Set when the records ran out before the log store was exhausted.
    pub truncated: bool,
}

impl<T> Default for Reconciled<T> {
    fn default() -> Self {
        Self {
            flows: Vec::new(),
            truncated: false,
        }
    }
}

/// Everything gathered from the log store for one time window.
#[derive(Clone, Debug, PartialEq)]
pub struct RawData {
    pub time_range: TimeRange,
    pub l3: Vec<L3Flow>,
    pub l7: Vec<L7Flow>,
    pub dns: Vec<DnsLog>,
    pub events: Vec<Event>,

    /// Set when any of the queries was truncated.
    pub truncated: bool,
}
