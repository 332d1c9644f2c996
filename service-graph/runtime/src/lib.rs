#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Runs the service graph API: configuration, logging, metrics and the HTTP servers, along with
//! the clients for the log store and authorization service.

pub use service_graph_cache as cache;
pub use service_graph_core as core;
pub use service_graph_flows as flows;
pub use service_graph_index as index;

mod api;
mod args;
mod authz;
mod client;
mod server;
mod store;

pub use self::{
    api::{Api, NewAuthorizer},
    args::Args,
    authz::{AuthzClient, UserAuthorizer},
    client::JsonClient,
    store::LogStore,
};
