//! Filters flows by what the requesting user is permitted to see.

use ahash::AHashSet as HashSet;
use serde::{Deserialize, Serialize};
use service_graph_core::{EndpointType, FlowEdge, FlowEndpoint};

/// A single permission granted to the user, as returned by an authorization review.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,

    /// The namespace the permission applies to, or `None` for all namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub verb: Verb,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    List,
}

#[derive(Clone, Debug, Default)]
pub struct RbacFilter {
    list_all: HashSet<String>,
    list_namespaced: HashSet<(String, String)>,
    get: HashSet<String>,
}

pub const PODS: &str = "pods";
pub const NETWORK_SETS: &str = "networksets";
pub const GLOBAL_NETWORK_SETS: &str = "globalnetworksets";
pub const HOST_ENDPOINTS: &str = "hostendpoints";

/// Log resources gating the optional overlays.
pub const L7_LOGS: &str = "l7";
pub const DNS_LOGS: &str = "dns";
pub const EVENTS: &str = "events";

impl RbacFilter {
    pub fn new(permissions: impl IntoIterator<Item = Permission>) -> Self {
        let mut filter = Self::default();
        for Permission {
            resource,
            namespace,
            verb,
        } in permissions
        {
            match (verb, namespace) {
                (Verb::Get, _) => {
                    filter.get.insert(resource);
                }
                (Verb::List, None) => {
                    filter.list_all.insert(resource);
                }
                (Verb::List, Some(ns)) => {
                    filter.list_namespaced.insert((resource, ns));
                }
            }
        }
        filter
    }

    /// A flow is visible when either end is visible.
    pub fn include_flow(&self, edge: &FlowEdge) -> bool {
        self.include_endpoint(&edge.source) || self.include_endpoint(&edge.dest)
    }

    pub fn include_endpoint(&self, ep: &FlowEndpoint) -> bool {
        match ep.kind {
            EndpointType::Workload | EndpointType::ReplicaSet => self.can_list(PODS, &ep.namespace),
            EndpointType::Network => false,
            EndpointType::NetworkSet if ep.namespace.is_empty() => {
                self.list_all.contains(GLOBAL_NETWORK_SETS)
            }
            EndpointType::NetworkSet => self.can_list(NETWORK_SETS, &ep.namespace),
            EndpointType::Host | EndpointType::Hosts => self.list_all.contains(HOST_ENDPOINTS),
        }
    }

    pub fn include_l7_logs(&self) -> bool {
        self.get.contains(L7_LOGS)
    }

    pub fn include_dns_logs(&self) -> bool {
        self.get.contains(DNS_LOGS)
    }

    pub fn include_alerts(&self) -> bool {
        self.get.contains(EVENTS)
    }

    fn can_list(&self, resource: &str, namespace: &str) -> bool {
        self.list_all.contains(resource)
            || self
                .list_namespaced
                .contains(&(resource.to_string(), namespace.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(resource: &str, namespace: Option<&str>) -> Permission {
        Permission {
            resource: resource.to_string(),
            namespace: namespace.map(Into::into),
            verb: Verb::List,
        }
    }

    fn edge(source: FlowEndpoint, dest: FlowEndpoint) -> FlowEdge {
        FlowEdge {
            source,
            dest,
            service_port: None,
        }
    }

    #[test]
    fn pods_in_one_namespace() {
        let filter = RbacFilter::new(vec![list(PODS, Some("foo"))]);
        let foo = FlowEndpoint::new(EndpointType::ReplicaSet, "foo", "web-*");
        let bar = FlowEndpoint::new(EndpointType::ReplicaSet, "bar", "db-*");
        let net = FlowEndpoint::new(EndpointType::Network, "", "pub");

        assert!(filter.include_flow(&edge(foo.clone(), bar.clone())));
        assert!(filter.include_flow(&edge(bar.clone(), foo.clone())));
        assert!(!filter.include_flow(&edge(bar.clone(), bar)));
        assert!(filter.include_flow(&edge(net.clone(), foo)));
        assert!(!filter.include_endpoint(&net));
        assert!(!filter.include_l7_logs());
    }

    #[test]
    fn cluster_wide_permissions() {
        let filter = RbacFilter::new(vec![
            list(PODS, None),
            list(HOST_ENDPOINTS, None),
            list(NETWORK_SETS, Some("foo")),
            Permission {
                resource: DNS_LOGS.to_string(),
                namespace: None,
                verb: Verb::Get,
            },
        ]);

        assert!(filter.include_endpoint(&FlowEndpoint::new(EndpointType::Workload, "any", "x-*")));
        assert!(filter.include_endpoint(&FlowEndpoint::new(EndpointType::Hosts, "", "*")));
        assert!(filter.include_endpoint(&FlowEndpoint::new(EndpointType::NetworkSet, "foo", "ns1")));
        assert!(!filter.include_endpoint(&FlowEndpoint::new(EndpointType::NetworkSet, "bar", "ns1")));
        // Global network sets need their own permission.
        assert!(!filter.include_endpoint(&FlowEndpoint::new(EndpointType::NetworkSet, "", "gns")));
        assert!(filter.include_dns_logs());
        assert!(!filter.include_alerts());
    }

    #[test]
    fn host_to_pod_flows() {
        let host = FlowEndpoint::new(EndpointType::Host, "", "node-1");
        let bar = FlowEndpoint::new(EndpointType::ReplicaSet, "bar", "db-*");
        let foo = FlowEndpoint::new(EndpointType::ReplicaSet, "foo", "web-*");

        let pods_in_foo = RbacFilter::new(vec![list(PODS, Some("foo"))]);
        assert!(!pods_in_foo.include_flow(&edge(host.clone(), bar.clone())));
        assert!(!pods_in_foo.include_flow(&edge(bar.clone(), host.clone())));
        assert!(pods_in_foo.include_flow(&edge(host.clone(), foo)));

        // Either visible end is enough.
        let hosts = RbacFilter::new(vec![list(PODS, Some("foo")), list(HOST_ENDPOINTS, None)]);
        assert!(!hosts.include_endpoint(&bar));
        assert!(hosts.include_flow(&edge(host.clone(), bar.clone())));
        assert!(hosts.include_flow(&edge(bar, host)));
    }

    #[test]
    fn host_endpoints_need_cluster_wide_list() {
        let filter = RbacFilter::new(vec![list(HOST_ENDPOINTS, Some("foo"))]);
        assert!(!filter.include_endpoint(&FlowEndpoint::new(EndpointType::Host, "", "*")));
    }
}
