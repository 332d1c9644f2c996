//! Service groups.
//!
//! Services that share endpoints are merged into a single group, so that the graph shows one
//! node for a set of pods that sit behind several services. Groups are discovered per request
//! from the service-qualified flows that survive RBAC filtering.

use ahash::AHashMap as HashMap;
use service_graph_core::{
    EndpointType, FlowEndpoint, NamespacedName, ServiceGroup, ServiceGroupLookup, ServicePort,
    AGGREGATED,
};
use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, trace};

/// Accumulates service to endpoint mappings.
#[derive(Debug, Default)]
pub struct ServiceGroupsBuilder {
    /// Groups are merged by moving one group into another, leaving an empty slot.
    groups: Vec<Option<PendingGroup>>,
    by_service: HashMap<NamespacedName, usize>,
    by_endpoint: HashMap<FlowEndpoint, usize>,
}

/// The service groups for one request.
#[derive(Debug, Default)]
pub struct ServiceGroups {
    groups: Vec<Arc<ServiceGroup>>,
    by_service: HashMap<NamespacedName, Arc<ServiceGroup>>,
    by_endpoint: HashMap<FlowEndpoint, Arc<ServiceGroup>>,
}

#[derive(Debug, Default)]
struct PendingGroup {
    services: BTreeSet<NamespacedName>,
    endpoints: BTreeSet<FlowEndpoint>,
    service_ports: BTreeMap<ServicePort, BTreeSet<FlowEndpoint>>,
}

// === impl ServiceGroupsBuilder ===

impl ServiceGroupsBuilder {
    /// Records that traffic to `service` was delivered to `endpoint`.
    pub fn add_mapping(&mut self, service: &ServicePort, endpoint: &FlowEndpoint) {
        let svc = service.service();
        let key = endpoint.service_group_key();

        let idx = match (
            self.by_service.get(&svc).copied(),
            self.by_endpoint.get(&key).copied(),
        ) {
            (Some(a), Some(b)) if a != b => self.merge(a, b),
            (Some(idx), _) | (None, Some(idx)) => idx,
            (None, None) => {
                self.groups.push(Some(PendingGroup::default()));
                self.groups.len() - 1
            }
        };
        trace!(%svc, endpoint = %key, group = idx, "Adding mapping");

        self.by_service.insert(svc.clone(), idx);
        self.by_endpoint.insert(key.clone(), idx);
        if let Some(group) = self.groups[idx].as_mut() {
            group.services.insert(svc);
            group.endpoints.insert(key);
            group
                .service_ports
                .entry(service.clone())
                .or_default()
                .insert(endpoint.clone());
        }
    }

    /// Merges the smaller group into the larger one, returning the index of the merged group.
    fn merge(&mut self, a: usize, b: usize) -> usize {
        let size = |g: &Option<PendingGroup>| g.as_ref().map_or(0, |g| g.endpoints.len());
        let (into, from) = if size(&self.groups[a]) >= size(&self.groups[b]) {
            (a, b)
        } else {
            (b, a)
        };

        let Some(moved) = self.groups[from].take() else {
            return into;
        };
        for svc in &moved.services {
            self.by_service.insert(svc.clone(), into);
        }
        for ep in &moved.endpoints {
            self.by_endpoint.insert(ep.clone(), into);
        }
        if let Some(group) = self.groups[into].as_mut() {
            group.services.extend(moved.services);
            group.endpoints.extend(moved.endpoints);
            for (sp, eps) in moved.service_ports {
                group.service_ports.entry(sp).or_default().extend(eps);
            }
        }
        into
    }

    /// Completes the groups once all mappings have been added.
    pub fn finish_mappings(self) -> ServiceGroups {
        let mut groups = ServiceGroups::default();
        let mut slots = HashMap::<usize, Arc<ServiceGroup>>::new();

        for (idx, pending) in self.groups.into_iter().enumerate() {
            let Some(pending) = pending else { continue };
            let services = pending.services.into_iter().collect::<Vec<_>>();
            let group = Arc::new(ServiceGroup {
                id: ServiceGroup::id_for(&services),
                namespace: common(services.iter().map(|s| s.namespace.as_str())),
                name: common(services.iter().map(|s| s.name.as_str())),
                services,
                service_ports: pending.service_ports,
            });
            debug!(id = %group.id, "Service group");
            slots.insert(idx, group.clone());
            groups.groups.push(group);
        }

        for (svc, idx) in self.by_service {
            if let Some(group) = slots.get(&idx) {
                groups.by_service.insert(svc, group.clone());
            }
        }
        for (ep, idx) in self.by_endpoint {
            if let Some(group) = slots.get(&idx) {
                groups.by_endpoint.insert(ep, group.clone());
            }
        }

        groups.groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups.index_port_less_endpoints();
        groups
    }
}

/// The common value, or `*` when values differ.
fn common<'a>(mut values: impl Iterator<Item = &'a str>) -> String {
    let Some(first) = values.next() else {
        return String::new();
    };
    if values.all(|v| v == first) {
        first.to_string()
    } else {
        AGGREGATED.to_string()
    }
}

// === impl ServiceGroups ===

impl ServiceGroups {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceGroup>> + '_ {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Hosts and networks are keyed with their port, but are often seen without one, e.g. as the
    /// source of a flow. When every port of such an endpoint maps to the same service port
    /// within a single group, the endpoint is also indexed without its port.
    fn index_port_less_endpoints(&mut self) {
        let mut candidates = HashMap::<FlowEndpoint, Option<(Arc<ServiceGroup>, ServicePort)>>::new();
        for group in &self.groups {
            for (sp, eps) in &group.service_ports {
                for ep in eps.iter().filter(|ep| !ep.kind.is_workload()) {
                    match candidates.entry(ep.without_port()) {
                        Entry::Vacant(entry) => {
                            entry.insert(Some((group.clone(), sp.clone())));
                        }
                        Entry::Occupied(mut entry) => {
                            let same = matches!(
                                entry.get(),
                                Some((g, existing)) if g.id == group.id && existing == sp
                            );
                            if !same {
                                entry.insert(None);
                            }
                        }
                    }
                }
            }
        }

        for (key, candidate) in candidates {
            if let Some((group, _)) = candidate {
                trace!(endpoint = %key, group = %group.id, "Indexing endpoint without port");
                self.by_endpoint.entry(key).or_insert(group);
            }
        }
    }
}

impl ServiceGroupLookup for ServiceGroups {
    fn by_service(&self, service: &NamespacedName) -> Option<Arc<ServiceGroup>> {
        self.by_service.get(service).cloned()
    }

    fn by_endpoint(&self, endpoint: &FlowEndpoint) -> Option<Arc<ServiceGroup>> {
        let key = endpoint.service_group_key();
        if let Some(group) = self.by_endpoint.get(&key) {
            return Some(group.clone());
        }
        // Aggregated hosts are never indexed directly; try the port-less form for the rest.
        if endpoint.kind == EndpointType::Hosts || key.port.is_none() {
            return None;
        }
        self.by_endpoint.get(&key.without_port()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU16;

    fn sp(ns: &str, name: &str, port: u16) -> ServicePort {
        ServicePort {
            namespace: ns.to_string(),
            name: name.to_string(),
            port_name: "http".to_string(),
            port,
            protocol: "tcp".to_string(),
        }
    }

    fn rep(ns: &str, name_aggr: &str, port: u16) -> FlowEndpoint {
        FlowEndpoint::new(EndpointType::ReplicaSet, ns, name_aggr)
            .with_port("tcp", NonZeroU16::new(port))
    }

    fn host(name: &str, port: u16) -> FlowEndpoint {
        FlowEndpoint::new(EndpointType::Host, "", "*")
            .with_name(name)
            .with_port("tcp", NonZeroU16::new(port))
    }

    fn build(mappings: &[(ServicePort, FlowEndpoint)]) -> ServiceGroups {
        let mut builder = ServiceGroupsBuilder::default();
        for (svc, ep) in mappings {
            builder.add_mapping(svc, ep);
        }
        builder.finish_mappings()
    }

    fn ids(groups: &ServiceGroups) -> Vec<String> {
        groups.iter().map(|g| g.id.to_string()).collect()
    }

    #[test]
    fn services_sharing_endpoints_are_merged() {
        let groups = build(&[
            (sp("shop", "cart", 80), rep("shop", "cart-*", 8080)),
            (sp("shop", "cart-admin", 81), rep("shop", "cart-*", 9090)),
            (sp("pay", "pay", 80), rep("pay", "pay-*", 8080)),
        ]);

        assert_eq!(
            ids(&groups),
            vec![
                "svcgp;svc/pay/pay".to_string(),
                "svcgp;svc/shop/cart;svc/shop/cart-admin".to_string(),
            ]
        );

        let cart = groups
            .by_service(&NamespacedName::new("shop", "cart-admin"))
            .expect("service must be grouped");
        assert_eq!(cart.namespace, "shop");
        assert_eq!(cart.name, "*");
        assert_eq!(cart.service_ports.len(), 2);

        // Workloads are found regardless of port.
        let by_ep = groups
            .by_endpoint(&rep("shop", "cart-*", 1234))
            .expect("endpoint must be grouped");
        assert_eq!(by_ep.id, cart.id);
        assert!(groups
            .by_endpoint(&FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "web-*"))
            .is_none());
    }

    #[test]
    fn bridging_endpoint_merges_existing_groups() {
        // A -> e1, B -> e2, then A -> e2 joins both groups.
        let groups = build(&[
            (sp("ns1", "a", 80), rep("ns1", "e1", 80)),
            (sp("ns2", "b", 80), rep("ns2", "e2", 80)),
            (sp("ns1", "a", 80), rep("ns2", "e2", 80)),
        ]);
        assert_eq!(ids(&groups), vec!["svcgp;svc/ns1/a;svc/ns2/b".to_string()]);
        let group = groups.iter().next().expect("one group");
        assert_eq!(group.namespace, "*");
        assert_eq!(group.name, "*");
        assert!(group.contains(&NamespacedName::new("ns2", "b")));
    }

    #[test]
    fn grouping_does_not_depend_on_insertion_order() {
        let mappings = vec![
            (sp("ns1", "a", 80), rep("ns1", "e1", 80)),
            (sp("ns1", "b", 80), rep("ns1", "e2", 80)),
            (sp("ns1", "c", 80), rep("ns1", "e3", 80)),
            (sp("ns1", "a", 80), rep("ns1", "e2", 80)),
            (sp("ns1", "d", 80), rep("ns1", "e4", 80)),
        ];
        let expected = ids(&build(&mappings));
        assert_eq!(
            expected,
            vec![
                "svcgp;svc/ns1/a;svc/ns1/b".to_string(),
                "svcgp;svc/ns1/c".to_string(),
                "svcgp;svc/ns1/d".to_string(),
            ]
        );

        // Every rotation and the reversal of the mappings produce the same groups.
        for i in 0..mappings.len() {
            let mut rotated = mappings.clone();
            rotated.rotate_left(i);
            assert_eq!(ids(&build(&rotated)), expected, "rotation {i}");
            rotated.reverse();
            assert_eq!(ids(&build(&rotated)), expected, "reversed rotation {i}");
        }
    }

    #[test]
    fn hosts_are_keyed_by_port() {
        let groups = build(&[
            (sp("default", "kubernetes", 443), host("node-1", 6443)),
            (sp("default", "metrics", 80), host("node-1", 9100)),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups
                .by_endpoint(&host("node-1", 6443))
                .map(|g| g.id.to_string()),
            Some("svcgp;svc/default/kubernetes".to_string())
        );

        // Without a port the host is ambiguous.
        assert!(groups.by_endpoint(&host("node-1", 0)).is_none());
    }

    #[test]
    fn unambiguous_hosts_are_found_without_port() {
        let groups = build(&[
            (sp("default", "kubernetes", 443), host("node-1", 6443)),
            (sp("default", "kubernetes", 443), host("node-2", 6443)),
        ]);
        assert_eq!(groups.len(), 1);

        let port_less = FlowEndpoint::new(EndpointType::Host, "", "*").with_name("node-1");
        let group = groups
            .by_endpoint(&port_less)
            .expect("port-less host must resolve");
        assert_eq!(group.id.to_string(), "svcgp;svc/default/kubernetes");
        assert!(groups.by_endpoint(&host("node-1", 22)).is_some());
    }
}
