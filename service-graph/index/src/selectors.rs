//! Builds the log-query selectors attached to graph nodes and edges.

use crate::{NameHelper, ParsedView, ServiceGroups};
use service_graph_core::{
    selector::{Selector, SelectorPair, SelectorSet},
    Direction, EndpointType, FlowEndpoint, NamespacedName, ServiceGroup, ServiceGroupLookup,
    ServicePort,
};
use std::collections::BTreeSet;
use tracing::trace;

/// Host groups with more members than this are selected by type alone.
const MAX_SELECTOR_ITEMS_PER_GROUP: usize = 50;

pub struct SelectorHelper<'a> {
    view: &'a ParsedView,
    names: &'a NameHelper,
    groups: &'a ServiceGroups,
}

fn eq(key: &str, value: impl Into<service_graph_core::selector::Value>) -> Option<Selector> {
    Some(Selector::eq(key, value))
}

fn and<const N: usize>(parts: [Option<Selector>; N]) -> Option<Selector> {
    Selector::and(parts)
}

fn no_match() -> Option<Selector> {
    Some(Selector::NoMatch)
}

/// The log type recorded for an endpoint, and whether its logs carry aggregated names.
fn raw_type(kind: EndpointType) -> (&'static str, bool) {
    match kind {
        EndpointType::ReplicaSet => ("wep", true),
        EndpointType::Workload => ("wep", false),
        EndpointType::Host => ("hep", false),
        EndpointType::Hosts => ("hep", true),
        EndpointType::Network => ("net", true),
        EndpointType::NetworkSet => ("ns", true),
    }
}

impl<'a> SelectorHelper<'a> {
    pub fn new(view: &'a ParsedView, names: &'a NameHelper, groups: &'a ServiceGroups) -> Self {
        Self {
            view,
            names,
            groups,
        }
    }

    pub fn layer(&self, layer: &str) -> SelectorPair {
        let layers = &self.view.layers;
        let mut selectors = SelectorPair::default();
        for ns in layers.layer_to_namespaces.get(layer).into_iter().flatten() {
            selectors = selectors.or(&self.namespace(ns));
        }
        for sg in layers.layer_to_service_groups.get(layer).into_iter().flatten() {
            selectors = selectors.or(&self.service_group(sg));
        }
        for ep in layers.layer_to_endpoints.get(layer).into_iter().flatten() {
            selectors = selectors.or(&self.endpoint(ep, None));
        }
        selectors
    }

    pub fn namespace(&self, namespace: &str) -> SelectorPair {
        let dest_ns = || {
            Selector::or([
                eq("dest_service_namespace", namespace),
                eq("dest_namespace", namespace),
            ])
        };
        SelectorPair {
            source: SelectorSet {
                l3_flows: eq("source_namespace", namespace),
                l7_flows: eq("src_namespace", namespace),
                dns_logs: eq("client_namespace", namespace),
                alerts: eq("source_namespace", namespace),
            },
            dest: SelectorSet {
                l3_flows: dest_ns(),
                l7_flows: dest_ns(),
                dns_logs: eq("servers.namespace", namespace),
                alerts: eq("dest_namespace", namespace),
            },
        }
    }

    /// Selectors for a service. DNS logs are selected through the service endpoints.
    pub fn service(&self, svc: &NamespacedName) -> SelectorPair {
        let mut selectors = service_selectors(svc);

        let endpoints = self
            .groups
            .by_service(svc)
            .map(|sg| {
                sg.service_ports
                    .values()
                    .flatten()
                    .filter(|ep| is_service_endpoint(ep))
                    .map(|ep| FlowEndpoint {
                        protocol: String::new(),
                        ..ep.clone()
                    })
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();
        selectors.dest = selectors.dest.or(&self.endpoints_dest(&endpoints));
        selectors
    }

    pub fn service_port(&self, sp: &ServicePort) -> SelectorPair {
        let svc = sp.service();
        let mut selectors = service_selectors(&svc);

        if sp.protocol == "tcp" {
            selectors.dest.l7_flows = Selector::and([
                selectors.dest.l7_flows.take(),
                eq("dest_service_port_name", &sp.port_name),
                eq("dest_service_port", sp.port),
            ]);
        } else {
            selectors.source.l7_flows = no_match();
            selectors.dest.l7_flows = no_match();
        }
        selectors.dest.l3_flows = Selector::and([
            selectors.dest.l3_flows.take(),
            eq("dest_service_port", &sp.port_name),
            eq("dest_service_port_num", sp.port),
            eq("proto", &sp.protocol),
        ]);

        let endpoints = self
            .groups
            .by_service(&svc)
            .and_then(|sg| sg.service_ports.get(sp).cloned())
            .unwrap_or_default()
            .into_iter()
            .filter(is_service_endpoint)
            .collect::<BTreeSet<_>>();
        selectors.dest = selectors.dest.or(&self.endpoints_dest(&endpoints));
        selectors
    }

    /// Members that record their own flows are selected as endpoints; the rest by service.
    pub fn service_group(&self, sg: &ServiceGroup) -> SelectorPair {
        let mut services = BTreeSet::new();
        let mut endpoints = BTreeSet::new();
        for (sp, eps) in &sg.service_ports {
            for ep in eps {
                match ep.kind {
                    EndpointType::Host | EndpointType::Workload | EndpointType::ReplicaSet => {
                        endpoints.insert(FlowEndpoint {
                            protocol: String::new(),
                            ..ep.clone()
                        });
                    }
                    _ => {
                        services.insert(sp.service());
                    }
                }
            }
        }

        let mut selectors = SelectorPair::default();
        for svc in &services {
            selectors = selectors.or(&self.service(svc));
        }
        for ep in &endpoints {
            selectors = selectors.or(&self.endpoint(ep, None));
        }
        selectors
    }

    /// Selectors for an endpoint or endpoint port. The port and protocol narrow the selection
    /// when set. With a direction, only the matching side is selected.
    pub fn endpoint(&self, ep: &FlowEndpoint, direction: Option<Direction>) -> SelectorPair {
        let (raw_type, aggregated) = raw_type(ep.kind);
        let namespace = if ep.namespace.is_empty() {
            "-"
        } else {
            ep.namespace.as_str()
        };
        let (name, name_aggr) = (ep.name.as_str(), ep.name_aggr.as_str());

        let (mut source, mut dest) = (SelectorSet::default(), SelectorSet::default());

        // DNS and L7 logs are only recorded for pods, and L7 logs only by aggregated name.
        if raw_type == "wep" {
            if aggregated {
                source.dns_logs = and([
                    eq("client_namespace", namespace),
                    eq("client_name_aggr", name_aggr),
                ]);
                dest.dns_logs = and([
                    eq("servers.namespace", namespace),
                    eq("servers.name_aggr", name_aggr),
                ]);
            } else {
                dest.dns_logs = and([eq("servers.namespace", namespace), eq("servers.name", name)]);
            }

            if aggregated && (ep.protocol.is_empty() || ep.protocol == "tcp") {
                source.l7_flows =
                    and([eq("src_namespace", namespace), eq("src_name_aggr", name_aggr)]);
                dest.l7_flows =
                    and([eq("dest_namespace", namespace), eq("dest_name_aggr", name_aggr)]);
            } else {
                source.l7_flows = no_match();
                dest.l7_flows = no_match();
            }
        } else {
            source.l7_flows = no_match();
            dest.l7_flows = no_match();
            source.dns_logs = no_match();
            dest.dns_logs = no_match();
        }

        match ep.kind {
            EndpointType::Hosts => {
                let hosts = self.names.hosts_in_group(name_aggr);
                let (source_hosts, dest_hosts) = match hosts {
                    [] => (None, None),
                    hosts if hosts.len() > MAX_SELECTOR_ITEMS_PER_GROUP => (None, None),
                    [host] => (eq("source_name_aggr", host), eq("dest_name_aggr", host)),
                    hosts => (
                        Some(Selector::any_of("source_name_aggr", hosts.to_vec())),
                        Some(Selector::any_of("dest_name_aggr", hosts.to_vec())),
                    ),
                };
                source.l3_flows = and([eq("source_type", raw_type), source_hosts]);
                dest.l3_flows = and([eq("dest_type", raw_type), dest_hosts]);
            }
            // Host logs carry the host name as the aggregated name.
            EndpointType::Host => {
                source.l3_flows = and([eq("source_type", raw_type), eq("source_name_aggr", name)]);
                dest.l3_flows = and([eq("dest_type", raw_type), eq("dest_name_aggr", name)]);
            }
            _ if aggregated => {
                source.l3_flows = and([
                    eq("source_type", raw_type),
                    eq("source_namespace", namespace),
                    eq("source_name_aggr", name_aggr),
                ]);
                dest.l3_flows = and([
                    eq("dest_type", raw_type),
                    eq("dest_namespace", namespace),
                    eq("dest_name_aggr", name_aggr),
                ]);
                source.alerts = and([
                    eq("source_namespace", namespace),
                    eq("source_name_aggr", name_aggr),
                ]);
                dest.alerts = and([eq("dest_namespace", namespace), eq("dest_name_aggr", name_aggr)]);
            }
            _ => {
                source.l3_flows = and([
                    eq("source_type", raw_type),
                    eq("source_namespace", namespace),
                    eq("source_name", name),
                ]);
                dest.l3_flows = and([
                    eq("dest_type", raw_type),
                    eq("dest_namespace", namespace),
                    eq("dest_name", name),
                ]);
                source.alerts = and([eq("source_namespace", namespace), eq("source_name", name)]);
                dest.alerts = and([eq("dest_namespace", namespace), eq("dest_name", name)]);
            }
        }

        if let Some(port) = ep.port {
            dest.l3_flows = and([eq("dest_port", port.get()), dest.l3_flows.take()]);
        }
        if !ep.protocol.is_empty() {
            source.l3_flows = and([eq("proto", &ep.protocol), source.l3_flows.take()]);
            dest.l3_flows = and([eq("proto", &ep.protocol), dest.l3_flows.take()]);
        }

        SelectorPair {
            source: if direction == Some(Direction::Ingress) {
                SelectorSet::default()
            } else {
                source
            },
            dest: if direction == Some(Direction::Egress) {
                SelectorSet::default()
            } else {
                dest
            },
        }
    }

    fn endpoints_dest(&self, endpoints: &BTreeSet<FlowEndpoint>) -> SelectorSet {
        endpoints.iter().fold(SelectorSet::default(), |acc, ep| {
            acc.or(&self.endpoint(ep, None).dest)
        })
    }
}

fn is_service_endpoint(ep: &FlowEndpoint) -> bool {
    match ep.kind {
        EndpointType::Host
        | EndpointType::Workload
        | EndpointType::ReplicaSet
        | EndpointType::NetworkSet => true,
        EndpointType::Hosts | EndpointType::Network => {
            trace!(%ep, "Endpoint type is not selected through its service");
            false
        }
    }
}

/// L7 logs always record the service, so both sides select on it.
fn service_selectors(svc: &NamespacedName) -> SelectorPair {
    let (ns, name) = (svc.namespace.as_str(), svc.name.as_str());
    let l7 = || and([eq("dest_service_namespace", ns), eq("dest_service_name", name)]);
    SelectorPair {
        source: SelectorSet {
            l7_flows: l7(),
            alerts: and([eq("source_namespace", ns), eq("source_name", name)]),
            ..Default::default()
        },
        dest: SelectorSet {
            l3_flows: and([eq("dest_service_namespace", ns), eq("dest_service_name", name)]),
            l7_flows: l7(),
            alerts: and([eq("dest_namespace", ns), eq("dest_name", name)]),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Labels, ServiceGroupsBuilder};
    use maplit::btreemap;
    use service_graph_core::request::NamedSelector;
    use std::{collections::BTreeMap, num::NonZeroU16};

    fn rendered(sel: &Option<Selector>) -> Option<String> {
        sel.as_ref().and_then(Selector::render)
    }

    fn cart_port() -> ServicePort {
        ServicePort {
            namespace: "shop".to_string(),
            name: "cart".to_string(),
            port_name: "http".to_string(),
            port: 80,
            protocol: "tcp".to_string(),
        }
    }

    fn cart_pods() -> FlowEndpoint {
        FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "cart-*")
            .with_port("tcp", NonZeroU16::new(8080))
    }

    fn groups() -> ServiceGroups {
        let mut builder = ServiceGroupsBuilder::default();
        builder.add_mapping(&cart_port(), &cart_pods());
        builder.finish_mappings()
    }

    fn names() -> NameHelper {
        let hosts: BTreeMap<String, Labels> = btreemap! {
            "node-1".to_string() => btreemap! { "role".to_string() => "infra".to_string() },
            "node-2".to_string() => btreemap! { "role".to_string() => "infra".to_string() },
            "node-3".to_string() => Labels::new(),
        };
        let selectors = vec![NamedSelector {
            name: "infra".to_string(),
            selector: "role == 'infra'".to_string(),
        }];
        NameHelper::new(&selectors, &hosts).expect("selectors must parse")
    }

    #[test]
    fn namespace() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);
        let sel = helper.namespace("shop");
        assert_eq!(
            rendered(&sel.dest.l3_flows).as_deref(),
            Some(r#"dest_namespace == "shop" || dest_service_namespace == "shop""#)
        );
        assert_eq!(
            rendered(&sel.source.dns_logs).as_deref(),
            Some(r#"client_namespace == "shop""#)
        );
        assert_eq!(
            rendered(&sel.dest.dns_logs).as_deref(),
            Some(r#""servers.namespace" == "shop""#)
        );
    }

    #[test]
    fn aggregated_workloads() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);
        let ep = FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "cart-*");
        let node = helper.endpoint(&ep, None).node_selectors();
        assert_eq!(
            rendered(&node.l3_flows).as_deref(),
            Some(concat!(
                r#"(dest_name_aggr == "cart-*" && dest_namespace == "shop" && dest_type == "wep")"#,
                r#" || "#,
                r#"(source_name_aggr == "cart-*" && source_namespace == "shop" && source_type == "wep")"#,
            ))
        );
        assert_eq!(
            rendered(&node.l7_flows).as_deref(),
            Some(concat!(
                r#"(dest_name_aggr == "cart-*" && dest_namespace == "shop")"#,
                r#" || "#,
                r#"(src_name_aggr == "cart-*" && src_namespace == "shop")"#,
            ))
        );
    }

    #[test]
    fn ports_narrow_and_udp_has_no_l7() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);
        let ep = FlowEndpoint::new(EndpointType::ReplicaSet, "shop", "dns-*")
            .with_port("udp", NonZeroU16::new(53));
        let sel = helper.endpoint(&ep, None);
        assert_eq!(
            rendered(&sel.dest.l3_flows).as_deref(),
            Some(concat!(
                r#"dest_name_aggr == "dns-*" && dest_namespace == "shop" && dest_port == 53"#,
                r#" && dest_type == "wep" && proto == "udp""#,
            ))
        );
        assert_eq!(sel.dest.l7_flows, Some(Selector::NoMatch));
        assert_eq!(rendered(&sel.node_selectors().l7_flows), None);
    }

    #[test]
    fn workloads_select_by_pod_name() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);
        let ep = FlowEndpoint::new(EndpointType::Workload, "shop", "cart-*").with_name("cart-x1");
        let sel = helper.endpoint(&ep, None);
        assert_eq!(
            rendered(&sel.source.l3_flows).as_deref(),
            Some(r#"source_name == "cart-x1" && source_namespace == "shop" && source_type == "wep""#)
        );
        assert_eq!(
            rendered(&sel.dest.dns_logs).as_deref(),
            Some(r#""servers.name" == "cart-x1" && "servers.namespace" == "shop""#)
        );
        assert_eq!(sel.source.dns_logs, None);
    }

    #[test]
    fn host_groups_list_their_hosts() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);

        let infra = helper.endpoint(&FlowEndpoint::new(EndpointType::Hosts, "", "infra"), None);
        assert_eq!(
            rendered(&infra.source.l3_flows).as_deref(),
            Some(concat!(
                r#"(source_name_aggr == "node-1" || source_name_aggr == "node-2")"#,
                r#" && source_type == "hep""#,
            ))
        );
        assert_eq!(infra.source.dns_logs, Some(Selector::NoMatch));
        assert_eq!(infra.source.alerts, None);

        let rest = helper.endpoint(&FlowEndpoint::new(EndpointType::Hosts, "", "*"), None);
        assert_eq!(
            rendered(&rest.dest.l3_flows).as_deref(),
            Some(r#"dest_type == "hep""#)
        );

        let host = FlowEndpoint::new(EndpointType::Host, "", "infra").with_name("node-1");
        assert_eq!(
            rendered(&helper.endpoint(&host, None).dest.l3_flows).as_deref(),
            Some(r#"dest_name_aggr == "node-1" && dest_type == "hep""#)
        );
    }

    #[test]
    fn direction_limits_the_side() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);
        let net = FlowEndpoint::new(EndpointType::Network, "", "pub");

        let ingress = helper.endpoint(&net, Some(Direction::Ingress));
        assert_eq!(ingress.source, SelectorSet::default());
        assert_eq!(
            rendered(&ingress.dest.l3_flows).as_deref(),
            Some(r#"dest_name_aggr == "pub" && dest_namespace == "-" && dest_type == "net""#)
        );

        let egress = helper.endpoint(&net, Some(Direction::Egress));
        assert_eq!(egress.dest, SelectorSet::default());
        assert!(egress.source.l3_flows.is_some());
    }

    #[test]
    fn service_ports_include_their_endpoints() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);
        let sel = helper.service_port(&cart_port());
        assert_eq!(
            rendered(&sel.dest.l3_flows).as_deref(),
            Some(concat!(
                r#"(dest_name_aggr == "cart-*" && dest_namespace == "shop" && dest_port == 8080"#,
                r#" && dest_type == "wep" && proto == "tcp")"#,
                r#" || "#,
                r#"(dest_service_name == "cart" && dest_service_namespace == "shop""#,
                r#" && dest_service_port == "http" && dest_service_port_num == 80 && proto == "tcp")"#,
            ))
        );
        assert_eq!(
            rendered(&sel.source.l7_flows).as_deref(),
            Some(r#"dest_service_name == "cart" && dest_service_namespace == "shop""#)
        );
    }

    #[test]
    fn service_groups_of_pods_select_pods() {
        let (view, names, groups) = (ParsedView::default(), names(), groups());
        let helper = SelectorHelper::new(&view, &names, &groups);
        let sg = groups.iter().next().expect("one group");
        let sel = helper.service_group(sg);
        assert_eq!(
            rendered(&sel.source.l3_flows).as_deref(),
            Some(r#"source_name_aggr == "cart-*" && source_namespace == "shop" && source_type == "wep""#)
        );
        assert_eq!(
            rendered(&sel.dest.l3_flows).as_deref(),
            Some(concat!(
                r#"dest_name_aggr == "cart-*" && dest_namespace == "shop" && dest_port == 8080"#,
                r#" && dest_type == "wep""#,
            ))
        );
    }
}
