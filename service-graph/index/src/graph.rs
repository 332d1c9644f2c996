//! Builds the service graph for a view from the filtered time-series data.
//!
//! Each flow endpoint is converted into a hierarchy of nodes (layer, namespace, service group,
//! aggregated endpoint, endpoint, port), stopping at the first node that is not expanded. The
//! top-most node of each endpoint's hierarchy that was tracked as a group is used to decide
//! which parts of the graph are in view: only connectivity between groups is considered.

use crate::{view::NodeViewData, ParsedView, SelectorHelper, ServiceGraphData, TimeSeriesFlow};
use ahash::AHashMap as HashMap;
use service_graph_core::{
    graph::{GraphEdge, GraphEdgeId, GraphNode, ServiceGraphResponse},
    id::IdInfo,
    ports::{AggregatedPorts, AggregatedProtoPorts, PortRange},
    selector::{GraphSelectors, Selector, SelectorPair, SelectorSet},
    stats::GraphStats,
    Direction, Error, FlowEndpoint, GraphNodeId, GraphNodeType, Result, ServiceGroupLookup,
    ServicePort,
};
use std::collections::{hash_map::Entry, BTreeSet};
use tracing::{debug, error, trace};


/// Computes the service graph response for the data and view.
pub fn service_graph(data: &ServiceGraphData, view: &ParsedView) -> ServiceGraphResponse {
    let mut graph = GraphConstructor::new(data, view);
    graph.populate();
    graph.prune();
    graph.overlay_events();
    graph.overlay_dns();
    graph.overlay_selectors();
    graph.into_response()
}

struct TrackedNode {
    node: GraphNode,
    parent: Option<usize>,
    selectors: SelectorPair,
    view_data: NodeViewData,
}

/// A node with no visible parent, along with its expanded parents and its children.
struct TrackedGroup {
    node: usize,
    parents: Vec<usize>,
    children: Vec<usize>,

    /// Combined over the node, its parents and its children.
    view_data: NodeViewData,

    ingress: BTreeSet<usize>,
    egress: BTreeSet<usize>,
    processed_ingress: bool,
    processed_egress: bool,
    followed_ingress: bool,
    followed_egress: bool,
}

/// The endpoints connected through a service node.
#[derive(Default)]
struct ServiceEdges {
    dest_by_source: HashMap<usize, BTreeSet<usize>>,
    source_by_dest: HashMap<usize, BTreeSet<usize>>,
}

/// The nodes tracked for one end of a flow.
struct Tracked {
    group: usize,

    /// From the top of the hierarchy to the node the edge connects to.
    endpoints: Vec<usize>,

    /// Set when the flow goes through a visible service.
    services: Vec<usize>,
}

struct GraphConstructor<'a> {
    data: &'a ServiceGraphData,
    view: &'a ParsedView,
    selectors: SelectorHelper<'a>,

    nodes: Vec<TrackedNode>,
    node_ids: HashMap<GraphNodeId, usize>,
    groups: Vec<TrackedGroup>,
    group_ids: HashMap<GraphNodeId, usize>,
    edges: HashMap<GraphEdgeId, GraphEdge>,
    service_edges: HashMap<usize, ServiceEdges>,

    /// Indexed by node and by group; set by pruning.
    nodes_in_view: Vec<bool>,
    groups_in_view: Vec<bool>,

    view_selectors: GraphSelectors,
}

fn missing_id(what: &str, endpoint: &FlowEndpoint) -> Error {
    Error::Internal(format!("unable to build the {what} ID for {endpoint}"))
}

fn layer_id(layer: &str) -> Option<GraphNodeId> {
    IdInfo {
        layer: Some(layer.to_string()),
        ..Default::default()
    }
    .layer_id()
}

// === impl TrackedGroup ===

impl TrackedGroup {
    fn new(node: usize, parents: &[usize], nodes: &[TrackedNode]) -> Self {
        let view_data = parents
            .iter()
            .fold(nodes[node].view_data, |vd, &idx| vd.combine(nodes[idx].view_data));
        Self {
            node,
            parents: parents.to_vec(),
            children: Vec::new(),
            view_data,
            ingress: BTreeSet::new(),
            egress: BTreeSet::new(),
            processed_ingress: false,
            processed_egress: false,
            followed_ingress: false,
            followed_egress: false,
        }
    }
}

// === impl ServiceEdges ===

impl ServiceEdges {
    fn add(&mut self, source: usize, dest: usize) {
        self.dest_by_source.entry(source).or_default().insert(dest);
        self.source_by_dest.entry(dest).or_default().insert(source);
    }
}

// === impl GraphConstructor ===

impl<'a> GraphConstructor<'a> {
    fn new(data: &'a ServiceGraphData, view: &'a ParsedView) -> Self {
        Self {
            data,
            view,
            selectors: SelectorHelper::new(view, &data.names, &data.service_groups),
            nodes: Vec::new(),
            node_ids: HashMap::new(),
            groups: Vec::new(),
            group_ids: HashMap::new(),
            edges: HashMap::new(),
            service_edges: HashMap::new(),
            nodes_in_view: Vec::new(),
            groups_in_view: Vec::new(),
            view_selectors: GraphSelectors::default(),
        }
    }

    fn populate(&mut self) {
        for flow in &self.data.flows {
            if let Err(error) = self.track_flow(flow) {
                error!(%error, edge = %flow.edge, "Unable to process flow");
            }
        }
        debug!(
            nodes = self.nodes.len(),
            groups = self.groups.len(),
            edges = self.edges.len(),
            "Populated graph"
        );
    }

    /// Converts a flow into nodes and up to two edges: a flow through a visible service is
    /// split into an edge to the service and an edge from the service.
    fn track_flow(&mut self, flow: &TimeSeriesFlow) -> Result<()> {
        trace!(edge = %flow.edge, "Tracking flow");
        let (egress, ingress) = if self.view.split_ingress_egress {
            (Some(Direction::Egress), Some(Direction::Ingress))
        } else {
            (None, None)
        };

        let src = self.track_nodes(&flow.edge.source, None, egress)?;
        let dst = self.track_nodes(&flow.edge.dest, flow.edge.service_port.as_ref(), ingress)?;

        let proto_ports = match flow.edge.dest.port {
            Some(port) => Some(AggregatedProtoPorts {
                proto_ports: vec![AggregatedPorts {
                    protocol: flow.edge.dest.protocol.clone(),
                    port_ranges: vec![PortRange::single(port.get())],
                    num_other_ports: 0,
                }],
                num_other_protocols: 0,
            }),
            None => flow.aggregated_proto_ports.clone(),
        };

        // Service ports are recorded up to, but excluding, the service port node. Without a
        // visible service they are recorded on the whole destination hierarchy.
        if let Some(sp) = &flow.edge.service_port {
            let hierarchy = if dst.services.is_empty() {
                &dst.endpoints
            } else {
                &dst.services
            };
            for &idx in hierarchy {
                let node = &mut self.nodes[idx].node;
                if node.node_type == Some(GraphNodeType::ServicePort) {
                    break;
                }
                node.include_service_port(sp);
            }
        }

        if let Some(ports) = &proto_ports {
            for &idx in &dst.endpoints {
                let node = &mut self.nodes[idx].node;
                if node.node_type.map_or(false, GraphNodeType::is_endpoint) {
                    node.include_aggregated_proto_ports(ports);
                }
            }
        }

        // Traffic is within a node while both hierarchies share it.
        let common = src
            .endpoints
            .iter()
            .zip(&dst.endpoints)
            .take_while(|(s, d)| s == d)
            .count();
        for &idx in &src.endpoints[..common] {
            self.nodes[idx].node.include_stats_within(&flow.stats);
        }
        for &idx in &src.endpoints[common..] {
            self.nodes[idx].node.include_stats_egress(&flow.stats);
        }
        for &idx in &dst.endpoints[common..] {
            self.nodes[idx].node.include_stats_ingress(&flow.stats);
        }

        if src.group == dst.group {
            return Ok(());
        }

        let (Some(&src_ep), Some(&dst_ep)) = (src.endpoints.last(), dst.endpoints.last()) else {
            return Err(Error::Internal(format!(
                "no endpoint nodes tracked for {}",
                flow.edge
            )));
        };

        match (dst.services.last(), &flow.edge.service_port) {
            (Some(&svc), Some(sp)) => {
                let edge = self.track_edge(src_ep, svc, &flow.stats);
                edge.include_service_port(sp);
                edge.include_endpoint_proto_ports(proto_ports.as_ref());

                let edge = self.track_edge(svc, dst_ep, &flow.stats);
                edge.include_endpoint_proto_ports(proto_ports.as_ref());

                self.service_edges
                    .entry(svc)
                    .or_default()
                    .add(src_ep, dst_ep);
            }
            _ => {
                let edge = self.track_edge(src_ep, dst_ep, &flow.stats);
                edge.include_endpoint_proto_ports(proto_ports.as_ref());
                if let Some(sp) = &flow.edge.service_port {
                    edge.include_service_port(sp);
                }
            }
        }

        self.groups[src.group].egress.insert(dst.group);
        self.groups[dst.group].ingress.insert(src.group);
        Ok(())
    }

    fn track_edge(&mut self, source: usize, dest: usize, stats: &[GraphStats]) -> &mut GraphEdge {
        let id = GraphEdgeId {
            source_node_id: self.nodes[source].node.id.clone(),
            dest_node_id: self.nodes[dest].node.id.clone(),
        };
        match self.edges.entry(id) {
            Entry::Occupied(entry) => {
                let edge = entry.into_mut();
                edge.include_stats(stats);
                edge
            }
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                entry.insert(GraphEdge::new(id, stats))
            }
        }
    }

    /// Converts an endpoint (and the service it was reached through) into its node hierarchy,
    /// stopping at the first node that is not expanded.
    ///
    /// Service groups and aggregated endpoints are never split: an endpoint always appears
    /// within its service group, or otherwise within its aggregated endpoint.
    fn track_nodes(
        &mut self,
        endpoint: &FlowEndpoint,
        svc: Option<&ServicePort>,
        direction: Option<Direction>,
    ) -> Result<Tracked> {
        let sg = match svc {
            Some(svc) => self.data.service_groups.by_service(&svc.service()),
            None => self.data.service_groups.by_endpoint(endpoint),
        };
        let mut info = IdInfo::for_endpoint(endpoint, svc, sg.clone(), direction);
        let group_namespace = info.effective_namespace().to_string();

        let endpoint_id = info.endpoint_id();
        let aggr_id = info
            .aggr_endpoint_id()
            .ok_or_else(|| missing_id("aggregated endpoint", endpoint))?;
        let aggr_type = info
            .aggr_endpoint_type()
            .ok_or_else(|| missing_id("aggregated endpoint", endpoint))?;

        // An endpoint or service group assigned to an expanded layer is not shown within its
        // namespace.
        let layers = &self.view.layers;
        let mut layer = endpoint_id
            .as_ref()
            .and_then(|id| layers.endpoint_to_layer.get(id))
            .or_else(|| layers.endpoint_to_layer.get(&aggr_id))
            .or_else(|| {
                let sg = sg.as_ref()?;
                layers.service_group_to_layer.get(&sg.id)
            })
            .cloned();
        let skip_namespace = layer.is_some();
        if layer.is_none() && !group_namespace.is_empty() {
            layer = layers.namespace_to_layer.get(&group_namespace).cloned();
        }

        let mut hierarchy = Vec::new();
        let done = |group, endpoints| Tracked {
            group,
            endpoints,
            services: Vec::new(),
        };

        if let Some(name) = layer {
            info.layer = Some(name.clone());
            let id = info.layer_id().ok_or_else(|| missing_id("layer", endpoint))?;
            let (idx, _) = self.track_node(&id, None, |sel, vd| {
                let node = GraphNode {
                    node_type: Some(GraphNodeType::Layer),
                    name: name.clone(),
                    expandable: true,
                    expanded: vd.expanded,
                    ..Default::default()
                };
                (node, sel.layer(&name))
            });
            if !self.nodes[idx].view_data.expanded {
                let group = self.track_group(&id, idx, &hierarchy);
                hierarchy.push(idx);
                return Ok(done(group, hierarchy));
            }
            hierarchy.push(idx);
        }

        if !group_namespace.is_empty() && !skip_namespace {
            let id = info
                .namespace_id()
                .ok_or_else(|| missing_id("namespace", endpoint))?;
            let (idx, _) = self.track_node(&id, hierarchy.last().copied(), |sel, vd| {
                let node = GraphNode {
                    node_type: Some(GraphNodeType::Namespace),
                    name: group_namespace.clone(),
                    expandable: true,
                    expanded: vd.expanded,
                    ..Default::default()
                };
                (node, sel.namespace(&group_namespace))
            });
            if !self.nodes[idx].view_data.expanded {
                let group = self.track_group(&id, idx, &hierarchy);
                hierarchy.push(idx);
                return Ok(done(group, hierarchy));
            }
            hierarchy.push(idx);
        }

        // The service group is always the group, even when expanded.
        let mut group = None;
        let mut services = Vec::new();
        if let Some(sg) = &sg {
            let (idx, _) = self.track_node(&sg.id, hierarchy.last().copied(), |sel, vd| {
                let node = GraphNode {
                    node_type: Some(GraphNodeType::ServiceGroup),
                    namespace: sg.namespace.clone(),
                    name: sg.name.clone(),
                    expandable: true,
                    expanded: vd.expanded,
                    ..Default::default()
                };
                (node, sel.service_group(sg))
            });
            let gp = self.track_group(&sg.id, idx, &hierarchy);
            hierarchy.push(idx);
            group = Some(gp);
            if !self.nodes[idx].view_data.expanded {
                return Ok(done(gp, hierarchy));
            }

            if let Some(svc) = svc {
                services = hierarchy.clone();
                let id = info
                    .service_id()
                    .ok_or_else(|| missing_id("service", endpoint))?;
                let (idx, created) = self.track_node(&id, services.last().copied(), |sel, _| {
                    let node = GraphNode {
                        node_type: Some(GraphNodeType::Service),
                        namespace: svc.namespace.clone(),
                        name: svc.name.clone(),
                        ..Default::default()
                    };
                    (node, sel.service(&svc.service()))
                });
                if created {
                    self.add_child(gp, idx);
                }
                services.push(idx);

                if self.view.expand_ports {
                    if let Some(id) = info.service_port_id() {
                        let (idx, created) =
                            self.track_node(&id, services.last().copied(), |sel, _| {
                                let node = GraphNode {
                                    node_type: Some(GraphNodeType::ServicePort),
                                    name: svc.port_name.clone(),
                                    port: svc.port,
                                    protocol: svc.protocol.clone(),
                                    ..Default::default()
                                };
                                (node, sel.service_port(svc))
                            });
                        if created {
                            self.add_child(gp, idx);
                        }
                        services.push(idx);
                    }
                }
            }
        }

        let expandable = endpoint_id.is_some();
        let aggr_endpoint = FlowEndpoint::new(aggr_type, &endpoint.namespace, &endpoint.name_aggr)
            .with_name(&endpoint.name);
        let (idx, created) = self.track_node(&aggr_id, hierarchy.last().copied(), |sel, vd| {
            let node = GraphNode {
                node_type: Some(aggr_type.into()),
                namespace: endpoint.namespace.clone(),
                name: endpoint.name_aggr.clone(),
                expandable,
                expanded: expandable && vd.expanded,
                ..Default::default()
            };
            (node, sel.endpoint(&aggr_endpoint, direction))
        });
        let group = match group {
            Some(gp) => {
                if created {
                    self.add_child(gp, idx);
                }
                gp
            }
            None => self.track_group(&aggr_id, idx, &hierarchy),
        };
        hierarchy.push(idx);

        let port_endpoint = |ep: &FlowEndpoint| ep.clone().with_port(&endpoint.protocol, endpoint.port);
        let port_node = || GraphNode {
            node_type: Some(GraphNodeType::Port),
            port: endpoint.port.map_or(0, |p| p.get()),
            protocol: endpoint.protocol.clone(),
            ..Default::default()
        };

        if !self.nodes[idx].node.expanded {
            if self.view.expand_ports {
                if let Some(id) = info.aggr_endpoint_port_id() {
                    let ep = port_endpoint(&aggr_endpoint);
                    let (idx, created) = self.track_node(&id, Some(idx), |sel, _| {
                        (port_node(), sel.endpoint(&ep, direction))
                    });
                    if created {
                        self.add_child(group, idx);
                    }
                    hierarchy.push(idx);
                }
            }
            return Ok(Tracked {
                group,
                endpoints: hierarchy,
                services,
            });
        }

        let id = endpoint_id.ok_or_else(|| missing_id("endpoint", endpoint))?;
        let ep = endpoint.without_port();
        let (idx, created) = self.track_node(&id, Some(idx), |sel, _| {
            let node = GraphNode {
                node_type: Some(endpoint.kind.into()),
                namespace: endpoint.namespace.clone(),
                name: endpoint.name.clone(),
                ..Default::default()
            };
            (node, sel.endpoint(&ep, direction))
        });
        if created {
            self.add_child(group, idx);
        }
        hierarchy.push(idx);

        if self.view.expand_ports {
            if let Some(id) = info.endpoint_port_id() {
                let ep = port_endpoint(&ep);
                let (idx, created) = self.track_node(&id, Some(idx), |sel, _| {
                    (port_node(), sel.endpoint(&ep, direction))
                });
                if created {
                    self.add_child(group, idx);
                }
                hierarchy.push(idx);
            }
        }

        Ok(Tracked {
            group,
            endpoints: hierarchy,
            services,
        })
    }

    /// Returns the node with the given ID, creating it if necessary.
    fn track_node(
        &mut self,
        id: &GraphNodeId,
        parent: Option<usize>,
        build: impl FnOnce(&SelectorHelper<'a>, NodeViewData) -> (GraphNode, SelectorPair),
    ) -> (usize, bool) {
        if let Some(&idx) = self.node_ids.get(id) {
            return (idx, false);
        }

        let view_data = self.view.node(id);
        let (mut node, selectors) = build(&self.selectors, view_data);
        node.id = id.clone();
        node.parent_id = parent.map(|p| self.nodes[p].node.id.clone());

        let idx = self.nodes.len();
        self.nodes.push(TrackedNode {
            node,
            parent,
            selectors,
            view_data,
        });
        self.node_ids.insert(id.clone(), idx);
        (idx, true)
    }

    fn track_group(&mut self, id: &GraphNodeId, node: usize, parents: &[usize]) -> usize {
        if let Some(&gp) = self.group_ids.get(id) {
            return gp;
        }
        let gp = self.groups.len();
        self.groups.push(TrackedGroup::new(node, parents, &self.nodes));
        self.group_ids.insert(id.clone(), gp);
        gp
    }

    fn add_child(&mut self, gp: usize, idx: usize) {
        let view_data = self.nodes[idx].view_data;
        let group = &mut self.groups[gp];
        group.children.push(idx);
        group.view_data = group.view_data.combine(view_data);
    }

    /// Determines which groups are in view, starting from the groups in focus, and drops the
    /// edges that are not entirely in view.
    fn prune(&mut self) {
        if self.view.empty_focus {
            debug!("No focus selected, all nodes are in view");
            self.nodes_in_view = vec![true; self.nodes.len()];
            self.groups_in_view = vec![true; self.groups.len()];
            return;
        }

        let mut in_view = vec![false; self.groups.len()];
        let focus = (0..self.groups.len())
            .filter(|&gp| self.groups[gp].view_data.in_focus)
            .collect::<Vec<_>>();
        for &gp in &focus {
            trace!(group = %self.group_id(gp), "Group is in focus");
            in_view[gp] = true;
        }

        let follow_direction = self.view.follow_connection_direction;
        let mut following = Vec::new();

        let mut expand = focus.clone();
        while let Some(gp) = expand.pop() {
            if self.groups[gp].processed_ingress {
                continue;
            }
            self.groups[gp].processed_ingress = true;
            let connected = self.groups[gp].ingress.iter().copied().collect::<Vec<_>>();
            for other in connected {
                in_view[other] = true;
                if follow_direction {
                    expand.push(other);
                    self.groups[gp].followed_ingress = true;
                } else if self.is_followed(other) {
                    following.push(other);
                }
            }
        }

        let mut expand = focus;
        while let Some(gp) = expand.pop() {
            if self.groups[gp].processed_egress {
                continue;
            }
            self.groups[gp].processed_egress = true;
            let connected = self.groups[gp].egress.iter().copied().collect::<Vec<_>>();
            for other in connected {
                in_view[other] = true;
                if follow_direction {
                    expand.push(other);
                    self.groups[gp].followed_egress = true;
                } else if self.is_followed(other) {
                    following.push(other);
                }
            }
        }

        while let Some(gp) = following.pop() {
            let group = &mut self.groups[gp];
            let mut next = Vec::new();
            if group.view_data.followed_ingress && !group.processed_ingress {
                group.processed_ingress = true;
                group.followed_ingress = true;
                next.extend(group.ingress.iter().copied());
            }
            if group.view_data.followed_egress && !group.processed_egress {
                group.processed_egress = true;
                group.followed_egress = true;
                next.extend(group.egress.iter().copied());
            }
            for other in next {
                trace!(from = %self.group_id(gp), to = %self.group_id(other), "Following connection");
                in_view[other] = true;
                following.push(other);
            }
        }

        let mut nodes_in_view = vec![false; self.nodes.len()];
        for (gp, group) in self.groups.iter().enumerate() {
            if !in_view[gp] {
                continue;
            }
            nodes_in_view[group.node] = true;
            for &idx in group.parents.iter().chain(&group.children) {
                nodes_in_view[idx] = true;
            }
        }
        self.nodes_in_view = nodes_in_view;
        self.groups_in_view = in_view;

        // Edges leaving the view mark where the graph may be followed further.
        let edges = std::mem::take(&mut self.edges);
        for (id, edge) in edges {
            let source = self.in_view(&id.source_node_id);
            let dest = self.in_view(&id.dest_node_id);
            match (source, dest) {
                (Some(_), Some(_)) => {
                    self.edges.insert(id, edge);
                }
                (Some(source), None) => self.nodes[source].node.follow_egress = true,
                (None, Some(dest)) => self.nodes[dest].node.follow_ingress = true,
                (None, None) => {}
            }
        }

        debug!(
            groups = self.groups_in_view.iter().filter(|v| **v).count(),
            nodes = self.nodes_in_view.iter().filter(|v| **v).count(),
            edges = self.edges.len(),
            "Pruned graph"
        );
    }

    fn is_followed(&self, gp: usize) -> bool {
        let vd = self.groups[gp].view_data;
        vd.followed_ingress || vd.followed_egress
    }

    fn group_id(&self, gp: usize) -> &GraphNodeId {
        &self.nodes[self.groups[gp].node].node.id
    }

    fn in_view(&self, id: &GraphNodeId) -> Option<usize> {
        let idx = *self.node_ids.get(id)?;
        self.nodes_in_view[idx].then_some(idx)
    }

    /// Events are counted against the most granular node in view. Events never add nodes.
    fn overlay_events(&mut self) {
        let groups = &self.data.service_groups;
        for event in &self.data.events {
            for ep in &event.endpoints {
                let info = match ep.flow_endpoint() {
                    Some(fep) => {
                        let sg = groups.by_endpoint(&fep);
                        IdInfo::for_endpoint(&fep, None, sg, None)
                    }
                    None => IdInfo {
                        namespace: ep.namespace.clone(),
                        service_group: ep.service().and_then(|svc| groups.by_service(&svc)),
                        ..Default::default()
                    },
                };
                if let Some(idx) = self.most_granular_in_view(&info) {
                    trace!(event = %event.id, node = %self.nodes[idx].node.id, "Event overlaid");
                    self.nodes[idx].node.events_count += 1;
                }
            }
        }
    }

    /// DNS statistics are added to the most granular node in view and all of its parents.
    fn overlay_dns(&mut self) {
        for log in &self.data.dns {
            let sg = self.data.service_groups.by_endpoint(&log.endpoint);
            let info = IdInfo::for_endpoint(&log.endpoint, None, sg, None);
            let mut next = self.most_granular_in_view(&info);
            while let Some(idx) = next {
                self.nodes[idx].node.include_stats_within(&log.stats);
                next = self.nodes[idx].parent;
            }
        }
    }

    fn most_granular_in_view(&self, info: &IdInfo) -> Option<usize> {
        let endpoint_id = info.endpoint_id();
        let aggr_id = info.aggr_endpoint_id();
        let sg_id = info.service_group_id();
        for id in [&endpoint_id, &aggr_id, &sg_id].into_iter().flatten() {
            if let Some(idx) = self.in_view(id) {
                return Some(idx);
            }
        }

        // A layer holding the endpoint or its service group is the only place it may be shown.
        let layers = &self.view.layers;
        let layer = endpoint_id
            .iter()
            .chain(&aggr_id)
            .find_map(|id| layers.endpoint_to_layer.get(id))
            .or_else(|| layers.service_group_to_layer.get(sg_id.as_ref()?));
        if let Some(layer) = layer {
            return self.in_view(&layer_id(layer)?);
        }

        let namespace = info.effective_namespace();
        if namespace.is_empty() {
            return None;
        }
        if let Some(idx) = info.namespace_id().and_then(|id| self.in_view(&id)) {
            return Some(idx);
        }
        let layer = layers.namespace_to_layer.get(namespace)?;
        self.in_view(&layer_id(layer)?)
    }

    fn overlay_selectors(&mut self) {
        let mut alerts = None;
        for (idx, tracked) in self.nodes.iter_mut().enumerate() {
            if !self.nodes_in_view[idx] {
                continue;
            }
            tracked.node.selectors = tracked.selectors.node_selectors().to_graph_selectors();
            if let Some(sel) = &tracked.selectors.source.alerts {
                alerts = Selector::or([alerts, Some(sel.clone())]);
            }
        }

        for (id, edge) in self.edges.iter_mut() {
            let (Some(&src), Some(&dst)) = (
                self.node_ids.get(&id.source_node_id),
                self.node_ids.get(&id.dest_node_id),
            ) else {
                continue;
            };
            let nodes = &self.nodes;
            let selectors = if let Some(se) = self.service_edges.get(&src) {
                // From a service: any of the sources that reached this destination through it.
                se.source_by_dest
                    .get(&dst)
                    .into_iter()
                    .flatten()
                    .fold(SelectorSet::default(), |acc, &s| {
                        acc.or(&nodes[s].selectors.source)
                    })
                    .and(&nodes[dst].selectors.dest)
            } else if let Some(se) = self.service_edges.get(&dst) {
                // To a service: any of the destinations this source reached through it.
                let dests = se
                    .dest_by_source
                    .get(&src)
                    .into_iter()
                    .flatten()
                    .fold(SelectorSet::default(), |acc, &d| {
                        acc.or(&nodes[d].selectors.dest)
                    });
                nodes[src].selectors.source.and(&dests)
            } else {
                nodes[src].selectors.source.and(&nodes[dst].selectors.dest)
            };
            edge.selectors = selectors.to_graph_selectors();
        }

        if self.view.empty_focus {
            self.view_selectors = GraphSelectors::all();
            return;
        }

        let mut selected = self
            .view
            .node_view_data
            .iter()
            .filter_map(|(id, vd)| Some((id, vd, self.in_view(id)?)))
            .collect::<Vec<_>>();
        selected.sort_by(|a, b| a.0.cmp(b.0));

        let mut view = SelectorSet::default();
        for (_, vd, idx) in selected {
            let selectors = &self.nodes[idx].selectors;
            if vd.in_focus {
                view = view.or(&selectors.node_selectors());
                continue;
            }
            if vd.followed_egress {
                view = view.or(&selectors.source);
            }
            if vd.followed_ingress {
                view = view.or(&selectors.dest);
            }
        }

        // Groups followed implicitly by following the connection direction.
        for (gp, group) in self.groups.iter().enumerate() {
            if !self.groups_in_view[gp] || group.view_data.in_focus {
                continue;
            }
            let selectors = &self.nodes[group.node].selectors;
            if group.followed_egress && !group.view_data.followed_egress {
                view = view.or(&selectors.source);
            }
            if group.followed_ingress && !group.view_data.followed_ingress {
                view = view.or(&selectors.dest);
            }
        }

        self.view_selectors = view.to_graph_selectors();
        self.view_selectors.alerts = alerts.and_then(|sel| sel.render());
    }

    fn into_response(self) -> ServiceGraphResponse {
        let mut nodes = self
            .nodes
            .into_iter()
            .zip(self.nodes_in_view)
            .filter_map(|(tracked, in_view)| in_view.then_some(tracked.node))
            .collect::<Vec<_>>();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges = self.edges.into_values().collect::<Vec<_>>();
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        for node in &nodes {
            trace!(%node, "Graph node");
        }
        for edge in &edges {
            trace!(edge = %edge.id, "Graph edge");
        }

        ServiceGraphResponse {
            time_intervals: self.data.time_intervals.clone(),
            nodes,
            edges,
            selectors: self.view_selectors,
            truncated: self.data.truncated,
        }
    }
}
