//! Parses the view selected by the user against the current service groups.

use crate::ServiceGroups;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use service_graph_core::{
    id::{self, IdInfo, ParsedId},
    request::SelectedView,
    Direction, Error, FlowEndpoint, GraphNodeId, GraphNodeType, Result, ServiceGroup,
    ServiceGroupLookup,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::debug;

/// How the user has selected a node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeViewData {
    pub in_focus: bool,
    pub expanded: bool,
    pub followed_ingress: bool,
    pub followed_egress: bool,
}

/// Selected node IDs, by kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSets {
    pub layers: BTreeSet<GraphNodeId>,
    pub namespaces: BTreeSet<GraphNodeId>,
    pub service_groups: BTreeSet<GraphNodeId>,
    pub endpoints: BTreeSet<GraphNodeId>,
}

#[derive(Clone, Debug, Default)]
pub struct ParsedLayers {
    pub namespace_to_layer: HashMap<String, String>,
    pub service_group_to_layer: HashMap<GraphNodeId, String>,

    /// Keyed by aggregated endpoint ID.
    pub endpoint_to_layer: HashMap<GraphNodeId, String>,

    pub layer_to_namespaces: BTreeMap<String, Vec<String>>,
    pub layer_to_service_groups: BTreeMap<String, Vec<Arc<ServiceGroup>>>,
    pub layer_to_endpoints: BTreeMap<String, Vec<FlowEndpoint>>,
}

#[derive(Clone, Debug, Default)]
pub struct ParsedView {
    pub focus: NodeSets,
    pub expanded: NodeSets,
    pub followed_ingress: NodeSets,
    pub followed_egress: NodeSets,

    /// No focus was selected, so the whole graph is in view.
    pub empty_focus: bool,

    pub node_view_data: HashMap<GraphNodeId, NodeViewData>,
    pub layers: ParsedLayers,

    pub expand_ports: bool,
    pub follow_connection_direction: bool,
    pub split_ingress_egress: bool,
}

// === impl NodeViewData ===

impl NodeViewData {
    pub fn combine(self, other: Self) -> Self {
        Self {
            in_focus: self.in_focus || other.in_focus,
            expanded: self.expanded || other.expanded,
            followed_ingress: self.followed_ingress || other.followed_ingress,
            followed_egress: self.followed_egress || other.followed_egress,
        }
    }
}

// === impl NodeSets ===

impl NodeSets {
    fn insert(&mut self, id: GraphNodeId) -> Result<()> {
        let set = match id.as_str().parse::<ParsedId>()?.node_type() {
            Some(GraphNodeType::Layer) => &mut self.layers,
            Some(GraphNodeType::Namespace) => &mut self.namespaces,
            Some(
                GraphNodeType::ServiceGroup | GraphNodeType::Service | GraphNodeType::ServicePort,
            ) => &mut self.service_groups,
            Some(_) => &mut self.endpoints,
            None => return Ok(()),
        };
        set.insert(id);
        Ok(())
    }
}

// === impl ParsedView ===

impl ParsedView {
    pub fn parse(view: &SelectedView, groups: &ServiceGroups) -> Result<Self> {
        let mut names = HashSet::new();
        for ns in &view.host_aggregation_selectors {
            if !id::is_valid_field(&ns.name) {
                return Err(Error::InvalidView(format!(
                    "invalid host aggregation name {:?}",
                    ns.name
                )));
            }
            if !names.insert(ns.name.as_str()) {
                return Err(Error::InvalidView(format!(
                    "duplicate host aggregation name {:?}",
                    ns.name
                )));
            }
        }

        let mut parsed = Self {
            empty_focus: view.focus.is_empty(),
            expand_ports: view.expand_ports,
            follow_connection_direction: view.follow_connection_direction,
            split_ingress_egress: view.split_ingress_egress,
            layers: ParsedLayers::parse(view, groups)?,
            ..Self::default()
        };

        let split = view.split_ingress_egress;
        for id in &view.focus {
            for id in id::normalized_ids(id, groups, split)? {
                parsed.view_data(&id).in_focus = true;
                parsed.focus.insert(id)?;
            }
        }
        for id in &view.expanded {
            for id in id::normalized_ids(id, groups, split)? {
                parsed.view_data(&id).expanded = true;
                parsed.expanded.insert(id)?;
            }
        }
        for id in &view.followed_ingress {
            for id in id::normalized_ids(id, groups, split)? {
                parsed.view_data(&id).followed_ingress = true;
                parsed.followed_ingress.insert(id)?;
            }
        }
        for id in &view.followed_egress {
            for id in id::normalized_ids(id, groups, split)? {
                parsed.view_data(&id).followed_egress = true;
                parsed.followed_egress.insert(id)?;
            }
        }

        debug!(
            nodes = parsed.node_view_data.len(),
            layers = parsed.layers.layer_to_namespaces.len()
                + parsed.layers.layer_to_service_groups.len()
                + parsed.layers.layer_to_endpoints.len(),
            "Parsed view"
        );
        Ok(parsed)
    }

    fn view_data(&mut self, id: &GraphNodeId) -> &mut NodeViewData {
        self.node_view_data.entry(id.clone()).or_default()
    }

    /// The view data for a node; unselected nodes have none set.
    pub fn node(&self, id: &GraphNodeId) -> NodeViewData {
        self.node_view_data.get(id).copied().unwrap_or_default()
    }
}

// === impl ParsedLayers ===

impl ParsedLayers {
    fn parse(view: &SelectedView, groups: &ServiceGroups) -> Result<Self> {
        let mut layers = Self::default();
        let mut names = HashSet::new();
        for layer in &view.layers {
            if !id::is_valid_field(&layer.name) {
                return Err(Error::InvalidView(format!(
                    "invalid layer name {:?}",
                    layer.name
                )));
            }
            if !names.insert(layer.name.as_str()) {
                return Err(Error::InvalidView(format!(
                    "duplicate layer name {:?}",
                    layer.name
                )));
            }
            for node in &layer.nodes {
                layers.add_node(&layer.name, node, groups, view.split_ingress_egress)?;
            }
        }
        Ok(layers)
    }

    fn add_node(
        &mut self,
        layer: &str,
        node: &GraphNodeId,
        groups: &ServiceGroups,
        split: bool,
    ) -> Result<()> {
        let info = IdInfo::parse(node, groups)?;
        match info.parsed_type {
            Some(GraphNodeType::Layer) => Err(Error::InvalidView(format!(
                "layer {layer:?} may not contain layer {node}"
            ))),

            Some(GraphNodeType::Namespace) => {
                assign(&mut self.namespace_to_layer, info.namespace.clone(), layer, node)?;
                push_unique(&mut self.layer_to_namespaces, layer, info.namespace);
                Ok(())
            }

            Some(GraphNodeType::ServiceGroup | GraphNodeType::Service | GraphNodeType::ServicePort) => {
                let sg = info.service_group.clone().or_else(|| {
                    let svc = info.service.as_ref()?;
                    groups.by_service(&svc.service())
                });
                match sg {
                    Some(sg) => self.add_service_group(layer, node, sg),
                    None => Ok(()),
                }
            }

            Some(_) => {
                // Endpoints are never separated from their service group or aggregated endpoint.
                if let Some(sg) = info.service_group.clone() {
                    return self.add_service_group(layer, node, sg);
                }

                let mut aggr = info;
                aggr.endpoint_type = aggr.aggr_endpoint_type();
                aggr.name.clear();
                aggr.protocol.clear();
                aggr.port = None;

                let directions = if split {
                    vec![Some(Direction::Ingress), Some(Direction::Egress)]
                } else {
                    vec![None]
                };
                for direction in directions {
                    aggr.direction = direction;
                    if let Some(id) = aggr.aggr_endpoint_id() {
                        assign(&mut self.endpoint_to_layer, id, layer, node)?;
                    }
                }
                if let Some(ep) = aggr.endpoint() {
                    push_unique(&mut self.layer_to_endpoints, layer, ep);
                }
                Ok(())
            }

            None => Ok(()),
        }
    }

    fn add_service_group(
        &mut self,
        layer: &str,
        node: &GraphNodeId,
        sg: Arc<ServiceGroup>,
    ) -> Result<()> {
        assign(&mut self.service_group_to_layer, sg.id.clone(), layer, node)?;
        let sgs = self.layer_to_service_groups.entry(layer.to_string()).or_default();
        if !sgs.iter().any(|existing| existing.id == sg.id) {
            sgs.push(sg);
        }
        Ok(())
    }
}

/// Assigns a node to a layer. A node may only be in one layer.
fn assign<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, String>,
    key: K,
    layer: &str,
    node: &GraphNodeId,
) -> Result<()> {
    match map.get(&key) {
        Some(existing) if existing != layer => Err(Error::InvalidView(format!(
            "{node} is in layers {existing:?} and {layer:?}"
        ))),
        Some(_) => Ok(()),
        None => {
            map.insert(key, layer.to_string());
            Ok(())
        }
    }
}

fn push_unique<T: PartialEq>(map: &mut BTreeMap<String, Vec<T>>, layer: &str, value: T) {
    let values = map.entry(layer.to_string()).or_default();
    if !values.contains(&value) {
        values.push(value);
    }
}
