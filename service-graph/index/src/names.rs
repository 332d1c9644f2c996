//! Host naming.
//!
//! Host endpoints are reported individually. The view may name groups of hosts by label
//! selector, in which case hosts are aggregated under the name of the first selector that
//! matches them; all other hosts are aggregated under `*`.

use ahash::AHashMap as HashMap;
use service_graph_core::{
    request::NamedSelector, EndpointType, Error, FlowEdge, FlowEndpoint, GraphNodeType, Result,
    AGGREGATED,
};
use service_graph_flows::Event;
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

pub type Labels = BTreeMap<String, String>;

/// A conjunction of label expressions, e.g. `role == 'infra' && has(zone)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    expressions: Vec<Expression>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Expression {
    key: String,
    operator: Operator,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Operator {
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

/// Assigns hosts to the host groups named in the view.
#[derive(Clone, Debug, Default)]
pub struct NameHelper {
    groups_by_host: HashMap<String, String>,
    hosts_by_group: HashMap<String, Vec<String>>,
}

// === impl LabelSelector ===

impl LabelSelector {
    pub fn matches(&self, labels: &Labels) -> bool {
        self.expressions.iter().all(|expr| expr.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut expressions = Vec::new();
        for term in s.split("&&").map(str::trim) {
            if term.is_empty() || term == "all()" {
                continue;
            }
            expressions.push(term.parse()?);
        }
        Ok(Self { expressions })
    }
}

// === impl Expression ===

impl Expression {
    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match &self.operator {
            Operator::In(values) => value.map_or(false, |v| values.contains(v)),
            Operator::NotIn(values) => value.map_or(true, |v| !values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl FromStr for Expression {
    type Err = String;

    fn from_str(term: &str) -> Result<Self, Self::Err> {
        let (key, operator) = if let Some(key) = function(term, "!has") {
            (key, Operator::DoesNotExist)
        } else if let Some(key) = function(term, "has") {
            (key, Operator::Exists)
        } else if let Some((key, values)) = term.split_once(" not in ") {
            (key.trim(), Operator::NotIn(set(values)?))
        } else if let Some((key, values)) = term.split_once(" in ") {
            (key.trim(), Operator::In(set(values)?))
        } else if let Some((key, value)) = term.split_once("!=") {
            (key.trim(), Operator::NotIn(Some(literal(value)?).into_iter().collect()))
        } else if let Some((key, value)) = term.split_once("==") {
            (key.trim(), Operator::In(Some(literal(value)?).into_iter().collect()))
        } else {
            return Err(format!("unsupported selector expression: {term}"));
        };

        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("invalid label key in expression: {term}"));
        }
        Ok(Self {
            key: key.to_string(),
            operator,
        })
    }
}

/// Extracts the argument of `name(arg)`.
fn function<'t>(term: &'t str, name: &str) -> Option<&'t str> {
    term.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn literal(value: &str) -> Result<String, String> {
    let value = value.trim();
    ['\'', '"']
        .iter()
        .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
        .map(str::to_string)
        .ok_or_else(|| format!("expected a quoted value: {value}"))
}

fn set(values: &str) -> Result<BTreeSet<String>, String> {
    let inner = values
        .trim()
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .ok_or_else(|| format!("expected a set of values: {values}"))?;
    inner
        .split(',')
        .filter(|v| !v.trim().is_empty())
        .map(literal)
        .collect()
}

// === impl NameHelper ===

impl NameHelper {
    /// Builds the host groups from the selectors in the view and the labels of known hosts.
    pub fn new<'h>(
        selectors: &[NamedSelector],
        hosts: impl IntoIterator<Item = (&'h String, &'h Labels)>,
    ) -> Result<Self> {
        let mut helper = Self::default();
        if selectors.is_empty() {
            return Ok(helper);
        }

        let parsed = selectors
            .iter()
            .map(|ns| {
                let selector = ns.selector.parse::<LabelSelector>().map_err(|reason| {
                    Error::InvalidView(format!("host aggregation selector {:?}: {reason}", ns.name))
                })?;
                Ok((ns.name.as_str(), selector))
            })
            .collect::<Result<Vec<_>>>()?;

        for (host, labels) in hosts {
            let Some((group, _)) = parsed.iter().find(|(_, sel)| sel.matches(labels)) else {
                continue;
            };
            helper
                .groups_by_host
                .insert(host.clone(), group.to_string());
            helper
                .hosts_by_group
                .entry(group.to_string())
                .or_default()
                .push(host.clone());
        }
        for hosts in helper.hosts_by_group.values_mut() {
            hosts.sort();
        }
        Ok(helper)
    }

    /// The group a host is aggregated under.
    pub fn host_group(&self, host: &str) -> &str {
        self.groups_by_host
            .get(host)
            .map_or(AGGREGATED, String::as_str)
    }

    /// The hosts known to be in a named group, sorted. Hosts in the `*` group are not listed.
    pub fn hosts_in_group(&self, group: &str) -> &[String] {
        self.hosts_by_group
            .get(group)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Raw host endpoints carry the host name in the aggregated name. This moves the host name
    /// to the name and sets the aggregated name to the host group.
    pub fn convert_endpoint(&self, ep: &mut FlowEndpoint) {
        if ep.kind != EndpointType::Host {
            return;
        }
        if ep.name.is_empty() {
            ep.name = std::mem::take(&mut ep.name_aggr);
        }
        ep.name_aggr = self.host_group(&ep.name).to_string();
    }

    pub fn convert_edge(&self, edge: &mut FlowEdge) {
        self.convert_endpoint(&mut edge.source);
        self.convert_endpoint(&mut edge.dest);
    }

    pub fn convert_event(&self, event: &mut Event) {
        for ep in event
            .endpoints
            .iter_mut()
            .filter(|ep| ep.node_type == GraphNodeType::Host && !ep.name.is_empty())
        {
            ep.name_aggr = self.host_group(&ep.name).to_string();
        }
    }
}
