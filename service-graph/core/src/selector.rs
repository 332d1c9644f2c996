//! Log-query selectors.
//!
//! Every node and edge carries selectors that the UI uses to query the raw logs behind it, e.g.
//! `source_namespace == "shop" || dest_namespace == "shop"`. Selectors are built as trees and
//! simplified as they are combined, so that rendering is deterministic.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Matches nothing. Only ever appears at the root of a combined selector.
    NoMatch,
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Num(i64),
}

/// Selectors for each of the log types that may be queried for a node or edge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectorSet {
    pub l3_flows: Option<Selector>,
    pub l7_flows: Option<Selector>,
    pub dns_logs: Option<Selector>,
    pub alerts: Option<Selector>,
}

/// The selectors used when an edge originates from a node and when an edge terminates at it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectorPair {
    pub source: SelectorSet,
    pub dest: SelectorSet,
}

/// Rendered selectors, as returned to clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSelectors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3_flows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l7_flows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerts: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Op {
    And,
    Or,
}

// === impl Selector ===

impl Selector {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(key.into(), value.into())
    }

    pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(key.into(), value.into())
    }

    /// Matches any of the values. An empty list matches nothing.
    pub fn any_of(key: impl Into<String>, values: Vec<String>) -> Self {
        if values.is_empty() {
            return Self::NoMatch;
        }
        Self::In(key.into(), values)
    }

    pub fn and(parts: impl IntoIterator<Item = Option<Selector>>) -> Option<Self> {
        Self::combine(Op::And, parts)
    }

    pub fn or(parts: impl IntoIterator<Item = Option<Selector>>) -> Option<Self> {
        Self::combine(Op::Or, parts)
    }

    /// Combines selectors, simplifying as we go:
    ///
    /// - missing parts are ignored;
    /// - `NoMatch` makes an AND match nothing, and is dropped from an OR unless every part is
    ///   `NoMatch`;
    /// - `In` clauses on the same key are merged (intersection for AND, union for OR);
    /// - children with the same operator are flattened into the parent.
    fn combine(op: Op, parts: impl IntoIterator<Item = Option<Selector>>) -> Option<Self> {
        let mut updated = Vec::new();
        let mut found_no_match = false;
        let mut in_values = BTreeMap::<String, Vec<String>>::new();

        for part in parts.into_iter().flatten() {
            match part {
                Self::NoMatch if op == Op::And => return Some(Self::NoMatch),
                Self::NoMatch => found_no_match = true,
                Self::In(key, values) => match in_values.get_mut(&key) {
                    Some(existing) => merge_in_values(op, existing, values),
                    None => {
                        in_values.insert(key, values);
                    }
                },
                other => updated.push(other),
            }
        }

        for (key, values) in in_values {
            match Self::any_of(key, values) {
                Self::NoMatch if op == Op::And => return Some(Self::NoMatch),
                Self::NoMatch => found_no_match = true,
                sel => updated.push(sel),
            }
        }

        if found_no_match && updated.is_empty() {
            return Some(Self::NoMatch);
        }

        let mut selectors = Vec::with_capacity(updated.len());
        for sel in updated {
            match (op, sel) {
                (Op::And, Self::And(children)) | (Op::Or, Self::Or(children)) => {
                    selectors.extend(children)
                }
                (_, sel) => selectors.push(sel),
            }
        }

        match selectors.len() {
            0 => None,
            1 => selectors.pop(),
            _ => Some(match op {
                Op::And => Self::And(selectors),
                Op::Or => Self::Or(selectors),
            }),
        }
    }

    /// Renders the selector, or `None` when it matches nothing.
    pub fn render(&self) -> Option<String> {
        if *self == Self::NoMatch {
            return None;
        }
        Some(self.render_nested(false))
    }

    fn render_nested(&self, nested: bool) -> String {
        match self {
            Self::NoMatch => String::new(),
            Self::And(parts) | Self::Or(parts) => {
                let sep = if matches!(self, Self::And(_)) {
                    " && "
                } else {
                    " || "
                };
                let mut rendered = parts
                    .iter()
                    .map(|p| p.render_nested(true))
                    .collect::<Vec<_>>();
                rendered.sort();
                rendered.dedup();
                let joined = rendered.join(sep);
                if nested && rendered.len() > 1 {
                    format!("({joined})")
                } else {
                    joined
                }
            }
            Self::Eq(key, value) => format!("{} == {}", quote_key(key), value),
            Self::Ne(key, value) => format!("{} != {}", quote_key(key), value),
            Self::In(key, values) => {
                let key = quote_key(key);
                let joined = values
                    .iter()
                    .map(|v| format!("{key} == \"{v}\""))
                    .collect::<Vec<_>>()
                    .join(" || ");
                if nested && values.len() > 1 {
                    format!("({joined})")
                } else {
                    joined
                }
            }
        }
    }
}

fn merge_in_values(op: Op, existing: &mut Vec<String>, values: Vec<String>) {
    match op {
        Op::And => existing.retain(|v| values.contains(v)),
        Op::Or => {
            for v in values {
                if !existing.contains(&v) {
                    existing.push(v);
                }
            }
        }
    }
}

/// Keys containing `.` reference nested fields and must be quoted.
fn quote_key(key: &str) -> String {
    if key.contains('.') {
        format!("\"{key}\"")
    } else {
        key.to_string()
    }
}

// === impl Value ===

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Num(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Self::Num(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

// === impl SelectorSet ===

impl SelectorSet {
    pub fn and(&self, other: &Self) -> Self {
        self.zip(other, Selector::and)
    }

    pub fn or(&self, other: &Self) -> Self {
        self.zip(other, Selector::or)
    }

    fn zip(&self, other: &Self, f: fn([Option<Selector>; 2]) -> Option<Selector>) -> Self {
        Self {
            l3_flows: f([self.l3_flows.clone(), other.l3_flows.clone()]),
            l7_flows: f([self.l7_flows.clone(), other.l7_flows.clone()]),
            dns_logs: f([self.dns_logs.clone(), other.dns_logs.clone()]),
            alerts: f([self.alerts.clone(), other.alerts.clone()]),
        }
    }

    pub fn to_graph_selectors(&self) -> GraphSelectors {
        let render = |s: &Option<Selector>| s.as_ref().and_then(Selector::render);
        GraphSelectors {
            l3_flows: render(&self.l3_flows),
            l7_flows: render(&self.l7_flows),
            dns_logs: render(&self.dns_logs),
            alerts: render(&self.alerts),
        }
    }
}

// === impl SelectorPair ===

impl SelectorPair {
    /// Selects logs with the node at either end.
    pub fn node_selectors(&self) -> SelectorSet {
        self.source.or(&self.dest)
    }

    pub fn and(&self, other: &Self) -> Self {
        Self {
            source: self.source.and(&other.source),
            dest: self.dest.and(&other.dest),
        }
    }

    pub fn or(&self, other: &Self) -> Self {
        Self {
            source: self.source.or(&other.source),
            dest: self.dest.or(&other.dest),
        }
    }
}

// === impl GraphSelectors ===

impl GraphSelectors {
    /// Selects all logs.
    pub fn all() -> Self {
        Self {
            l3_flows: Some(String::new()),
            l7_flows: Some(String::new()),
            dns_logs: Some(String::new()),
            alerts: Some(String::new()),
        }
    }
}
