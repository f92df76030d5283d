//! RoutingTable: per-domain `source -> {destination -> rule}` with predicate
//! evaluation.
//!
//! Predicates are a sum type: a native function over the message, or a
//! declarative `{type, field, value}` check evaluated against the payload
//! parsed as a field-map. Rule evaluation clones the matching rules out of
//! the table so no lock is held while predicates run or while the engine
//! republishes to destinations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::message::Message;
use crate::error::BrokerError;

// ==========================================
// PREDICATES
// ==========================================

pub type PredicateFn = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredicateOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclarativeRule {
    #[serde(rename = "type")]
    pub op: PredicateOp,
    pub field: String,
    pub value: Value,
}

#[derive(Clone)]
pub enum Predicate {
    Function(PredicateFn),
    Declarative(DeclarativeRule),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Declarative(rule) => f.debug_tuple("Declarative").field(rule).finish(),
        }
    }
}

impl Predicate {
    pub fn function(f: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }

    pub fn declarative(op: PredicateOp, field: impl Into<String>, value: Value) -> Self {
        Self::Declarative(DeclarativeRule { op, field: field.into(), value })
    }

    /// Parse the wire format `{"type": <op>, "field": <string>, "value": <json>}`.
    pub fn from_json(raw: &Value) -> Result<Self, BrokerError> {
        serde_json::from_value::<DeclarativeRule>(raw.clone())
            .map(Self::Declarative)
            .map_err(|e| BrokerError::InvalidPredicate(e.to_string()))
    }

    pub fn evaluate(&self, msg: &Message) -> bool {
        match self {
            Self::Function(f) => f(msg),
            Self::Declarative(rule) => {
                let map = match msg.field_map() {
                    Some(map) => map,
                    None => return false,
                };
                let field = match map.get(&rule.field) {
                    Some(v) => v,
                    None => return false,
                };
                match rule.op {
                    PredicateOp::Eq => match (scalar_repr(field), scalar_repr(&rule.value)) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    },
                    PredicateOp::Ne => match (scalar_repr(field), scalar_repr(&rule.value)) {
                        (Some(a), Some(b)) => a != b,
                        _ => false,
                    },
                    PredicateOp::Gt => match (field.as_f64(), rule.value.as_f64()) {
                        (Some(a), Some(b)) => a > b,
                        _ => false,
                    },
                    PredicateOp::Lt => match (field.as_f64(), rule.value.as_f64()) {
                        (Some(a), Some(b)) => a < b,
                        _ => false,
                    },
                    PredicateOp::Contains => match (field.as_str(), rule.value.as_str()) {
                        (Some(haystack), Some(needle)) => haystack.contains(needle),
                        _ => false,
                    },
                }
            }
        }
    }
}

/// String-formatted representation used by eq/ne. Only scalars compare.
fn scalar_repr(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ==========================================
// ROUTING TABLE
// ==========================================

#[derive(Clone)]
pub struct RoutingRule {
    pub source: String,
    pub destination: String,
    pub predicate: Predicate,
}

pub struct RoutingTable {
    /// domain -> source -> destination -> rule
    routes: DashMap<String, HashMap<String, HashMap<String, Arc<RoutingRule>>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { routes: DashMap::new() }
    }

    /// Queue-existence checks belong to the caller; the table only rejects
    /// duplicates.
    pub fn add(&self, domain: &str, rule: RoutingRule) -> Result<(), BrokerError> {
        let mut entry = self.routes.entry(domain.to_string()).or_default();
        let destinations = entry.entry(rule.source.clone()).or_default();
        if destinations.contains_key(&rule.destination) {
            return Err(BrokerError::RoutingRuleAlreadyExists(
                rule.source,
                rule.destination,
            ));
        }
        destinations.insert(rule.destination.clone(), Arc::new(rule));
        Ok(())
    }

    pub fn remove(&self, domain: &str, source: &str, destination: &str) -> Result<(), BrokerError> {
        let missing = || {
            BrokerError::RoutingRuleNotFound(source.to_string(), destination.to_string())
        };
        let mut entry = self.routes.get_mut(domain).ok_or_else(missing)?;
        let destinations = entry.get_mut(source).ok_or_else(missing)?;
        destinations.remove(destination).ok_or_else(missing)?;
        if destinations.is_empty() {
            entry.remove(source);
        }
        Ok(())
    }

    pub fn list(&self, domain: &str, source: Option<&str>) -> Vec<Arc<RoutingRule>> {
        let entry = match self.routes.get(domain) {
            Some(e) => e,
            None => return Vec::new(),
        };
        let mut rules: Vec<Arc<RoutingRule>> = entry
            .iter()
            .filter(|(src, _)| source.map(|s| s == src.as_str()).unwrap_or(true))
            .flat_map(|(_, destinations)| destinations.values().cloned())
            .collect();
        rules.sort_by(|a, b| (&a.source, &a.destination).cmp(&(&b.source, &b.destination)));
        rules
    }

    /// Destinations whose predicate matches `msg`. Rules are cloned out of
    /// the table before evaluation.
    pub fn matches(&self, domain: &str, source: &str, msg: &Message) -> Vec<String> {
        let rules: Vec<Arc<RoutingRule>> = match self.routes.get(domain) {
            Some(entry) => entry
                .get(source)
                .map(|destinations| destinations.values().cloned().collect())
                .unwrap_or_default(),
            None => return Vec::new(),
        };
        let mut matched: Vec<String> = rules
            .into_iter()
            .filter(|rule| rule.predicate.evaluate(msg))
            .map(|rule| rule.destination.clone())
            .collect();
        matched.sort();
        matched
    }

    /// Drop every rule naming `queue` as source or destination. Used by
    /// queue deletion.
    pub fn remove_queue(&self, domain: &str, queue: &str) {
        if let Some(mut entry) = self.routes.get_mut(domain) {
            entry.remove(queue);
            for destinations in entry.values_mut() {
                destinations.remove(queue);
            }
            entry.retain(|_, destinations| !destinations.is_empty());
        }
    }

    pub fn drop_domain(&self, domain: &str) {
        self.routes.remove(domain);
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// TESTS
// ==========================================
