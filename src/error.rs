//! Broker error taxonomy.
//!
//! One enum, grouped by kind: not-found, conflict, validation, concurrency,
//! infrastructure. The facade propagates these with `?`; best-effort side
//! effects (subscription fan-out, routing, background sweeps) log and swallow.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    // --- Not found ---
    DomainNotFound(String),
    QueueNotFound(String, String),
    GroupNotFound(String, String, String),
    MessageNotFound(String),
    RoutingRuleNotFound(String, String),

    // --- Conflict ---
    DomainAlreadyExists(String),
    QueueAlreadyExists(String, String),
    RoutingRuleAlreadyExists(String, String),
    MessageAlreadyExists(String),
    /// singleConsumer queue already has a bound group.
    AlreadyBound(String),

    // --- Validation ---
    InvalidMessage(String),
    InvalidTtl(String),
    InvalidPredicate(String),

    // --- Concurrency ---
    Cancelled,
    Timeout,

    // --- Infrastructure ---
    Storage(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DomainNotFound(d) => write!(f, "domain '{}' not found", d),
            Self::QueueNotFound(d, q) => write!(f, "queue '{}/{}' not found", d, q),
            Self::GroupNotFound(d, q, g) => write!(f, "consumer group '{}' not found on '{}/{}'", g, d, q),
            Self::MessageNotFound(id) => write!(f, "message '{}' not found", id),
            Self::RoutingRuleNotFound(s, t) => write!(f, "routing rule '{}' -> '{}' not found", s, t),
            Self::DomainAlreadyExists(d) => write!(f, "domain '{}' already exists", d),
            Self::QueueAlreadyExists(d, q) => write!(f, "queue '{}/{}' already exists", d, q),
            Self::RoutingRuleAlreadyExists(s, t) => write!(f, "routing rule '{}' -> '{}' already exists", s, t),
            Self::MessageAlreadyExists(id) => write!(f, "message '{}' already stored", id),
            Self::AlreadyBound(q) => write!(f, "queue '{}' is singleConsumer and already has a bound group", q),
            Self::InvalidMessage(msg) => write!(f, "invalid message: {}", msg),
            Self::InvalidTtl(msg) => write!(f, "invalid ttl: {}", msg),
            Self::InvalidPredicate(msg) => write!(f, "invalid predicate: {}", msg),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

impl BrokerError {
    /// True for the not-found family, useful when a miss is a benign race.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DomainNotFound(_)
                | Self::QueueNotFound(_, _)
                | Self::GroupNotFound(_, _, _)
                | Self::MessageNotFound(_)
                | Self::RoutingRuleNotFound(_, _)
        )
    }
}
