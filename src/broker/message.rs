//! Message model shared by the whole engine.

use std::collections::HashMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::utils_time::current_time_ms;

pub const META_DOMAIN: &str = "domain";
pub const META_QUEUE: &str = "queue";

/// A broker message. `id` is unique within its queue: caller-assigned when
/// non-empty, server-generated otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: Bytes,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Unix ms. Zero means "stamp me at publish time".
    #[serde(default)]
    pub timestamp: u64,
}

impl Message {
    pub fn new(payload: Bytes) -> Self {
        Self {
            id: String::new(),
            payload,
            headers: HashMap::new(),
            metadata: HashMap::new(),
            timestamp: 0,
        }
    }

    pub fn with_id(id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id: id.into(),
            payload,
            headers: HashMap::new(),
            metadata: HashMap::new(),
            timestamp: 0,
        }
    }

    /// Publish-time enrichment: assign an id if the caller did not, stamp the
    /// timestamp if zero, and record the owning (domain, queue) in metadata.
    pub fn enrich(&mut self, domain: &str, queue: &str) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.timestamp == 0 {
            self.timestamp = current_time_ms();
        }
        self.metadata.insert(META_DOMAIN.to_string(), Value::String(domain.to_string()));
        self.metadata.insert(META_QUEUE.to_string(), Value::String(queue.to_string()));
    }

    /// Shallow copy for routing into another queue: same id and payload,
    /// metadata re-stamped by the destination's publish pipeline.
    pub fn routed_copy(&self) -> Self {
        self.clone()
    }

    /// Payload parsed as a JSON field-map. `None` when the payload is not a
    /// JSON object (predicates and schemas treat that as a non-match).
    pub fn field_map(&self) -> Option<serde_json::Map<String, Value>> {
        match serde_json::from_slice::<Value>(&self.payload) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}
