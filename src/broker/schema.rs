//! Optional per-domain payload validation.
//!
//! Two shapes: a declarative field-type map checked against the payload
//! parsed as a JSON object, or a custom predicate over the raw bytes.
//! A domain without a schema accepts everything.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Clone)]
pub enum Schema {
    /// Every declared field must be present with the declared JSON type.
    Fields(HashMap<String, FieldType>),
    /// Custom predicate over the raw payload bytes.
    Custom(Arc<dyn Fn(&Bytes) -> bool + Send + Sync>),
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Schema {
    pub fn fields(fields: HashMap<String, FieldType>) -> Self {
        Self::Fields(fields)
    }

    pub fn custom(check: impl Fn(&Bytes) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(check))
    }

    pub fn validate(&self, payload: &Bytes) -> Result<(), BrokerError> {
        match self {
            Self::Custom(check) => {
                if check(payload) {
                    Ok(())
                } else {
                    Err(BrokerError::InvalidMessage("payload rejected by domain schema".into()))
                }
            }
            Self::Fields(fields) => {
                let map = match serde_json::from_slice::<Value>(payload) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => {
                        return Err(BrokerError::InvalidMessage("payload is not a JSON object".into()))
                    }
                    Err(e) => {
                        return Err(BrokerError::InvalidMessage(format!("unparseable payload: {}", e)))
                    }
                };
                for (field, expected) in fields {
                    match map.get(field) {
                        Some(value) if expected.matches(value) => {}
                        Some(_) => {
                            return Err(BrokerError::InvalidMessage(format!(
                                "field '{}' has the wrong type (expected {:?})",
                                field, expected
                            )))
                        }
                        None => {
                            return Err(BrokerError::InvalidMessage(format!(
                                "missing required field '{}'",
                                field
                            )))
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

// ==========================================
// TESTS
// ==========================================
