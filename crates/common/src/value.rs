//! Value codec and resource shapes.
//!
//! Service payloads carry tagged values: an object of exactly
//! `{"rid": "..."}` is a reference to another resource, an object of
//! exactly `{"action": "delete"}` is the delete marker used in change
//! values, and anything else is an opaque primitive.

use std::collections::HashMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single value inside a model or collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Any plain JSON value.
    Primitive(serde_json::Value),
    /// A reference to another resource by RID.
    Reference(String),
    /// The delete marker. Only legal inside change-event values.
    Delete,
}

impl Value {
    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Reference(_))
    }

    /// The referenced RID, if this value is a reference.
    pub fn rid(&self) -> Option<&str> {
        match self {
            Value::Reference(rid) => Some(rid),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Primitive(v) => v.serialize(serializer),
            Value::Reference(rid) => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert("rid".to_string(), serde_json::Value::String(rid.clone()));
                serde_json::Value::Object(map).serialize(serializer)
            }
            Value::Delete => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert("action".to_string(), serde_json::Value::String("delete".to_string()));
                serde_json::Value::Object(map).serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        if let serde_json::Value::Object(map) = &raw {
            if map.len() == 1 {
                match map.iter().next() {
                    Some((k, serde_json::Value::String(s))) if k == "rid" => {
                        if s.is_empty() {
                            return Err(D::Error::custom("empty rid in resource reference"));
                        }
                        return Ok(Value::Reference(s.clone()));
                    }
                    Some((k, serde_json::Value::String(s))) if k == "action" && s == "delete" => {
                        return Ok(Value::Delete);
                    }
                    _ => {}
                }
            }
        }
        Ok(Value::Primitive(raw))
    }
}

/// The type of a cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Model,
    Collection,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Model => f.write_str("model"),
            ResourceType::Collection => f.write_str("collection"),
        }
    }
}

/// A key-value resource. Key order is informational; equality is by
/// key set and per-key value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Model {
    pub values: HashMap<String, Value>,
}

/// An ordered sequence resource.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection {
    pub values: Vec<Value>,
}

/// A cached resource of either type.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Model(Model),
    Collection(Collection),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Model(_) => ResourceType::Model,
            Resource::Collection(_) => ResourceType::Collection,
        }
    }

    pub fn as_model(&self) -> Option<&Model> {
        match self {
            Resource::Model(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Resource::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// All resource references held by this resource.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Resource::Model(m) => m.values.values().filter_map(Value::rid).collect(),
            Resource::Collection(c) => c.values.iter().filter_map(Value::rid).collect(),
        }
    }
}
