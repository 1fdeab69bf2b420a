//! Attribute values and lazy references
//!
//! Every attribute of a record is a [`Value`]. Cross-record links are
//! expressed as a [`Reference`], which is either still unresolved (a
//! [`LazyRef`] naming the target collection and a lookup key) or resolved to
//! a storage identifier. Resolution is always an explicit step performed by
//! the saver, never implicit.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Storage identifier assigned to a persisted record.
pub type RecordId = i64;

/// How a lazy reference participates in scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// The target collection must be saved before the referencing one
    #[default]
    Dependency,
    /// Resolved opportunistically; never forces ordering
    Transitive,
}

impl ResolutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMode::Dependency => "dependency",
            ResolutionMode::Transitive => "transitive",
        }
    }

    pub fn all() -> &'static [ResolutionMode] {
        &[ResolutionMode::Dependency, ResolutionMode::Transitive]
    }

    /// Check if this mode adds a scheduling edge
    pub fn is_ordering(&self) -> bool {
        matches!(self, ResolutionMode::Dependency)
    }
}

impl FromStr for ResolutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dependency" | "dep" => Ok(ResolutionMode::Dependency),
            "transitive" => Ok(ResolutionMode::Transitive),
            _ => Err(Error::Config(format!("Unknown resolution mode: {}", s))),
        }
    }
}

impl std::fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A deferred lookup of a record in another collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyRef {
    /// Name of the collection holding the target record
    pub collection: String,
    /// Lookup attributes and the values they must match
    pub key: BTreeMap<String, Value>,
    #[serde(default)]
    pub mode: ResolutionMode,
}

impl LazyRef {
    /// Create a dependency reference
    pub fn new(collection: impl Into<String>, key: BTreeMap<String, Value>) -> Self {
        Self {
            collection: collection.into(),
            key,
            mode: ResolutionMode::Dependency,
        }
    }

    /// Create a dependency reference looked up by a single attribute
    pub fn by(collection: impl Into<String>, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut key = BTreeMap::new();
        key.insert(attribute.into(), value.into());
        Self::new(collection, key)
    }

    /// Switch the reference to transitive mode
    pub fn transitive(mut self) -> Self {
        self.mode = ResolutionMode::Transitive;
        self
    }

    /// Lookup attribute names, sorted
    pub fn lookup_attributes(&self) -> Vec<String> {
        self.key.keys().cloned().collect()
    }

    /// Human readable form used in diagnostics
    pub fn describe(&self) -> String {
        let parts: Vec<String> = self
            .key
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.identity_fragment()))
            .collect();
        format!("{}[{}]", self.collection, parts.join(","))
    }
}

/// Two-state reference value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Reference {
    Unresolved(LazyRef),
    Resolved { id: RecordId },
}

impl Reference {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Reference::Resolved { .. })
    }
}

/// A loosely-typed attribute value.
///
/// Serialized untagged so transfer payloads stay plain JSON; references are
/// wrapped in a `{"$ref": ...}` envelope to keep them apart from nested maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Ref(#[serde(with = "ref_envelope")] Reference),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

mod ref_envelope {
    use super::Reference;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct Outgoing<'a> {
        #[serde(rename = "$ref")]
        reference: &'a Reference,
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Incoming {
        #[serde(rename = "$ref")]
        reference: Reference,
    }

    pub fn serialize<S: Serializer>(reference: &Reference, serializer: S) -> Result<S::Ok, S::Error> {
        Outgoing { reference }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Reference, D::Error> {
        Incoming::deserialize(deserializer).map(|incoming| incoming.reference)
    }
}

impl Value {
    /// Build an unresolved dependency reference value
    pub fn lazy(reference: LazyRef) -> Self {
        Value::Ref(Reference::Unresolved(reference))
    }

    /// Build a resolved reference value
    pub fn resolved(id: RecordId) -> Self {
        Value::Ref(Reference::Resolved { id })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if any unresolved reference is reachable from this value
    pub fn has_references(&self) -> bool {
        match self {
            Value::Ref(Reference::Unresolved(_)) => true,
            Value::List(items) => items.iter().any(Value::has_references),
            Value::Map(map) => map.values().any(Value::has_references),
            _ => false,
        }
    }

    /// Collect every unresolved reference reachable from this value
    pub fn references(&self) -> Vec<&LazyRef> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a LazyRef>) {
        match self {
            Value::Ref(Reference::Unresolved(lazy)) => found.push(lazy),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Value::Map(map) => map.values().for_each(|v| v.collect_references(found)),
            _ => {}
        }
    }

    /// Plain JSON form, if the value holds no unresolved reference
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Ref(Reference::Resolved { id }) => serde_json::Value::from(*id),
            Value::Ref(Reference::Unresolved(_)) => return None,
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect::<Option<Vec<_>>>()?)
            }
            Value::Map(map) => {
                let mut object = serde_json::Map::new();
                for (k, v) in map {
                    object.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(object)
            }
        })
    }

    /// Canonical string used as one component of an identity key.
    ///
    /// Values compare as text: `Int(1)` and `Text("1")` share a fragment.
    /// Resolved references collapse to their id so a key built from stored
    /// JSON and a key built from in-memory values agree.
    pub fn identity_fragment(&self) -> String {
        match self {
            Value::Ref(Reference::Unresolved(lazy)) => format!("ref:{}", lazy.describe()),
            other => match other.to_json() {
                Some(json) => json_fragment(&json),
                None => String::new(),
            },
        }
    }
}

/// Canonical identity fragment of a stored JSON value
pub fn json_fragment(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<LazyRef> for Value {
    fn from(reference: LazyRef) -> Self {
        Value::lazy(reference)
    }
}
