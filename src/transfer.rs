//! Serialized form of collections
//!
//! Collectors hand a refresh part over as JSON: one payload per collection
//! carrying its records, skeletal records and scope markers, plus the
//! definitions needed to rebuild the collections on the persisting side.

use crate::collection::{Collection, CollectionDefinition, RefreshContext};
use crate::record::{IdentityKey, Record};
use crate::value::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionPayload {
    pub name: String,
    /// Targeted scope; empty for a full refresh
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manager_uuids: Vec<IdentityKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_manager_uuids: Option<Vec<IdentityKey>>,
    #[serde(default)]
    pub data: Vec<Attributes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_data: Vec<Attributes>,
}

impl Collection {
    pub fn to_payload(&self) -> CollectionPayload {
        CollectionPayload {
            name: self.name().to_string(),
            manager_uuids: self
                .targeted_scope()
                .map(|scope| scope.iter().cloned().collect())
                .unwrap_or_default(),
            all_manager_uuids: self.all_known_identities().map(|all| all.iter().cloned().collect()),
            data: self.records().iter().map(|r| r.attributes.clone()).collect(),
            partial_data: self.skeletal_records().map(|(_, r)| r.attributes.clone()).collect(),
        }
    }

    /// Rebuild a collection; `context` fills context-sourced defaults
    pub fn from_payload(
        definition: CollectionDefinition,
        payload: CollectionPayload,
        context: &RefreshContext,
    ) -> Result<Self> {
        if payload.name != definition.name {
            return Err(Error::Config(format!(
                "Payload {} does not match collection definition {}",
                payload.name, definition.name
            )));
        }
        let mut collection = Collection::with_context(definition, context)?;
        if !payload.manager_uuids.is_empty() {
            collection.target(payload.manager_uuids)?;
        }
        if let Some(all) = payload.all_manager_uuids {
            collection.set_all_known_identities(all)?;
        }
        for attributes in payload.data {
            collection.push(Record::from_attributes(attributes))?;
        }
        for attributes in payload.partial_data {
            collection.push_skeletal(Record::from_attributes(attributes))?;
        }
        Ok(collection)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub definition: CollectionDefinition,
    pub payload: CollectionPayload,
}

/// One refresh part as written by a collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshPayload {
    #[serde(default)]
    pub context: RefreshContext,
    pub collections: Vec<CollectionEntry>,
}

impl RefreshPayload {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build the collections of this payload
    pub fn into_collections(self) -> Result<Vec<Collection>> {
        let context = self.context;
        self.collections
            .into_iter()
            .map(|entry| Collection::from_payload(entry.definition, entry.payload, &context))
            .collect()
    }
}
