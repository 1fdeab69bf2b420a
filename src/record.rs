//! Records and identity keys
//!
//! A [`Record`] is one not-yet-saved entity: an attribute bag plus, once
//! saved, its storage identifier. Records are identified inside their
//! collection by an [`IdentityKey`] built from the collection's manager_ref.

use crate::value::{LazyRef, RecordId, Value};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Ordered identity fragments, one per identity attribute.
///
/// Fragments are the text form of each value, so `1` and `"1"` name the same
/// record. Stored JSON and in-memory values of the same record may differ in
/// type (a resolved reference is an id number in storage), and comparing as
/// text keeps both sides agreeing. Null identity values are rejected by
/// [`Record::identity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(pub Vec<String>);

impl IdentityKey {
    /// Build a key from raw fragments
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fragments.into_iter().map(Into::into).collect())
    }

    /// Build a key from attribute values, `None` when an attribute is missing
    pub fn from_values(attributes: &[String], values: &BTreeMap<String, Value>) -> Option<Self> {
        attributes
            .iter()
            .map(|attr| values.get(attr).map(Value::identity_fragment))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Build a key from a stored JSON attribute object
    pub fn from_json(attributes: &[String], values: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        attributes
            .iter()
            .map(|attr| values.get(attr).map(crate::value::json_fragment))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    /// Encoding used in the `identity` column
    pub fn to_storage_string(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Parse the `identity` column back into a key
    pub fn parse_storage(s: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(s)?))
    }

    pub fn fragments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// One not-yet-saved entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    pub attributes: BTreeMap<String, Value>,
    /// Storage identifier, set once the record is saved
    #[serde(skip)]
    pub id: Option<RecordId>,
    /// Attributes left for the deferred pass
    #[serde(skip)]
    pub(crate) pending: BTreeSet<String>,
    /// Stored values of pending attributes, as found when the record was saved
    #[serde(skip)]
    pub(crate) pending_baseline: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from an attribute map
    pub fn from_attributes(attributes: BTreeMap<String, Value>) -> Self {
        Self {
            attributes,
            ..Self::default()
        }
    }

    /// Set an attribute (builder style)
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(attribute.into(), value.into());
    }

    /// Identity of this record under the given manager_ref.
    ///
    /// Identity attributes must be present and non-null.
    pub fn identity(&self, manager_ref: &[String]) -> Result<IdentityKey> {
        let nulls: Vec<&str> = manager_ref
            .iter()
            .filter(|attr| self.attributes.get(*attr).is_some_and(Value::is_null))
            .map(String::as_str)
            .collect();
        if !nulls.is_empty() {
            return Err(Error::Config(format!("Record has null identity attributes: {}", nulls.join(", "))));
        }
        IdentityKey::from_values(manager_ref, &self.attributes).ok_or_else(|| {
            let missing: Vec<&str> = manager_ref
                .iter()
                .filter(|attr| !self.attributes.contains_key(*attr))
                .map(String::as_str)
                .collect();
            Error::Config(format!("Record is missing identity attributes: {}", missing.join(", ")))
        })
    }

    /// Every unresolved reference, paired with the top-level attribute holding it
    pub fn references(&self) -> Vec<(&str, &LazyRef)> {
        self.attributes
            .iter()
            .flat_map(|(attr, value)| value.references().into_iter().map(move |r| (attr.as_str(), r)))
            .collect()
    }

    /// Attributes still waiting for the deferred pass
    pub fn pending_attributes(&self) -> &BTreeSet<String> {
        &self.pending
    }
}

impl From<BTreeMap<String, Value>> for Record {
    fn from(attributes: BTreeMap<String, Value>) -> Self {
        Self::from_attributes(attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_follows_manager_ref_order() {
        let record = Record::new().with("ems_ref", "vm-1").with("name", "web");
        let key = record.identity(&["name".to_string(), "ems_ref".to_string()]).unwrap();
        assert_eq!(key, IdentityKey::new(["web", "vm-1"]));
    }

    #[test]
    fn test_missing_identity_attribute() {
        let record = Record::new().with("name", "web");
        let err = record.identity(&["ems_ref".to_string()]).unwrap_err();
        assert!(err.to_string().contains("ems_ref"));
    }

    #[test]
    fn test_null_identity_attribute_is_rejected() {
        let record = Record::new().with("ems_ref", Value::Null);
        let err = record.identity(&["ems_ref".to_string()]).unwrap_err();
        assert!(err.to_string().contains("null identity"));

        let blank = Record::new().with("ems_ref", "");
        assert_eq!(blank.identity(&["ems_ref".to_string()]).unwrap(), IdentityKey::new([""]));
    }

    #[test]
    fn test_identity_values_compare_as_text() {
        let attrs = vec!["ems_ref".to_string()];
        let numeric = Record::new().with("ems_ref", 1i64).identity(&attrs).unwrap();
        let text = Record::new().with("ems_ref", "1").identity(&attrs).unwrap();
        assert_eq!(numeric, text);
    }

    #[test]
    fn test_storage_string_roundtrip() {
        let key = IdentityKey::new(["a/b", "c"]);
        let parsed = IdentityKey::parse_storage(&key.to_storage_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_json_and_value_keys_agree() {
        let record = Record::new().with("host", Value::resolved(12)).with("name", "web");
        let attrs = vec!["host".to_string(), "name".to_string()];
        let json = serde_json::json!({"host": 12, "name": "web"});

        let from_values = IdentityKey::from_values(&attrs, &record.attributes).unwrap();
        let from_json = IdentityKey::from_json(&attrs, json.as_object().unwrap()).unwrap();
        assert_eq!(from_values, from_json);
    }

    #[test]
    fn test_references_report_owning_attribute() {
        let record = Record::new()
            .with("name", "disk0")
            .with("hardware", LazyRef::by("hardwares", "vm_ref", "vm-1"));
        let refs = record.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "hardware");
        assert_eq!(refs[0].1.collection, "hardwares");
    }
}
