//! Collections - named, homogeneous sets of records
//!
//! A [`Collection`] owns the records of one entity type for one refresh,
//! together with the identity definition (manager_ref), the persistence
//! strategies and the indexes the scanner and saver work with.
//!
//! Ownership of the mutable flags is split: the scanner is the only code that
//! finalizes a collection and writes its dependency edges, the saver is the
//! only code that marks it saved and back-fills record ids.

use crate::index::ReferenceIndex;
use crate::record::{IdentityKey, Record};
use crate::saver::{CustomReconciler, CustomSaver};
use crate::value::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

/// Where a collection's records come from and how references into it resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Records come from ingested data
    #[default]
    Default,
    /// Read-only; references are resolved by querying storage per key
    LocalDbFindReferences,
    /// Read-only; all stored rows are loaded into the index once
    LocalDbCacheAll,
    /// Ingested data first, storage query on index miss
    LocalDbFindMissingReferences,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Default => "default",
            Strategy::LocalDbFindReferences => "local_db_find_references",
            Strategy::LocalDbCacheAll => "local_db_cache_all",
            Strategy::LocalDbFindMissingReferences => "local_db_find_missing_references",
        }
    }

    pub fn all() -> &'static [Strategy] {
        &[
            Strategy::Default,
            Strategy::LocalDbFindReferences,
            Strategy::LocalDbCacheAll,
            Strategy::LocalDbFindMissingReferences,
        ]
    }

    /// Read-only collections are never written by the saver
    pub fn is_read_only(&self) -> bool {
        matches!(self, Strategy::LocalDbFindReferences | Strategy::LocalDbCacheAll)
    }

    /// Check if references may fall back to a storage query
    pub fn queries_storage(&self) -> bool {
        matches!(
            self,
            Strategy::LocalDbFindReferences | Strategy::LocalDbFindMissingReferences
        )
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Strategy::all()
            .iter()
            .find(|strategy| strategy.as_str() == s)
            .copied()
            .ok_or_else(|| Error::UnknownStrategy(s.to_string()))
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the saver writes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SaverStrategy {
    /// Row-by-row statements in one transaction per collection
    #[default]
    Default,
    /// Multi-row chunks, one transaction per chunk
    Batch,
    /// Timestamp-guarded atomic upserts, safe for concurrent writers
    ConcurrentSafeBatch,
}

impl SaverStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaverStrategy::Default => "default",
            SaverStrategy::Batch => "batch",
            SaverStrategy::ConcurrentSafeBatch => "concurrent_safe_batch",
        }
    }

    pub fn all() -> &'static [SaverStrategy] {
        &[SaverStrategy::Default, SaverStrategy::Batch, SaverStrategy::ConcurrentSafeBatch]
    }

    /// Check if several workers may write overlapping identities
    pub fn is_parallel_safe(&self) -> bool {
        matches!(self, SaverStrategy::ConcurrentSafeBatch)
    }
}

impl FromStr for SaverStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SaverStrategy::all()
            .iter()
            .find(|strategy| strategy.as_str() == s)
            .copied()
            .ok_or_else(|| Error::UnknownStrategy(s.to_string()))
    }
}

impl std::fmt::Display for SaverStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to stored records that are no longer reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStrategy {
    #[default]
    Destroy,
    Archive,
}

impl RetentionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionStrategy::Destroy => "destroy",
            RetentionStrategy::Archive => "archive",
        }
    }
}

impl FromStr for RetentionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "destroy" => Ok(RetentionStrategy::Destroy),
            "archive" => Ok(RetentionStrategy::Archive),
            _ => Err(Error::UnknownStrategy(s.to_string())),
        }
    }
}

impl std::fmt::Display for RetentionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Default attribute value, fixed or taken from the run-time context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    Fixed(Value),
    Context(String),
}

/// Run-time values available to default attribute computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshContext {
    pub values: BTreeMap<String, Value>,
}

impl RefreshContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

fn default_true() -> bool {
    true
}

/// Per-collection configuration supplied by the builder collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    pub name: String,
    pub manager_ref: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub saver_strategy: SaverStrategy,
    #[serde(default)]
    pub retention_strategy: RetentionStrategy,
    /// Skip updates whose attributes did not change
    #[serde(default = "default_true")]
    pub check_changed: bool,
    /// The incoming dataset is the full truth for this collection
    #[serde(default = "default_true")]
    pub complete: bool,
    /// Declared structural parent collection
    #[serde(default)]
    pub parent: Option<String>,
    /// Attributes whose unresolved reference aborts the record's save
    #[serde(default)]
    pub required_references: BTreeSet<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, DefaultValue>,
}

impl CollectionDefinition {
    pub fn new<I, S>(name: impl Into<String>, manager_ref: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            manager_ref: manager_ref.into_iter().map(Into::into).collect(),
            strategy: Strategy::Default,
            saver_strategy: SaverStrategy::Default,
            retention_strategy: RetentionStrategy::Destroy,
            check_changed: true,
            complete: true,
            parent: None,
            required_references: BTreeSet::new(),
            defaults: BTreeMap::new(),
        }
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn saver_strategy(mut self, strategy: SaverStrategy) -> Self {
        self.saver_strategy = strategy;
        self
    }

    pub fn retention(mut self, strategy: RetentionStrategy) -> Self {
        self.retention_strategy = strategy;
        self
    }

    pub fn check_changed(mut self, enabled: bool) -> Self {
        self.check_changed = enabled;
        self
    }

    pub fn complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn require(mut self, attribute: impl Into<String>) -> Self {
        self.required_references.insert(attribute.into());
        self
    }

    pub fn default_value(mut self, attribute: impl Into<String>, value: DefaultValue) -> Self {
        self.defaults.insert(attribute.into(), value);
        self
    }

    /// Reject malformed identity definitions
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("Collection name must not be empty".to_string()));
        }
        if self.manager_ref.is_empty() {
            return Err(Error::Config(format!("Collection {} has an empty manager_ref", self.name)));
        }
        let unique: BTreeSet<&String> = self.manager_ref.iter().collect();
        if unique.len() != self.manager_ref.len() {
            return Err(Error::Config(format!(
                "Collection {} repeats an attribute in its manager_ref",
                self.name
            )));
        }
        if self.manager_ref.iter().any(|attr| attr.trim().is_empty()) {
            return Err(Error::Config(format!(
                "Collection {} has a blank manager_ref attribute",
                self.name
            )));
        }
        Ok(())
    }
}

/// Position of a record inside its collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Full(usize),
    Skeletal(IdentityKey),
}

/// Which stored identities a save may delete or archive.
#[derive(Debug, Clone, Copy)]
pub enum DeletionScope<'a> {
    /// Nothing may be deleted
    None,
    /// Every stored identity absent from the incoming data
    AllAbsent,
    /// Every stored identity outside the authoritative set
    Authoritative(&'a BTreeSet<IdentityKey>),
    /// Absent identities inside the targeted scope only
    Targeted(&'a BTreeSet<IdentityKey>),
}

impl DeletionScope<'_> {
    pub fn allows(&self, identity: &IdentityKey) -> bool {
        match self {
            DeletionScope::None => false,
            DeletionScope::AllAbsent => true,
            DeletionScope::Authoritative(known) => !known.contains(identity),
            DeletionScope::Targeted(scope) => scope.contains(identity),
        }
    }
}

/// A named, homogeneous set of records.
pub struct Collection {
    definition: CollectionDefinition,
    defaults: BTreeMap<String, Value>,
    records: Vec<Record>,
    primary_index: HashMap<IdentityKey, usize>,
    skeletal_index: BTreeMap<IdentityKey, Record>,
    targeted_scope: Option<BTreeSet<IdentityKey>>,
    all_known_identities: Option<BTreeSet<IdentityKey>>,
    pub(crate) dependency_attributes: BTreeMap<String, BTreeSet<String>>,
    pub(crate) transitive_attributes: BTreeSet<String>,
    pub(crate) dependees: BTreeSet<String>,
    pub(crate) parent_collections: BTreeSet<String>,
    pub(crate) ancestor_dependencies: BTreeSet<String>,
    pub(crate) reference_index: ReferenceIndex,
    finalized: bool,
    saved: bool,
    custom_saver: Option<Arc<dyn CustomSaver>>,
    custom_reconciler: Option<Arc<dyn CustomReconciler>>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.definition.name)
            .field("records", &self.records.len())
            .field("skeletal", &self.skeletal_index.len())
            .field("targeted", &self.is_targeted())
            .field("finalized", &self.finalized)
            .field("saved", &self.saved)
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Create a collection with an empty run-time context
    pub fn new(definition: CollectionDefinition) -> Result<Self> {
        Self::with_context(definition, &RefreshContext::default())
    }

    /// Create a collection, computing default values from the context
    pub fn with_context(definition: CollectionDefinition, context: &RefreshContext) -> Result<Self> {
        definition.validate()?;

        let mut defaults = BTreeMap::new();
        for (attr, default) in &definition.defaults {
            let value = match default {
                DefaultValue::Fixed(value) => value.clone(),
                DefaultValue::Context(key) => context.values.get(key).cloned().ok_or_else(|| {
                    Error::Config(format!(
                        "Collection {} needs context value {} for default {}",
                        definition.name, key, attr
                    ))
                })?,
            };
            defaults.insert(attr.clone(), value);
        }

        Ok(Self {
            definition,
            defaults,
            records: Vec::new(),
            primary_index: HashMap::new(),
            skeletal_index: BTreeMap::new(),
            targeted_scope: None,
            all_known_identities: None,
            dependency_attributes: BTreeMap::new(),
            transitive_attributes: BTreeSet::new(),
            dependees: BTreeSet::new(),
            parent_collections: BTreeSet::new(),
            ancestor_dependencies: BTreeSet::new(),
            reference_index: ReferenceIndex::default(),
            finalized: false,
            saved: false,
            custom_saver: None,
            custom_reconciler: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &CollectionDefinition {
        &self.definition
    }

    pub fn manager_ref(&self) -> &[String] {
        &self.definition.manager_ref
    }

    /// Add a full record. Fails once the collection is finalized.
    pub fn push(&mut self, record: Record) -> Result<IdentityKey> {
        self.ensure_mutable()?;
        let record = self.apply_defaults(record);
        let identity = record.identity(&self.definition.manager_ref)?;
        if self.primary_index.contains_key(&identity) {
            return Err(Error::DuplicateIdentity {
                collection: self.name().to_string(),
                identity: identity.to_string(),
            });
        }
        // A full record supersedes a skeletal one with the same identity
        self.skeletal_index.remove(&identity);
        self.primary_index.insert(identity.clone(), self.records.len());
        self.records.push(record);
        Ok(identity)
    }

    /// Add a skeletal (partial) record; ignored when a full record exists
    pub fn push_skeletal(&mut self, record: Record) -> Result<IdentityKey> {
        self.ensure_mutable()?;
        let identity = record.identity(&self.definition.manager_ref)?;
        if !self.primary_index.contains_key(&identity) {
            self.skeletal_index
                .entry(identity.clone())
                .and_modify(|existing| existing.attributes.extend(record.attributes.clone()))
                .or_insert(record);
        }
        Ok(identity)
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized(self.name().to_string()));
        }
        Ok(())
    }

    fn apply_defaults(&self, mut record: Record) -> Record {
        for (attr, value) in &self.defaults {
            record.attributes.entry(attr.clone()).or_insert_with(|| value.clone());
        }
        record
    }

    /// Restrict this refresh to an explicit identity scope
    pub fn target<I: IntoIterator<Item = IdentityKey>>(&mut self, scope: I) -> Result<()> {
        self.ensure_mutable()?;
        self.targeted_scope.get_or_insert_with(BTreeSet::new).extend(scope);
        Ok(())
    }

    /// Provide the full authoritative identity set for this collection
    pub fn set_all_known_identities<I: IntoIterator<Item = IdentityKey>>(&mut self, identities: I) -> Result<()> {
        self.ensure_mutable()?;
        self.all_known_identities = Some(identities.into_iter().collect());
        Ok(())
    }

    pub fn with_custom_saver(mut self, saver: Arc<dyn CustomSaver>) -> Self {
        self.custom_saver = Some(saver);
        self
    }

    pub fn with_custom_reconciler(mut self, reconciler: Arc<dyn CustomReconciler>) -> Self {
        self.custom_reconciler = Some(reconciler);
        self
    }

    pub fn custom_saver(&self) -> Option<Arc<dyn CustomSaver>> {
        self.custom_saver.clone()
    }

    pub fn custom_reconciler(&self) -> Option<Arc<dyn CustomReconciler>> {
        self.custom_reconciler.clone()
    }

    pub fn is_targeted(&self) -> bool {
        self.targeted_scope.is_some()
    }

    pub fn targeted_scope(&self) -> Option<&BTreeSet<IdentityKey>> {
        self.targeted_scope.as_ref()
    }

    pub fn all_known_identities(&self) -> Option<&BTreeSet<IdentityKey>> {
        self.all_known_identities.as_ref()
    }

    /// Which stored identities this collection's save may remove
    pub fn deletion_scope(&self) -> DeletionScope<'_> {
        match (&self.targeted_scope, &self.all_known_identities) {
            (_, Some(known)) => DeletionScope::Authoritative(known),
            (Some(scope), None) => DeletionScope::Targeted(scope),
            (None, None) if self.definition.complete => DeletionScope::AllAbsent,
            (None, None) => DeletionScope::None,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn skeletal_records(&self) -> impl Iterator<Item = (&IdentityKey, &Record)> {
        self.skeletal_index.iter()
    }

    /// Full records followed by skeletal ones, with their slots
    pub fn entries(&self) -> Vec<(Slot, &Record, bool)> {
        let full = self
            .records
            .iter()
            .enumerate()
            .map(|(i, record)| (Slot::Full(i), record, false));
        let skeletal = self
            .skeletal_index
            .iter()
            .map(|(key, record)| (Slot::Skeletal(key.clone()), record, true));
        full.chain(skeletal).collect()
    }

    pub(crate) fn record_mut(&mut self, slot: &Slot) -> Option<&mut Record> {
        match slot {
            Slot::Full(i) => self.records.get_mut(*i),
            Slot::Skeletal(key) => self.skeletal_index.get_mut(key),
        }
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.iter_mut().chain(self.skeletal_index.values_mut())
    }

    /// Find a record by identity, full or skeletal
    pub fn find(&self, identity: &IdentityKey) -> Option<&Record> {
        self.primary_index
            .get(identity)
            .and_then(|&i| self.records.get(i))
            .or_else(|| self.skeletal_index.get(identity))
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.skeletal_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collections this one must be saved after
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.dependency_attributes
            .values()
            .flatten()
            .chain(self.ancestor_dependencies.iter())
            .filter(|name| name.as_str() != self.name())
            .cloned()
            .collect()
    }

    pub fn dependency_attributes(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.dependency_attributes
    }

    pub fn transitive_attributes(&self) -> &BTreeSet<String> {
        &self.transitive_attributes
    }

    pub fn dependees(&self) -> &BTreeSet<String> {
        &self.dependees
    }

    pub fn parent_collections(&self) -> &BTreeSet<String> {
        &self.parent_collections
    }

    pub fn reference_index(&self) -> &ReferenceIndex {
        &self.reference_index
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub(crate) fn mark_saved(&mut self) {
        self.saved = true;
    }
}

/// All collections of one refresh, ordered by name.
#[derive(Debug, Default)]
pub struct CollectionSet {
    collections: BTreeMap<String, Collection>,
}

impl CollectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection; names must be unique
    pub fn insert(&mut self, collection: Collection) -> Result<()> {
        let name = collection.name().to_string();
        if self.collections.contains_key(&name) {
            return Err(Error::Config(format!("Collection {} is defined twice", name)));
        }
        self.collections.insert(name, collection);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Collection> {
        self.collections.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Collection> {
        self.collections.values_mut()
    }

    pub(crate) fn take(&mut self, name: &str) -> Option<Collection> {
        self.collections.remove(name)
    }

    pub(crate) fn restore(&mut self, collection: Collection) {
        self.collections.insert(collection.name().to_string(), collection);
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vms() -> Collection {
        Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap()
    }

    #[test]
    fn test_strategy_names_roundtrip() {
        for strategy in Strategy::all() {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), *strategy);
        }
        for strategy in SaverStrategy::all() {
            assert_eq!(strategy.as_str().parse::<SaverStrategy>().unwrap(), *strategy);
        }
        assert!(matches!(
            "local_db_everything".parse::<Strategy>(),
            Err(Error::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let mut vms = vms();
        vms.push(Record::new().with("ems_ref", "vm-1")).unwrap();
        let err = vms.push(Record::new().with("ems_ref", "vm-1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity { .. }));
    }

    #[test]
    fn test_finalized_collection_is_immutable() {
        let mut vms = vms();
        vms.finalize();
        assert!(matches!(
            vms.push(Record::new().with("ems_ref", "vm-1")),
            Err(Error::Finalized(_))
        ));
    }

    #[test]
    fn test_malformed_definitions() {
        assert!(Collection::new(CollectionDefinition::new("vms", Vec::<String>::new())).is_err());
        assert!(Collection::new(CollectionDefinition::new("vms", ["a", "a"])).is_err());
        assert!(Collection::new(CollectionDefinition::new("", ["a"])).is_err());
    }

    #[test]
    fn test_defaults_from_context() {
        let definition = CollectionDefinition::new("vms", ["ems_ref"])
            .default_value("ems_id", DefaultValue::Context("ems_id".to_string()))
            .default_value("type", DefaultValue::Fixed(Value::from("Vm")));
        let context = RefreshContext::new().with("ems_id", 3i64);
        let mut vms = Collection::with_context(definition.clone(), &context).unwrap();

        let key = vms.push(Record::new().with("ems_ref", "vm-1").with("type", "Template")).unwrap();
        let record = vms.find(&key).unwrap();
        assert_eq!(record.get("ems_id"), Some(&Value::Int(3)));
        assert_eq!(record.get("type"), Some(&Value::from("Template")));

        assert!(Collection::new(definition).is_err());
    }

    #[test]
    fn test_skeletal_records_yield_to_full_records() {
        let mut vms = vms();
        vms.push_skeletal(Record::new().with("ems_ref", "vm-1").with("name", "old")).unwrap();
        vms.push_skeletal(Record::new().with("ems_ref", "vm-2")).unwrap();
        vms.push(Record::new().with("ems_ref", "vm-1").with("name", "new")).unwrap();

        assert_eq!(vms.records().len(), 1);
        assert_eq!(vms.skeletal_records().count(), 1);
        assert_eq!(vms.len(), 2);
    }

    #[test]
    fn test_deletion_scope() {
        let a = IdentityKey::new(["a"]);
        let b = IdentityKey::new(["b"]);

        let mut complete = vms();
        assert!(complete.deletion_scope().allows(&b));

        complete.target([a.clone()]).unwrap();
        assert!(complete.deletion_scope().allows(&a));
        assert!(!complete.deletion_scope().allows(&b));

        complete.set_all_known_identities([a.clone()]).unwrap();
        assert!(!complete.deletion_scope().allows(&a));
        assert!(complete.deletion_scope().allows(&b));

        let partial = Collection::new(CollectionDefinition::new("vms", ["ems_ref"]).complete(false)).unwrap();
        assert!(!partial.deletion_scope().allows(&b));
    }
}
