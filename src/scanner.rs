//! Dependency scanner
//!
//! Walks every record of every collection once, turning lazy references
//! into attribute-tagged dependency edges, transitive attribute marks and
//! reference-index entries on the target collection. Scanning finalizes
//! the collections it visits.

use crate::collection::{Collection, CollectionSet};
use crate::index::Referrer;
use crate::value::{LazyRef, Reference, ResolutionMode, Value};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// A reference whose target collection is not part of the refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnconnectedReference {
    pub collection: String,
    pub attribute: String,
    pub target: String,
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Collections scanned by this call
    pub scanned: usize,
    /// Distinct (collection, attribute, target) dependency edges added
    pub edges: usize,
    pub unconnected: Vec<UnconnectedReference>,
    /// Parents inferred from identity references
    pub inferred_parents: BTreeMap<String, String>,
}

/// What scanning one collection found, applied after all collections are read.
#[derive(Default)]
struct Findings {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    transitive: BTreeSet<String>,
    registrations: Vec<(String, LazyRef, Referrer)>,
    unconnected: Vec<UnconnectedReference>,
    parent: Option<String>,
    inferred: bool,
}

pub struct DependencyScanner;

impl DependencyScanner {
    /// Scan all not-yet-finalized collections and finalize them
    pub fn scan(collections: &mut CollectionSet) -> Result<ScanReport> {
        let names = collections.names();
        let mut report = ScanReport::default();
        let mut findings: BTreeMap<String, Findings> = BTreeMap::new();

        for collection in collections.iter().filter(|c| !c.is_finalized()) {
            let found = Self::scan_collection(collection, &names)?;
            debug!(
                collection = collection.name(),
                dependencies = found.dependencies.len(),
                transitive = found.transitive.len(),
                "Scanned collection"
            );
            findings.insert(collection.name().to_string(), found);
        }

        for (name, found) in &mut findings {
            for (target, reference, referrer) in found.registrations.drain(..) {
                if let Some(target_collection) = collections.get_mut(&target) {
                    target_collection.reference_index.register(&reference, referrer);
                    if reference.mode.is_ordering() && target != *name {
                        target_collection.dependees.insert(name.clone());
                    }
                }
            }
        }

        for (name, found) in findings {
            let Some(collection) = collections.get_mut(&name) else {
                continue;
            };
            for (attr, targets) in found.dependencies {
                let entry = collection.dependency_attributes.entry(attr).or_default();
                for target in targets {
                    if entry.insert(target) {
                        report.edges += 1;
                    }
                }
            }
            collection.transitive_attributes.extend(found.transitive);
            if let Some(parent) = found.parent {
                if found.inferred {
                    report.inferred_parents.insert(name.clone(), parent.clone());
                }
                collection.parent_collections.insert(parent);
            }
            report.unconnected.extend(found.unconnected);
            report.scanned += 1;
        }

        Self::add_ancestor_edges(collections);

        for collection in collections.iter_mut() {
            collection.finalize();
        }

        Ok(report)
    }

    fn scan_collection(collection: &Collection, names: &BTreeSet<String>) -> Result<Findings> {
        let mut found = Findings::default();
        let name = collection.name();

        for (_, record, _) in collection.entries() {
            let identity = record.identity(collection.manager_ref())?;
            for (attr, top) in record.references() {
                let mut chain = Vec::new();
                collect_nested(top, &mut chain);
                for reference in chain {
                    if !names.contains(&reference.collection) {
                        if collection.is_targeted() {
                            return Err(Error::MissingDependency {
                                collection: name.to_string(),
                                target: reference.collection.clone(),
                                attribute: attr.to_string(),
                            });
                        }
                        warn!(
                            collection = name,
                            attribute = attr,
                            target = %reference.collection,
                            "Reference to unknown collection left unconnected"
                        );
                        let unconnected = UnconnectedReference {
                            collection: name.to_string(),
                            attribute: attr.to_string(),
                            target: reference.collection.clone(),
                        };
                        if !found.unconnected.contains(&unconnected) {
                            found.unconnected.push(unconnected);
                        }
                        continue;
                    }

                    match reference.mode {
                        ResolutionMode::Dependency => {
                            found
                                .dependencies
                                .entry(attr.to_string())
                                .or_default()
                                .insert(reference.collection.clone());
                        }
                        ResolutionMode::Transitive => {
                            found.transitive.insert(attr.to_string());
                        }
                    }
                    found.registrations.push((
                        reference.collection.clone(),
                        reference.clone(),
                        Referrer {
                            collection: name.to_string(),
                            attribute: attr.to_string(),
                            identity: identity.clone(),
                        },
                    ));
                }
            }
        }

        match &collection.definition().parent {
            Some(parent) if names.contains(parent) => found.parent = Some(parent.clone()),
            Some(parent) if collection.is_targeted() => {
                return Err(Error::MissingDependency {
                    collection: name.to_string(),
                    target: parent.clone(),
                    attribute: "parent".to_string(),
                });
            }
            Some(parent) => warn!(collection = name, parent = %parent, "Declared parent is not part of the refresh"),
            None => {
                found.parent = infer_parent(collection);
                found.inferred = found.parent.is_some();
            }
        }

        Ok(found)
    }

    /// Targeted collections depend on the root of their parent chain
    fn add_ancestor_edges(collections: &mut CollectionSet) {
        let parents: BTreeMap<String, String> = collections
            .iter()
            .filter_map(|c| {
                c.parent_collections()
                    .iter()
                    .next()
                    .map(|p| (c.name().to_string(), p.clone()))
            })
            .collect();

        for collection in collections.iter_mut().filter(|c| c.is_targeted() && !c.is_finalized()) {
            let mut seen = BTreeSet::from([collection.name().to_string()]);
            let mut root = None;
            let mut current = collection.name().to_string();
            while let Some(parent) = parents.get(&current) {
                if !seen.insert(parent.clone()) {
                    break;
                }
                root = Some(parent.clone());
                current = parent.clone();
            }
            if let Some(root) = root {
                debug!(collection = collection.name(), ancestor = %root, "Ancestor edge");
                collection.ancestor_dependencies.insert(root);
            }
        }
    }
}

/// A reference plus every reference nested inside its lookup key
fn collect_nested<'a>(reference: &'a LazyRef, out: &mut Vec<&'a LazyRef>) {
    out.push(reference);
    for value in reference.key.values() {
        for nested in value.references() {
            collect_nested(nested, out);
        }
    }
}

/// Single collection referenced by the first identity attribute that holds a
/// dependency reference in every record
fn infer_parent(collection: &Collection) -> Option<String> {
    let entries = collection.entries();
    if entries.is_empty() {
        return None;
    }
    for attr in collection.manager_ref() {
        let targets: Option<BTreeSet<&str>> = entries
            .iter()
            .map(|(_, record, _)| match record.get(attr) {
                Some(Value::Ref(Reference::Unresolved(lazy))) if lazy.mode.is_ordering() => {
                    Some(lazy.collection.as_str())
                }
                _ => None,
            })
            .collect();
        if let Some(targets) = targets {
            if targets.len() == 1 {
                return targets
                    .into_iter()
                    .next()
                    .filter(|t| *t != collection.name())
                    .map(str::to_string);
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionDefinition;
    use crate::record::{IdentityKey, Record};

    fn set(collections: Vec<Collection>) -> CollectionSet {
        let mut set = CollectionSet::new();
        for c in collections {
            set.insert(c).unwrap();
        }
        set
    }

    fn vms_and_hardwares() -> CollectionSet {
        let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        vms.push(Record::new().with("ems_ref", "vm-1")).unwrap();
        let mut hardwares = Collection::new(CollectionDefinition::new("hardwares", ["vm"])).unwrap();
        hardwares
            .push(Record::new().with("vm", LazyRef::by("vms", "ems_ref", "vm-1")))
            .unwrap();
        set(vec![vms, hardwares])
    }

    #[test]
    fn test_dependency_edges_and_reference_index() {
        let mut collections = vms_and_hardwares();
        let report = DependencyScanner::scan(&mut collections).unwrap();

        assert_eq!(report.edges, 1);
        let hardwares = collections.get("hardwares").unwrap();
        assert_eq!(hardwares.dependencies(), BTreeSet::from(["vms".to_string()]));
        let vms = collections.get("vms").unwrap();
        assert!(vms.dependees().contains("hardwares"));
        assert_eq!(
            vms.reference_index()
                .referrers(&["ems_ref".to_string()], &IdentityKey::new(["vm-1"]))
                .len(),
            1
        );
        assert!(collections.iter().all(Collection::is_finalized));
    }

    #[test]
    fn test_parent_is_inferred_from_identity_reference() {
        let mut collections = vms_and_hardwares();
        let report = DependencyScanner::scan(&mut collections).unwrap();
        assert_eq!(report.inferred_parents.get("hardwares"), Some(&"vms".to_string()));
    }

    #[test]
    fn test_transitive_reference_adds_no_edge() {
        let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        vms.push(
            Record::new()
                .with("ems_ref", "vm-1")
                .with("genealogy_parent", LazyRef::by("vms", "ems_ref", "tpl-1").transitive()),
        )
        .unwrap();
        let mut collections = set(vec![vms]);
        DependencyScanner::scan(&mut collections).unwrap();

        let vms = collections.get("vms").unwrap();
        assert!(vms.dependencies().is_empty());
        assert!(vms.transitive_attributes().contains("genealogy_parent"));
    }

    #[test]
    fn test_unknown_target() {
        let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        vms.push(Record::new().with("ems_ref", "vm-1").with("flavor", LazyRef::by("flavors", "ems_ref", "f1")))
            .unwrap();
        let mut collections = set(vec![vms]);
        let report = DependencyScanner::scan(&mut collections).unwrap();
        assert_eq!(report.unconnected.len(), 1);

        let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        vms.push(Record::new().with("ems_ref", "vm-1").with("flavor", LazyRef::by("flavors", "ems_ref", "f1")))
            .unwrap();
        vms.target([IdentityKey::new(["vm-1"])]).unwrap();
        let mut collections = set(vec![vms]);
        assert!(matches!(
            DependencyScanner::scan(&mut collections),
            Err(Error::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_targeted_collection_gets_ancestor_edge() {
        let mut hosts = Collection::new(CollectionDefinition::new("hosts", ["ems_ref"])).unwrap();
        hosts.push(Record::new().with("ems_ref", "h1")).unwrap();
        let vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"]).parent("hosts")).unwrap();
        let mut disks = Collection::new(CollectionDefinition::new("disks", ["device"]).parent("vms")).unwrap();
        disks.target([IdentityKey::new(["sda"])]).unwrap();

        let mut collections = set(vec![hosts, vms, disks]);
        DependencyScanner::scan(&mut collections).unwrap();
        assert!(collections.get("disks").unwrap().dependencies().contains("hosts"));
    }

    #[test]
    fn test_scan_is_idempotent() {
        let mut collections = vms_and_hardwares();
        DependencyScanner::scan(&mut collections).unwrap();
        let second = DependencyScanner::scan(&mut collections).unwrap();
        assert_eq!(second.scanned, 0);
        assert_eq!(second.edges, 0);
    }
}
