//! Desired-state model: resource intent, versions and partial updates

use crate::error::{Error, Result};
use crate::id::ResourceId;
use crate::requires::validate_requires;
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Attributes that never influence the attribute hash
const UNHASHED_ATTRIBUTES: [&str; 3] = ["requires", "version", "provides"];

pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Resource intent
// ============================================================================

/// Desired state of one resource
///
/// Immutable once built: the hash is computed from the attributes at
/// construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDetails {
    pub id: ResourceId,
    pub attribute_hash: String,
    pub attributes: Attributes,
}

impl ResourceDetails {
    pub fn new(id: ResourceId, attributes: Attributes) -> Self {
        let attribute_hash = attribute_hash(&id, &attributes);
        Self {
            id,
            attribute_hash,
            attributes,
        }
    }

    /// Whether a successful change should notify dependents
    pub fn send_event(&self) -> bool {
        self.bool_attribute("send_event").unwrap_or(false)
    }

    /// Whether events from requirements trigger a deploy of this resource
    pub fn receive_events(&self) -> bool {
        self.bool_attribute("receive_events").unwrap_or(true)
    }

    fn bool_attribute(&self, name: &str) -> Option<bool> {
        self.attributes.get(name).and_then(serde_json::Value::as_bool)
    }
}

/// Content hash over the id and attributes, excluding bookkeeping attributes
///
/// `serde_json::Map` keeps keys sorted, so serialization is canonical.
pub fn attribute_hash(id: &ResourceId, attributes: &Attributes) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_str().as_bytes());
    hasher.update(&[0]);
    for (key, value) in attributes {
        if UNHASHED_ATTRIBUTES.contains(&key.as_str()) {
            continue;
        }
        hasher.update(key.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.to_string().as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

// ============================================================================
// Versions
// ============================================================================

/// Wire record for one resource of a version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub requires: Vec<ResourceId>,
    #[serde(default)]
    pub undefined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_set: Option<String>,
}

/// A full snapshot of the desired state
#[derive(Debug, Clone, Default)]
pub struct ModelVersion {
    pub version: u64,
    pub resources: HashMap<ResourceId, Arc<ResourceDetails>>,
    pub requires: HashMap<ResourceId, BTreeSet<ResourceId>>,
    pub undefined: HashSet<ResourceId>,
    /// Resource set membership; resources without a set are shared
    pub resource_sets: HashMap<ResourceId, String>,
}

impl ModelVersion {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Build a version from wire records, hashing attributes in parallel
    pub fn from_records(version: u64, records: Vec<ResourceRecord>) -> Result<Self> {
        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(&record.id) {
                return Err(Error::rejected(
                    version,
                    format!("duplicate resource {}", record.id),
                ));
            }
        }

        let built: Vec<(ResourceRecord, ResourceDetails)> = records
            .into_par_iter()
            .map(|record| {
                let details = ResourceDetails::new(record.id.clone(), record.attributes.clone());
                (record, details)
            })
            .collect();

        let mut model = Self::new(version);
        for (record, details) in built {
            model.insert(
                details,
                record.requires,
                record.undefined,
                record.resource_set,
            );
        }
        Ok(model)
    }

    /// Add or replace one resource
    pub fn insert(
        &mut self,
        details: ResourceDetails,
        requires: impl IntoIterator<Item = ResourceId>,
        undefined: bool,
        resource_set: Option<String>,
    ) {
        let id = details.id.clone();
        self.requires
            .insert(id.clone(), requires.into_iter().collect());
        if undefined {
            self.undefined.insert(id.clone());
        } else {
            self.undefined.remove(&id);
        }
        match resource_set {
            Some(set) => self.resource_sets.insert(id.clone(), set),
            None => self.resource_sets.remove(&id),
        };
        self.resources.insert(id, Arc::new(details));
    }

    /// Check structural validity: requires only point inside the version, no cycles
    pub fn validate(&self) -> Result<()> {
        validate_requires(self.version, &self.requires)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resource_set_of(&self, id: &ResourceId) -> Option<&str> {
        self.resource_sets.get(id).map(String::as_str)
    }

    /// Resource set name to member ids
    pub fn sets(&self) -> BTreeMap<&str, BTreeSet<&ResourceId>> {
        let mut sets: BTreeMap<&str, BTreeSet<&ResourceId>> = BTreeMap::new();
        for (id, set) in &self.resource_sets {
            sets.entry(set.as_str()).or_default().insert(id);
        }
        sets
    }

    /// Convert back to wire records, sorted by id
    pub fn to_records(&self) -> Vec<ResourceRecord> {
        let mut records: Vec<ResourceRecord> = self
            .resources
            .values()
            .map(|details| ResourceRecord {
                id: details.id.clone(),
                attributes: details.attributes.clone(),
                requires: self
                    .requires
                    .get(&details.id)
                    .map(|r| r.iter().cloned().collect())
                    .unwrap_or_default(),
                undefined: self.undefined.contains(&details.id),
                resource_set: self.resource_sets.get(&details.id).cloned(),
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

// ============================================================================
// Partial versions
// ============================================================================

/// An update that replaces some resource sets and removes others
///
/// `updates` carries every resource of the touched sets, plus any new shared
/// resources they need.
#[derive(Debug, Clone, Default)]
pub struct PartialVersion {
    pub version: u64,
    pub updates: ModelVersion,
    pub removed_sets: BTreeSet<String>,
}

impl PartialVersion {
    pub fn new(updates: ModelVersion, removed_sets: impl IntoIterator<Item = String>) -> Self {
        Self {
            version: updates.version,
            updates,
            removed_sets: removed_sets.into_iter().collect(),
        }
    }

    /// Names of the sets this partial replaces
    pub fn updated_sets(&self) -> BTreeSet<&str> {
        self.updates
            .resource_sets
            .values()
            .map(String::as_str)
            .collect()
    }

    /// Merge into the current model, producing the next full version
    ///
    /// Resources of updated or removed sets are dropped from `current` and
    /// replaced by the partial's resources. Shared resources and resources of
    /// untouched sets carry over unchanged.
    pub fn merge_into(&self, current: &ModelVersion) -> Result<ModelVersion> {
        let version = self.version;
        if version <= current.version {
            return Err(Error::rejected(
                version,
                format!(
                    "partial version must be newer than the current version {}",
                    current.version
                ),
            ));
        }

        let updated = self.updated_sets();
        if let Some(both) = updated
            .iter()
            .find(|set| self.removed_sets.contains(**set))
        {
            return Err(Error::rejected(
                version,
                format!("resource set {both} is both updated and removed"),
            ));
        }

        for (id, details) in &self.updates.resources {
            let new_set = self.updates.resource_set_of(id);
            let Some(existing) = current.resources.get(id) else {
                continue;
            };
            let old_set = current.resource_set_of(id);
            match (old_set, new_set) {
                (Some(old), Some(new)) if old != new => {
                    return Err(Error::rejected(
                        version,
                        format!("{id} cannot move from resource set {old} to {new}"),
                    ));
                }
                (Some(old), None) => {
                    return Err(Error::rejected(
                        version,
                        format!("{id} cannot move from resource set {old} to the shared set"),
                    ));
                }
                (None, Some(new)) => {
                    return Err(Error::rejected(
                        version,
                        format!("shared resource {id} cannot move to resource set {new}"),
                    ));
                }
                (None, None) if existing.attribute_hash != details.attribute_hash => {
                    return Err(Error::rejected(
                        version,
                        format!("shared resource {id} cannot be changed by a partial version"),
                    ));
                }
                _ => {}
            }
        }

        let mut merged = ModelVersion::new(version);
        for (id, details) in &current.resources {
            let keep = match current.resource_set_of(id) {
                None => true,
                Some(set) => !updated.contains(set) && !self.removed_sets.contains(set),
            };
            if keep {
                merged.resources.insert(id.clone(), Arc::clone(details));
                merged.requires.insert(
                    id.clone(),
                    current.requires.get(id).cloned().unwrap_or_default(),
                );
                if current.undefined.contains(id) {
                    merged.undefined.insert(id.clone());
                }
                if let Some(set) = current.resource_sets.get(id) {
                    merged.resource_sets.insert(id.clone(), set.clone());
                }
            }
        }

        for (id, details) in &self.updates.resources {
            merged.resources.insert(id.clone(), Arc::clone(details));
            merged.requires.insert(
                id.clone(),
                self.updates.requires.get(id).cloned().unwrap_or_default(),
            );
            if self.updates.undefined.contains(id) {
                merged.undefined.insert(id.clone());
            } else {
                merged.undefined.remove(id);
            }
            if let Some(set) = self.updates.resource_sets.get(id) {
                merged.resource_sets.insert(id.clone(), set.clone());
            }
        }

        merged.validate()?;
        Ok(merged)
    }
}

// ============================================================================
// Model source
// ============================================================================

/// Source of historical versions, used for dry runs
pub trait ModelSource: Send + Sync {
    /// Fetch a full version by number
    fn get_version(&self, version: u64) -> anyhow::Result<Arc<ModelVersion>>;
}

/// In-memory version history
#[derive(Default)]
pub struct VersionHistory {
    versions: Mutex<BTreeMap<u64, Arc<ModelVersion>>>,
}

impl VersionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a version, replacing any earlier one with the same number
    pub fn record(&self, model: Arc<ModelVersion>) {
        self.lock().insert(model.version, model);
    }

    pub fn latest(&self) -> Option<Arc<ModelVersion>> {
        self.lock().values().next_back().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Arc<ModelVersion>>> {
        self.versions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ModelSource for VersionHistory {
    fn get_version(&self, version: u64) -> anyhow::Result<Arc<ModelVersion>> {
        self.lock()
            .get(&version)
            .cloned()
            .with_context(|| format!("version {version} is not in the history"))
    }
}
