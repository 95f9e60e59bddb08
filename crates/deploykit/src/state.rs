//! In-memory model state: intent, requires index and per-resource status
//!
//! There is exactly one `ResourceState` per managed resource. Versions update
//! entries in place; deploy results only touch the resource they belong to.

use crate::id::ResourceId;
use crate::model::{ModelVersion, ResourceDetails};
use crate::requires::{RequiresDelta, RequiresProvides};
use crate::types::{Blocked, Compliance, DeployResult, HandlerResourceState, ResourceStatus};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Mutable status of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub compliance: Compliance,
    pub last_deploy_result: DeployResult,
    pub blocked: Blocked,
    pub last_deployed: Option<DateTime<Utc>>,
}

impl ResourceState {
    fn new(undefined: bool) -> Self {
        Self {
            compliance: if undefined {
                Compliance::Undefined
            } else {
                Compliance::HasUpdate
            },
            last_deploy_result: DeployResult::New,
            blocked: Blocked::NotBlocked,
            last_deployed: None,
        }
    }
}

/// Persisted status of a resource and the intent hash it was reached for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedState {
    pub resource: ResourceId,
    pub attribute_hash: String,
    pub state: ResourceState,
}

/// What changed when a version was applied
#[derive(Debug, Default)]
pub struct VersionDiff {
    /// Resources that did not exist before
    pub added: HashSet<ResourceId>,
    /// Existing resources whose attribute hash changed
    pub changed: HashSet<ResourceId>,
    /// Resources purged from the model
    pub removed: HashSet<ResourceId>,
    /// Per-resource requires changes for resources present before and after
    pub requires: HashMap<ResourceId, RequiresDelta>,
    /// Resources that left the blocked state
    pub unblocked: HashSet<ResourceId>,
    /// Resources that entered the blocked state
    pub blocked: HashSet<ResourceId>,
    /// Agents that have resources for the first time
    pub new_agents: HashSet<String>,
}

impl VersionDiff {
    /// Whether applying the version changed any intent
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.requires.is_empty()
            && self.unblocked.is_empty()
            && self.blocked.is_empty()
    }
}

/// How a finished deploy was applied to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployApplied {
    /// Result matched the current intent and was recorded
    Recorded { previous: DeployResult },
    /// Intent changed while the deploy was in flight; result dropped
    Stale,
    /// Resource is no longer managed
    Removed,
}

#[derive(Debug, Default)]
pub struct ModelState {
    pub version: u64,
    pub intent: HashMap<ResourceId, Arc<ResourceDetails>>,
    pub requires: RequiresProvides,
    pub resource_state: HashMap<ResourceId, ResourceState>,
    pub resource_sets: HashMap<ResourceId, String>,
    /// Dirty and not blocked
    pub dirty: HashSet<ResourceId>,
    pub resources_by_agent: HashMap<String, HashSet<ResourceId>>,
}

impl ModelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.intent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intent.is_empty()
    }

    /// Replace the model with a validated full version
    pub fn apply_version(&mut self, model: &ModelVersion) -> VersionDiff {
        let mut diff = VersionDiff::default();

        let removed: Vec<ResourceId> = self
            .intent
            .keys()
            .filter(|id| !model.resources.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            self.drop_resource(&id);
            diff.removed.insert(id);
        }

        for (id, details) in &model.resources {
            let undefined = model.undefined.contains(id);
            match self.intent.get(id) {
                None => {
                    let agent = id.agent_name().to_string();
                    if !self.resources_by_agent.contains_key(&agent) {
                        diff.new_agents.insert(agent.clone());
                    }
                    self.resources_by_agent
                        .entry(agent)
                        .or_default()
                        .insert(id.clone());
                    self.resource_state
                        .insert(id.clone(), ResourceState::new(undefined));
                    diff.added.insert(id.clone());
                }
                Some(current) => {
                    let changed = current.attribute_hash != details.attribute_hash;
                    let state = self
                        .resource_state
                        .entry(id.clone())
                        .or_insert_with(|| ResourceState::new(undefined));
                    let was_undefined = state.compliance == Compliance::Undefined;
                    if changed || was_undefined != undefined {
                        state.compliance = if undefined {
                            Compliance::Undefined
                        } else {
                            Compliance::HasUpdate
                        };
                        if state.blocked == Blocked::TemporarilyBlocked {
                            state.blocked = Blocked::NotBlocked;
                        }
                    }
                    if changed {
                        diff.changed.insert(id.clone());
                    }
                }
            }
            self.intent.insert(id.clone(), Arc::clone(details));
            match model.resource_sets.get(id) {
                Some(set) => self.resource_sets.insert(id.clone(), set.clone()),
                None => self.resource_sets.remove(id),
            };
        }

        for (id, requires) in &model.requires {
            let delta = self.requires.add_resource(id, requires.iter().cloned());
            if !delta.is_empty() && !diff.added.contains(id) {
                diff.requires.insert(id.clone(), delta);
            }
        }

        let (blocked, unblocked) = self.update_blocked();
        diff.blocked = blocked;
        diff.unblocked = unblocked;
        self.version = model.version;
        self.rebuild_dirty();
        diff
    }

    fn drop_resource(&mut self, id: &ResourceId) {
        self.intent.remove(id);
        self.resource_state.remove(id);
        self.resource_sets.remove(id);
        self.dirty.remove(id);
        self.requires.remove_resource(id);
        if let Some(ids) = self.resources_by_agent.get_mut(id.agent_name()) {
            ids.remove(id);
        }
    }

    /// Recompute the blocked status from the undefined resources
    ///
    /// Everything that transitively requires an undefined resource is blocked.
    /// Resources that are no longer behind an undefined resource are unblocked.
    fn update_blocked(&mut self) -> (HashSet<ResourceId>, HashSet<ResourceId>) {
        let undefined: Vec<&ResourceId> = self
            .resource_state
            .iter()
            .filter(|(_, state)| state.compliance == Compliance::Undefined)
            .map(|(id, _)| id)
            .collect();
        let mut should_block = self.requires.transitive_dependents(undefined.iter().copied());
        should_block.extend(undefined.into_iter().cloned());

        let mut blocked = HashSet::new();
        let mut unblocked = HashSet::new();
        for (id, state) in &mut self.resource_state {
            let block = should_block.contains(id);
            if block && state.blocked != Blocked::Blocked {
                state.blocked = Blocked::Blocked;
                blocked.insert(id.clone());
            } else if !block && state.blocked == Blocked::Blocked {
                state.blocked = Blocked::NotBlocked;
                unblocked.insert(id.clone());
            }
        }
        (blocked, unblocked)
    }

    fn rebuild_dirty(&mut self) {
        self.dirty = self
            .resource_state
            .iter()
            .filter(|(_, state)| state.compliance.is_dirty() && !state.blocked.is_blocked())
            .map(|(id, _)| id.clone())
            .collect();
    }

    fn refresh_dirty(&mut self, id: &ResourceId) {
        let Some(state) = self.resource_state.get(id) else {
            return;
        };
        if state.compliance.is_dirty() && !state.blocked.is_blocked() {
            self.dirty.insert(id.clone());
        } else {
            self.dirty.remove(id);
        }
    }

    /// Record the outcome of a deploy of `attribute_hash`
    pub fn record_deploy(
        &mut self,
        id: &ResourceId,
        attribute_hash: &str,
        handler_state: HandlerResourceState,
        finished: DateTime<Utc>,
    ) -> DeployApplied {
        let Some(intent) = self.intent.get(id) else {
            return DeployApplied::Removed;
        };
        if intent.attribute_hash != attribute_hash {
            return DeployApplied::Stale;
        }
        let Some(state) = self.resource_state.get_mut(id) else {
            return DeployApplied::Removed;
        };

        let previous = state.last_deploy_result;
        let result = DeployResult::from(handler_state);
        state.last_deploy_result = result;
        state.last_deployed = Some(finished);
        state.compliance = if result == DeployResult::Deployed {
            Compliance::Compliant
        } else {
            Compliance::NonCompliant
        };
        if handler_state == HandlerResourceState::SkippedForDependency {
            if state.blocked == Blocked::NotBlocked {
                state.blocked = Blocked::TemporarilyBlocked;
            }
        } else if state.blocked == Blocked::TemporarilyBlocked {
            state.blocked = Blocked::NotBlocked;
        }
        self.refresh_dirty(id);
        DeployApplied::Recorded { previous }
    }

    /// Carry recorded states over onto the current intent
    ///
    /// A record only applies while its hash matches the intent. Undefined
    /// resources and resources blocked behind them keep what the model gave
    /// them.
    ///
    /// # Returns
    /// The number of resources whose state was restored
    pub fn restore_states(&mut self, recorded: impl IntoIterator<Item = RecordedState>) -> usize {
        let mut restored = 0;
        for record in recorded {
            let matches = self
                .intent
                .get(&record.resource)
                .is_some_and(|intent| intent.attribute_hash == record.attribute_hash);
            let Some(state) = self.resource_state.get_mut(&record.resource) else {
                continue;
            };
            if !matches
                || state.compliance == Compliance::Undefined
                || record.state.compliance == Compliance::Undefined
            {
                continue;
            }
            state.compliance = record.state.compliance;
            state.last_deploy_result = record.state.last_deploy_result;
            state.last_deployed = record.state.last_deployed;
            if state.blocked == Blocked::NotBlocked {
                state.blocked = match record.state.blocked {
                    Blocked::TemporarilyBlocked => Blocked::TemporarilyBlocked,
                    _ => Blocked::NotBlocked,
                };
            }
            restored += 1;
        }
        self.rebuild_dirty();
        restored
    }

    /// Lift a temporary block, returning whether one was lifted
    pub fn unblock_temporarily_blocked(&mut self, id: &ResourceId) -> bool {
        match self.resource_state.get_mut(id) {
            Some(state) if state.blocked == Blocked::TemporarilyBlocked => {
                state.blocked = Blocked::NotBlocked;
                self.refresh_dirty(id);
                true
            }
            _ => false,
        }
    }

    /// Whether a deploy of `id` should be skipped because a requirement did
    /// not deploy successfully
    ///
    /// Never-deployed requirements do not cause a skip.
    pub fn should_skip_for_dependencies(&self, id: &ResourceId) -> Option<ResourceId> {
        self.requires.requires_of(id).iter().find_map(|dep| {
            let state = self.resource_state.get(dep)?;
            (!matches!(
                state.last_deploy_result,
                DeployResult::Deployed | DeployResult::New
            ))
            .then(|| dep.clone())
        })
    }

    /// Current states of the requirements of `id`
    pub fn dependency_states(&self, id: &ResourceId) -> HashMap<ResourceId, DeployResult> {
        self.requires
            .requires_of(id)
            .iter()
            .filter_map(|dep| {
                self.resource_state
                    .get(dep)
                    .map(|s| (dep.clone(), s.last_deploy_result))
            })
            .collect()
    }

    pub fn is_blocked(&self, id: &ResourceId) -> bool {
        self.resource_state
            .get(id)
            .is_some_and(|s| s.blocked.is_blocked())
    }

    /// Mark every non-blocked resource as needing a deploy
    pub fn mark_all_dirty(&mut self) {
        for (id, state) in &self.resource_state {
            if !state.blocked.is_blocked() {
                self.dirty.insert(id.clone());
            }
        }
    }

    /// Status snapshot, sorted by id
    pub fn status_report(&self) -> Vec<ResourceStatus> {
        let mut report: Vec<ResourceStatus> = self
            .resource_state
            .iter()
            .map(|(id, state)| ResourceStatus {
                id: id.clone(),
                compliance: state.compliance,
                last_deploy_result: state.last_deploy_result,
                blocked: state.blocked,
            })
            .collect();
        report.sort_by(|a, b| a.id.cmp(&b.id));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attributes, ResourceRecord};
    use serde_json::json;

    fn rid(name: &str) -> ResourceId {
        ResourceId::new("test::Resource", "agent1", "key", name).unwrap()
    }

    fn version(v: u64, records: &[(&str, &str, &[&str], bool)]) -> ModelVersion {
        let records = records
            .iter()
            .map(|(name, value, requires, undefined)| ResourceRecord {
                id: rid(name),
                attributes: json!({ "value": value })
                    .as_object()
                    .cloned()
                    .unwrap_or_else(Attributes::new),
                requires: requires.iter().map(|r| rid(r)).collect(),
                undefined: *undefined,
                resource_set: None,
            })
            .collect();
        ModelVersion::from_records(v, records).unwrap()
    }

    #[test]
    fn test_first_version_adds_everything() {
        let mut state = ModelState::new();
        let diff = state.apply_version(&version(
            1,
            &[("a", "1", &[], false), ("b", "1", &["a"], false)],
        ));

        assert_eq!(diff.added.len(), 2);
        assert_eq!(diff.new_agents, HashSet::from(["agent1".to_string()]));
        assert_eq!(state.dirty.len(), 2);
        let a = &state.resource_state[&rid("a")];
        assert_eq!(a.compliance, Compliance::HasUpdate);
        assert_eq!(a.last_deploy_result, DeployResult::New);
        assert!(state.requires.is_consistent());
    }

    #[test]
    fn test_identical_version_is_empty_diff() {
        let mut state = ModelState::new();
        let v1 = version(1, &[("a", "1", &[], false), ("b", "1", &["a"], false)]);
        state.apply_version(&v1);
        let diff = state.apply_version(&v1);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_changed_hash_marks_has_update() {
        let mut state = ModelState::new();
        state.apply_version(&version(1, &[("a", "1", &[], false)]));
        let hash = state.intent[&rid("a")].attribute_hash.clone();
        state.record_deploy(&rid("a"), &hash, HandlerResourceState::Deployed, Utc::now());
        assert!(state.dirty.is_empty());

        let diff = state.apply_version(&version(2, &[("a", "2", &[], false)]));
        assert_eq!(diff.changed, HashSet::from([rid("a")]));
        assert_eq!(state.resource_state[&rid("a")].compliance, Compliance::HasUpdate);
        assert!(state.dirty.contains(&rid("a")));
    }

    #[test]
    fn test_removed_resource_is_purged() {
        let mut state = ModelState::new();
        state.apply_version(&version(
            1,
            &[("a", "1", &[], false), ("b", "1", &["a"], false)],
        ));
        let diff = state.apply_version(&version(2, &[("a", "1", &[], false)]));

        assert_eq!(diff.removed, HashSet::from([rid("b")]));
        assert!(!state.resource_state.contains_key(&rid("b")));
        assert!(state.requires.get_dependents(&rid("a")).is_empty());
        assert_eq!(state.resources_by_agent["agent1"].len(), 1);
    }

    #[test]
    fn test_undefined_blocks_transitively() {
        let mut state = ModelState::new();
        state.apply_version(&version(
            1,
            &[
                ("a", "1", &[], true),
                ("b", "1", &["a"], false),
                ("c", "1", &["b"], false),
                ("d", "1", &[], false),
            ],
        ));

        assert!(state.is_blocked(&rid("a")));
        assert!(state.is_blocked(&rid("b")));
        assert!(state.is_blocked(&rid("c")));
        assert!(!state.is_blocked(&rid("d")));
        assert_eq!(state.dirty, HashSet::from([rid("d")]));

        let diff = state.apply_version(&version(
            2,
            &[
                ("a", "1", &[], false),
                ("b", "1", &["a"], false),
                ("c", "1", &["b"], false),
                ("d", "1", &[], false),
            ],
        ));
        assert_eq!(diff.unblocked.len(), 3);
        assert_eq!(state.dirty.len(), 4);
    }

    #[test]
    fn test_stale_deploy_is_not_recorded() {
        let mut state = ModelState::new();
        state.apply_version(&version(1, &[("a", "1", &[], false)]));
        let old_hash = state.intent[&rid("a")].attribute_hash.clone();
        state.apply_version(&version(2, &[("a", "2", &[], false)]));

        let applied =
            state.record_deploy(&rid("a"), &old_hash, HandlerResourceState::Deployed, Utc::now());
        assert_eq!(applied, DeployApplied::Stale);
        assert_eq!(
            state.resource_state[&rid("a")].last_deploy_result,
            DeployResult::New
        );
    }

    #[test]
    fn test_skip_for_dependencies() {
        let mut state = ModelState::new();
        state.apply_version(&version(
            1,
            &[("a", "1", &[], false), ("b", "1", &["a"], false)],
        ));
        assert_eq!(state.should_skip_for_dependencies(&rid("b")), None);

        let hash = state.intent[&rid("a")].attribute_hash.clone();
        state.record_deploy(&rid("a"), &hash, HandlerResourceState::Failed, Utc::now());
        assert_eq!(state.should_skip_for_dependencies(&rid("b")), Some(rid("a")));

        let hash_b = state.intent[&rid("b")].attribute_hash.clone();
        state.record_deploy(
            &rid("b"),
            &hash_b,
            HandlerResourceState::SkippedForDependency,
            Utc::now(),
        );
        let b = &state.resource_state[&rid("b")];
        assert_eq!(b.blocked, Blocked::TemporarilyBlocked);
        assert_eq!(b.compliance, Compliance::NonCompliant);

        assert!(state.unblock_temporarily_blocked(&rid("b")));
        assert!(!state.unblock_temporarily_blocked(&rid("b")));
    }

    #[test]
    fn test_mark_all_dirty_skips_blocked() {
        let mut state = ModelState::new();
        state.apply_version(&version(
            1,
            &[("a", "1", &[], true), ("b", "1", &[], false)],
        ));
        let hash = state.intent[&rid("b")].attribute_hash.clone();
        state.record_deploy(&rid("b"), &hash, HandlerResourceState::Deployed, Utc::now());
        assert!(state.dirty.is_empty());

        state.mark_all_dirty();
        assert_eq!(state.dirty, HashSet::from([rid("b")]));
    }

    #[test]
    fn test_restore_states_only_for_matching_hash() {
        let mut state = ModelState::new();
        let v1 = version(
            1,
            &[
                ("a", "1", &[], false),
                ("b", "1", &["a"], false),
                ("c", "1", &[], false),
                ("u", "1", &[], true),
            ],
        );
        state.apply_version(&v1);
        let deployed = Utc::now();
        let record = |name: &str, hash: String, compliance, result, blocked| RecordedState {
            resource: rid(name),
            attribute_hash: hash,
            state: ResourceState {
                compliance,
                last_deploy_result: result,
                blocked,
                last_deployed: Some(deployed),
            },
        };
        let hash = |name: &str| state.intent[&rid(name)].attribute_hash.clone();
        let (hash_a, hash_b, hash_u) = (hash("a"), hash("b"), hash("u"));

        let restored = state.restore_states([
            record(
                "a",
                hash_a,
                Compliance::NonCompliant,
                DeployResult::Failed,
                Blocked::NotBlocked,
            ),
            record(
                "b",
                hash_b,
                Compliance::NonCompliant,
                DeployResult::Skipped,
                Blocked::TemporarilyBlocked,
            ),
            record(
                "c",
                "outdated".to_string(),
                Compliance::Compliant,
                DeployResult::Deployed,
                Blocked::NotBlocked,
            ),
            record(
                "u",
                hash_u,
                Compliance::Compliant,
                DeployResult::Deployed,
                Blocked::NotBlocked,
            ),
            record(
                "gone",
                "any".to_string(),
                Compliance::Compliant,
                DeployResult::Deployed,
                Blocked::NotBlocked,
            ),
        ]);

        assert_eq!(restored, 2);
        let a = &state.resource_state[&rid("a")];
        assert_eq!(a.last_deploy_result, DeployResult::Failed);
        assert_eq!(a.last_deployed, Some(deployed));
        assert_eq!(state.resource_state[&rid("b")].blocked, Blocked::TemporarilyBlocked);
        assert_eq!(state.resource_state[&rid("c")].compliance, Compliance::HasUpdate);
        assert_eq!(state.resource_state[&rid("u")].compliance, Compliance::Undefined);
        assert_eq!(state.dirty, HashSet::from([rid("a"), rid("b"), rid("c")]));
        assert_eq!(state.should_skip_for_dependencies(&rid("b")), Some(rid("a")));
    }
}
