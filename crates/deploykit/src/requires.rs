//! Bidirectional requires/provides index
//!
//! `requires[a]` holds everything `a` depends on, `provides[b]` everything that
//! depends on `b`. Both maps are only mutated through this type so they stay
//! exact inverses of each other.

use crate::error::{Error, Result};
use crate::id::ResourceId;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Requires added and dropped by a single update
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequiresDelta {
    pub added: HashSet<ResourceId>,
    pub dropped: HashSet<ResourceId>,
}

impl RequiresDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct RequiresProvides {
    requires: HashMap<ResourceId, HashSet<ResourceId>>,
    provides: HashMap<ResourceId, HashSet<ResourceId>>,
}

static EMPTY: std::sync::LazyLock<HashSet<ResourceId>> = std::sync::LazyLock::new(HashSet::new);

impl RequiresProvides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the requires of `id`, replacing any previous set
    ///
    /// # Returns
    /// The requires that were added and dropped relative to the previous set
    pub fn add_resource(
        &mut self,
        id: &ResourceId,
        requires: impl IntoIterator<Item = ResourceId>,
    ) -> RequiresDelta {
        let new: HashSet<ResourceId> = requires.into_iter().collect();
        let old = self.requires.remove(id).unwrap_or_default();

        let delta = RequiresDelta {
            added: new.difference(&old).cloned().collect(),
            dropped: old.difference(&new).cloned().collect(),
        };

        for dropped in &delta.dropped {
            self.unlink_provides(dropped, id);
        }
        for added in &delta.added {
            self.provides
                .entry(added.clone())
                .or_default()
                .insert(id.clone());
        }

        self.requires.insert(id.clone(), new);
        delta
    }

    /// Remove `id` and every edge that touches it
    pub fn remove_resource(&mut self, id: &ResourceId) {
        if let Some(requires) = self.requires.remove(id) {
            for required in &requires {
                self.unlink_provides(required, id);
            }
        }
        if let Some(dependents) = self.provides.remove(id) {
            for dependent in &dependents {
                if let Some(reqs) = self.requires.get_mut(dependent) {
                    reqs.remove(id);
                }
            }
        }
    }

    fn unlink_provides(&mut self, required: &ResourceId, dependent: &ResourceId) {
        if let Some(provides) = self.provides.get_mut(required) {
            provides.remove(dependent);
            if provides.is_empty() {
                self.provides.remove(required);
            }
        }
    }

    /// Resources `id` depends on
    pub fn requires_of(&self, id: &ResourceId) -> &HashSet<ResourceId> {
        self.requires.get(id).unwrap_or(&EMPTY)
    }

    /// Resources that depend on `id`
    pub fn get_dependents(&self, id: &ResourceId) -> &HashSet<ResourceId> {
        self.provides.get(id).unwrap_or(&EMPTY)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.requires.contains_key(id)
    }

    /// Every resource that transitively depends on any of `roots`, roots excluded
    pub fn transitive_dependents<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a ResourceId>,
    ) -> HashSet<ResourceId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&ResourceId> = roots.into_iter().collect();
        while let Some(current) = stack.pop() {
            for dependent in self.get_dependents(current) {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Whether `provides` is the exact inverse of `requires`
    pub fn is_consistent(&self) -> bool {
        let forward = self
            .requires
            .iter()
            .flat_map(|(id, reqs)| reqs.iter().map(move |r| (r, id)));
        let mut count = 0;
        for (required, dependent) in forward {
            count += 1;
            if !self.get_dependents(required).contains(dependent) {
                return false;
            }
        }
        count == self.provides.values().map(HashSet::len).sum::<usize>()
    }
}

/// Validate the requires graph of an incoming version
///
/// Rejects requires on resources missing from the version, self-requires and
/// cycles.
pub fn validate_requires(
    version: u64,
    requires: &HashMap<ResourceId, BTreeSet<ResourceId>>,
) -> Result<()> {
    let mut graph: DiGraph<&ResourceId, ()> = DiGraph::new();
    let nodes: HashMap<&ResourceId, NodeIndex> = requires
        .keys()
        .map(|id| (id, graph.add_node(id)))
        .collect();

    for (id, reqs) in requires {
        for required in reqs {
            if required == id {
                return Err(Error::rejected(version, format!("{id} requires itself")));
            }
            let Some(&from) = nodes.get(required) else {
                return Err(Error::rejected(
                    version,
                    format!("{id} requires {required}, which is not part of the version"),
                ));
            };
            graph.add_edge(from, nodes[id], ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(Error::rejected(
            version,
            format!("dependency cycle through {}", graph[cycle.node_id()]),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(name: &str) -> ResourceId {
        ResourceId::new("test::Resource", "agent1", "key", name).unwrap()
    }

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<ResourceId, BTreeSet<ResourceId>> {
        edges
            .iter()
            .map(|(id, reqs)| (rid(id), reqs.iter().map(|r| rid(r)).collect()))
            .collect()
    }

    #[test]
    fn test_add_resource_links_both_directions() {
        let mut index = RequiresProvides::new();
        index.add_resource(&rid("a"), []);
        index.add_resource(&rid("b"), [rid("a")]);
        index.add_resource(&rid("c"), [rid("a"), rid("b")]);

        assert_eq!(index.get_dependents(&rid("a")).len(), 2);
        assert!(index.get_dependents(&rid("b")).contains(&rid("c")));
        assert!(index.requires_of(&rid("c")).contains(&rid("a")));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_update_reports_delta() {
        let mut index = RequiresProvides::new();
        index.add_resource(&rid("b"), [rid("a")]);
        let delta = index.add_resource(&rid("b"), [rid("c")]);

        assert_eq!(delta.added, HashSet::from([rid("c")]));
        assert_eq!(delta.dropped, HashSet::from([rid("a")]));
        assert!(index.get_dependents(&rid("a")).is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_remove_resource_strips_all_edges() {
        let mut index = RequiresProvides::new();
        index.add_resource(&rid("a"), []);
        index.add_resource(&rid("b"), [rid("a")]);
        index.add_resource(&rid("c"), [rid("b")]);

        index.remove_resource(&rid("b"));
        assert!(!index.contains(&rid("b")));
        assert!(index.get_dependents(&rid("a")).is_empty());
        assert!(index.requires_of(&rid("c")).is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_transitive_dependents() {
        let mut index = RequiresProvides::new();
        index.add_resource(&rid("a"), []);
        index.add_resource(&rid("b"), [rid("a")]);
        index.add_resource(&rid("c"), [rid("b")]);
        index.add_resource(&rid("d"), []);

        let deps = index.transitive_dependents([&rid("a")]);
        assert_eq!(deps, HashSet::from([rid("b"), rid("c")]));
    }

    #[test]
    fn test_validate_accepts_dag() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(validate_requires(1, &g).is_ok());
    }

    #[test]
    fn test_validate_rejects_dangling() {
        let g = graph(&[("b", &["a"])]);
        let err = validate_requires(1, &g).unwrap_err();
        assert!(matches!(err, Error::VersionRejected { version: 1, .. }));
        assert!(err.to_string().contains("not part of the version"));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let err = validate_requires(2, &g).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_rejects_self_requires() {
        let g = graph(&[("a", &["a"])]);
        assert!(validate_requires(1, &g).is_err());
    }
}
