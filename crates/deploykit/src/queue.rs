//! Per-agent priority queue with coalescing and at-most-one-in-flight
//!
//! Each task has a key. Deploys and repairs of a resource share a key, so at
//! most one of them is queued and at most one is in flight. A task put while
//! its key is in flight is parked and only becomes poppable once the in-flight
//! task is marked done.
//!
//! The heaps use lazy deletion: an entry is live only while its sequence
//! number matches the queued task for its key.

use crate::id::ResourceId;
use crate::model::ResourceDetails;
use crate::types::TaskPriority;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Work item for one agent
#[derive(Debug, Clone)]
pub enum Task {
    /// Deploy the current intent of a resource
    Deploy { resource: ResourceId, repair: bool },
    /// Compare a resource of some version against the live system
    DryRun {
        details: Arc<ResourceDetails>,
        version: u64,
        dry_run_id: Uuid,
    },
    /// Collect facts for a resource
    RefreshFacts { resource: ResourceId },
}

impl Task {
    pub fn deploy(resource: ResourceId) -> Self {
        Self::Deploy {
            resource,
            repair: false,
        }
    }

    pub fn repair(resource: ResourceId) -> Self {
        Self::Deploy {
            resource,
            repair: true,
        }
    }

    pub fn resource(&self) -> &ResourceId {
        match self {
            Self::Deploy { resource, .. } | Self::RefreshFacts { resource } => resource,
            Self::DryRun { details, .. } => &details.id,
        }
    }

    pub fn key(&self) -> TaskKey {
        match self {
            Self::Deploy { resource, .. } => TaskKey::Deploy(resource.clone()),
            Self::DryRun {
                details,
                dry_run_id,
                ..
            } => TaskKey::DryRun(*dry_run_id, details.id.clone()),
            Self::RefreshFacts { resource } => TaskKey::RefreshFacts(resource.clone()),
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            Self::Deploy { .. } => Lane::Deploy,
            Self::DryRun { .. } | Self::RefreshFacts { .. } => Lane::Side,
        }
    }

    /// Fold a duplicate put into this task
    fn absorb(&mut self, other: Task) {
        if let (Self::Deploy { repair, .. }, Self::Deploy { repair: other, .. }) = (self, other) {
            *repair |= other;
        }
    }
}

/// Identity used for coalescing and the in-flight guard
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Deploy(ResourceId),
    DryRun(Uuid, ResourceId),
    RefreshFacts(ResourceId),
}

/// Deploys and side work (dry runs, facts) are served independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Deploy,
    Side,
}

/// A queued task with its scheduling metadata
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub priority: TaskPriority,
    pub generation: Uuid,
    seq: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: TaskPriority,
    seq: u64,
    key: TaskKey,
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: most urgent priority first, then oldest
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Task queue of a single agent
#[derive(Debug, Default)]
pub struct AgentQueue {
    queued: HashMap<TaskKey, QueuedTask>,
    in_flight: HashMap<TaskKey, Uuid>,
    deploy_heap: BinaryHeap<HeapEntry>,
    side_heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl AgentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task, coalescing with a queued task for the same key
    ///
    /// # Returns
    /// `true` if the task is newly queued or its priority was raised
    pub fn put(&mut self, task: Task, priority: TaskPriority) -> bool {
        let key = task.key();
        let lane = task.lane();

        let seq = self.next_seq;
        if let Some(existing) = self.queued.get_mut(&key) {
            existing.task.absorb(task);
            if existing.priority <= priority {
                return false;
            }
            existing.priority = priority;
            existing.seq = seq;
        } else {
            self.queued.insert(
                key.clone(),
                QueuedTask {
                    task,
                    priority,
                    generation: Uuid::new_v4(),
                    seq,
                },
            );
        }
        self.next_seq += 1;

        if !self.in_flight.contains_key(&key) {
            self.heap(lane).push(HeapEntry { priority, seq, key });
        }
        true
    }

    /// Pop the most urgent runnable task of a lane and mark it in flight
    pub fn pop(&mut self, lane: Lane) -> Option<QueuedTask> {
        loop {
            let entry = self.heap(lane).pop()?;
            let live = self
                .queued
                .get(&entry.key)
                .is_some_and(|q| q.seq == entry.seq)
                && !self.in_flight.contains_key(&entry.key);
            if !live {
                continue;
            }
            let queued = self.queued.remove(&entry.key)?;
            self.in_flight.insert(entry.key, queued.generation);
            return Some(queued);
        }
    }

    /// Release the in-flight guard of `key`, making a parked task poppable
    pub fn task_done(&mut self, key: &TaskKey) {
        if self.in_flight.remove(key).is_none() {
            return;
        }
        if let Some(parked) = self.queued.get(key) {
            let entry = HeapEntry {
                priority: parked.priority,
                seq: parked.seq,
                key: key.clone(),
            };
            let lane = parked.task.lane();
            self.heap(lane).push(entry);
        }
    }

    /// Drop a queued task; an in-flight task for the key is unaffected
    ///
    /// # Returns
    /// The dropped task, if one was queued
    pub fn discard(&mut self, key: &TaskKey) -> Option<QueuedTask> {
        self.queued.remove(key)
    }

    /// Drop queued deploy and fact tasks of a removed resource
    ///
    /// Dry runs act on a fixed version and are kept.
    pub fn discard_resource(&mut self, resource: &ResourceId) {
        self.queued.remove(&TaskKey::Deploy(resource.clone()));
        self.queued.remove(&TaskKey::RefreshFacts(resource.clone()));
    }

    pub fn get(&self, key: &TaskKey) -> Option<&QueuedTask> {
        self.queued.get(key)
    }

    pub fn is_queued(&self, key: &TaskKey) -> bool {
        self.queued.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &TaskKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of queued (not in-flight) tasks
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Nothing queued and nothing running
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }

    /// Drop all queued work; in-flight guards stay until their tasks finish
    pub fn clear(&mut self) {
        self.queued.clear();
        self.deploy_heap.clear();
        self.side_heap.clear();
    }

    fn heap(&mut self, lane: Lane) -> &mut BinaryHeap<HeapEntry> {
        match lane {
            Lane::Deploy => &mut self.deploy_heap,
            Lane::Side => &mut self.side_heap,
        }
    }
}
