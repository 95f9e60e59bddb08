//! Scheduled work: deploys waiting on requirements plus the agent queues
//!
//! A deploy that is scheduled while some of its requirements are scheduled as
//! well waits in `waiting` until all of those have finished. Only then does it
//! move to the agent queue. A resource counts as scheduled when it is waiting,
//! queued, or in flight.

use crate::id::ResourceId;
use crate::queue::{AgentQueue, Lane, QueuedTask, Task, TaskKey};
use crate::requires::{RequiresDelta, RequiresProvides};
use crate::types::TaskPriority;
use std::collections::{HashMap, HashSet};

/// A deploy waiting for scheduled requirements to finish
#[derive(Debug, Clone)]
pub struct BlockedDeploy {
    pub resource: ResourceId,
    pub priority: TaskPriority,
    pub repair: bool,
    pub blocked_on: HashSet<ResourceId>,
}

impl BlockedDeploy {
    fn task(&self) -> Task {
        Task::Deploy {
            resource: self.resource.clone(),
            repair: self.repair,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScheduledWork {
    pub waiting: HashMap<ResourceId, BlockedDeploy>,
    pub queues: HashMap<String, AgentQueue>,
}

impl ScheduledWork {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&mut self, agent: &str) -> &mut AgentQueue {
        self.queues.entry(agent.to_string()).or_default()
    }

    fn deploy_key(resource: &ResourceId) -> TaskKey {
        TaskKey::Deploy(resource.clone())
    }

    fn is_queued(&self, resource: &ResourceId) -> bool {
        self.queues
            .get(resource.agent_name())
            .is_some_and(|q| q.is_queued(&Self::deploy_key(resource)))
    }

    /// Whether a deploy of `resource` is in flight
    pub fn is_deploying(&self, resource: &ResourceId) -> bool {
        self.queues
            .get(resource.agent_name())
            .is_some_and(|q| q.is_in_flight(&Self::deploy_key(resource)))
    }

    /// Whether a deploy of `resource` is waiting, queued or in flight
    pub fn is_scheduled(&self, resource: &ResourceId) -> bool {
        self.waiting.contains_key(resource) || self.is_queued(resource) || self.is_deploying(resource)
    }

    /// Schedule deploys and apply requires changes
    ///
    /// # Arguments
    /// * `requires` - The requires index of the current model
    /// * `ensure_scheduled` - Resources that must end up with a scheduled deploy
    /// * `priority` - Priority for newly scheduled deploys
    /// * `repair` - Whether the scheduled deploys are repairs
    /// * `requires_changes` - Requires added and dropped by a new version
    pub fn update_state<'a>(
        &mut self,
        requires: &RequiresProvides,
        ensure_scheduled: impl IntoIterator<Item = &'a ResourceId>,
        priority: TaskPriority,
        repair: bool,
        requires_changes: &HashMap<ResourceId, RequiresDelta>,
    ) {
        let mut maybe_runnable: HashSet<ResourceId> = HashSet::new();

        // Shrink first so the rest works on the smallest blocked sets
        for (resource, delta) in requires_changes {
            if let Some(blocked) = self.waiting.get_mut(resource) {
                for dropped in &delta.dropped {
                    blocked.blocked_on.remove(dropped);
                }
                maybe_runnable.insert(resource.clone());
            }
        }

        for resource in ensure_scheduled {
            if let Some(blocked) = self.waiting.get_mut(resource) {
                blocked.priority = blocked.priority.min(priority);
                blocked.repair |= repair;
                continue;
            }
            if self.is_queued(resource) {
                let task = if repair {
                    Task::repair(resource.clone())
                } else {
                    Task::deploy(resource.clone())
                };
                self.queue(resource.agent_name()).put(task, priority);
                continue;
            }

            let blocked_on: HashSet<ResourceId> = requires
                .requires_of(resource)
                .iter()
                .filter(|dep| self.is_scheduled(dep))
                .cloned()
                .collect();
            if blocked_on.is_empty() {
                maybe_runnable.insert(resource.clone());
            }
            self.waiting.insert(
                resource.clone(),
                BlockedDeploy {
                    resource: resource.clone(),
                    priority,
                    repair,
                    blocked_on,
                },
            );

            for dependent in requires.get_dependents(resource) {
                self.extend_requires(dependent, [resource.clone()].into(), &mut maybe_runnable);
            }
        }

        for (resource, delta) in requires_changes {
            let added: HashSet<ResourceId> = delta
                .added
                .iter()
                .filter(|dep| self.is_scheduled(dep))
                .cloned()
                .collect();
            self.extend_requires(resource, added, &mut maybe_runnable);
        }

        for resource in maybe_runnable {
            self.run_if_ready(&resource);
        }
    }

    /// Make a scheduled deploy wait on additional scheduled requirements
    ///
    /// A deploy that is only in flight keeps running; it started before these
    /// requirements were scheduled.
    fn extend_requires(
        &mut self,
        resource: &ResourceId,
        new_requires: HashSet<ResourceId>,
        maybe_runnable: &mut HashSet<ResourceId>,
    ) {
        if new_requires.is_empty() {
            return;
        }
        if let Some(blocked) = self.waiting.get_mut(resource) {
            blocked.blocked_on.extend(new_requires);
            maybe_runnable.remove(resource);
            return;
        }
        let discarded = self
            .queues
            .get_mut(resource.agent_name())
            .and_then(|q| q.discard(&Self::deploy_key(resource)));
        if let Some(queued) = discarded {
            let repair = matches!(queued.task, Task::Deploy { repair: true, .. });
            self.waiting.insert(
                resource.clone(),
                BlockedDeploy {
                    resource: resource.clone(),
                    priority: queued.priority,
                    repair,
                    blocked_on: new_requires,
                },
            );
        }
    }

    fn run_if_ready(&mut self, resource: &ResourceId) {
        let ready = self
            .waiting
            .get(resource)
            .is_some_and(|b| b.blocked_on.is_empty());
        if !ready {
            return;
        }
        if let Some(blocked) = self.waiting.remove(resource) {
            let task = blocked.task();
            self.queue(resource.agent_name())
                .put(task, blocked.priority);
        }
    }

    /// Queue a dry run or fact refresh
    pub fn put_side_task(&mut self, task: Task, priority: TaskPriority) -> bool {
        let agent = task.resource().agent_name().to_string();
        self.queue(&agent).put(task, priority)
    }

    /// Drop scheduled work of a resource that left the model
    ///
    /// Dry runs are kept since they do not act on the latest intent.
    pub fn delete_resource(&mut self, resource: &ResourceId) {
        self.waiting.remove(resource);
        if let Some(queue) = self.queues.get_mut(resource.agent_name()) {
            queue.discard_resource(resource);
        }
        let waiting_on_it: Vec<ResourceId> = self
            .waiting
            .values()
            .filter(|b| b.blocked_on.contains(resource))
            .map(|b| b.resource.clone())
            .collect();
        for dependent in waiting_on_it {
            if let Some(blocked) = self.waiting.get_mut(&dependent) {
                blocked.blocked_on.remove(resource);
            }
            self.run_if_ready(&dependent);
        }
    }

    pub fn pop(&mut self, agent: &str, lane: Lane) -> Option<QueuedTask> {
        self.queues.get_mut(agent)?.pop(lane)
    }

    /// Release the in-flight guard of a finished task
    pub fn task_done(&mut self, agent: &str, key: &TaskKey) {
        if let Some(queue) = self.queues.get_mut(agent) {
            queue.task_done(key);
        }
    }

    /// Let dependents waiting on a finished deploy proceed
    ///
    /// Must be called after `task_done`. When the resource was scheduled
    /// again in the meantime, dependents keep waiting for that deploy.
    pub fn finished_deploy(&mut self, resource: &ResourceId, requires: &RequiresProvides) {
        if self.is_scheduled(resource) {
            return;
        }
        for dependent in requires.get_dependents(resource) {
            if let Some(blocked) = self.waiting.get_mut(dependent) {
                blocked.blocked_on.remove(resource);
            }
            self.run_if_ready(dependent);
        }
    }

    /// No waiting, queued or in-flight work
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.queues.values().all(AgentQueue::is_idle)
    }

    /// Drop all waiting and queued work
    pub fn clear(&mut self) {
        self.waiting.clear();
        for queue in self.queues.values_mut() {
            queue.clear();
        }
    }
}
