//! Resource scheduler: version intake and deploy triggers
//!
//! All mutable scheduling state lives behind one mutex. Version intake is
//! additionally serialized by an intent lock, so validation and partial
//! merges run without holding the state lock while still applying versions
//! one at a time. Executors and persistence are only ever called with no
//! lock held.

use crate::error::{Error, Result};
use crate::executor::ExecutorManager;
use crate::id::ResourceId;
use crate::model::{ModelSource, ModelVersion, PartialVersion};
use crate::persistence::StateUpdateManager;
use crate::queue::{Lane, Task};
use crate::requires::RequiresDelta;
use crate::state::{ModelState, RecordedState, ResourceState};
use crate::timers::TimerManager;
use crate::types::{DeploySummary, ResourceStatus, SchedulerOptions, TaskPriority};
use crate::work::ScheduledWork;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Result of applying a version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionApplied {
    pub version: u64,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    /// Deploys scheduled as a consequence of the version
    pub scheduled: usize,
}

pub(crate) struct SchedulerState {
    pub model: ModelState,
    pub work: ScheduledWork,
    /// Last applied version, used as the base of partial updates
    pub current: Arc<ModelVersion>,
    pub applied: bool,
    pub running: bool,
    /// In-flight deploys and the attribute hash they deploy
    pub deploying: HashMap<ResourceId, String>,
    pub summary: DeploySummary,
    pub agents: HashSet<String>,
}

pub(crate) struct Shared {
    pub state: Mutex<SchedulerState>,
    /// Signalled when tasks become poppable or the scheduler stops
    pub work_available: Condvar,
    /// Signalled when the scheduled work drains
    pub idle: Condvar,
    intent_lock: Mutex<()>,
    pub executors: Arc<dyn ExecutorManager>,
    pub persistence: Arc<dyn StateUpdateManager>,
    pub model_source: Arc<dyn ModelSource>,
    pub options: SchedulerOptions,
    pub timers: TimerManager,
    pub slots: Mutex<HashMap<String, Arc<crate::dispatch::AgentSlot>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule deploys of `resources` under an already held state lock
    ///
    /// When `force` is false, resources that are already being deployed with
    /// their current intent are left alone.
    pub fn schedule_locked(
        &self,
        state: &mut SchedulerState,
        resources: impl IntoIterator<Item = ResourceId>,
        priority: TaskPriority,
        repair: bool,
        force: bool,
        requires_changes: &HashMap<ResourceId, RequiresDelta>,
    ) -> usize {
        let SchedulerState {
            model,
            work,
            deploying,
            ..
        } = state;

        let selected: Vec<ResourceId> = resources
            .into_iter()
            .filter(|id| !model.is_blocked(id))
            .filter(|id| {
                force
                    || !deploying.get(id).is_some_and(|hash| {
                        model
                            .intent
                            .get(id)
                            .is_some_and(|intent| intent.attribute_hash == *hash)
                    })
            })
            .collect();

        for id in &selected {
            self.timers.stop_timer(id);
        }
        work.update_state(
            &model.requires,
            &selected,
            priority,
            repair,
            requires_changes,
        );
        self.work_available.notify_all();
        selected.len()
    }

    /// Schedule one resource, as used by timers and events
    pub fn trigger_resource(&self, id: &ResourceId, priority: TaskPriority) {
        let repair = matches!(
            priority,
            TaskPriority::IntervalRepair | TaskPriority::UserRepair
        );
        let mut state = self.lock_state();
        if !state.running || !state.model.intent.contains_key(id) {
            return;
        }
        if !repair && !state.model.dirty.contains(id) {
            log::debug!("Skipping periodic deploy of {id}: already compliant");
            return;
        }
        self.schedule_locked(
            &mut state,
            [id.clone()],
            priority,
            repair,
            false,
            &HashMap::new(),
        );
    }

    /// Wake waiters if no work is left
    pub fn notify_if_idle(&self, state: &SchedulerState) {
        if state.work.is_idle() {
            self.idle.notify_all();
        }
    }
}

/// Schedules deploys, repairs, dry runs and fact collection across agents
pub struct ResourceScheduler {
    shared: Arc<Shared>,
}

impl ResourceScheduler {
    pub fn new(
        options: SchedulerOptions,
        executors: Arc<dyn ExecutorManager>,
        persistence: Arc<dyn StateUpdateManager>,
        model_source: Arc<dyn ModelSource>,
    ) -> Self {
        let state = SchedulerState {
            model: ModelState::new(),
            work: ScheduledWork::new(),
            current: Arc::new(ModelVersion::default()),
            applied: false,
            running: false,
            deploying: HashMap::new(),
            summary: DeploySummary::default(),
            agents: HashSet::new(),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                work_available: Condvar::new(),
                idle: Condvar::new(),
                intent_lock: Mutex::new(()),
                executors,
                persistence,
                model_source,
                options,
                timers: TimerManager::new(),
                slots: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start timers and workers for every known agent
    pub fn start(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .timers
            .start(Arc::new(move |id, priority| {
                if let Some(shared) = weak.upgrade() {
                    shared.trigger_resource(&id, priority);
                }
            }))
            .map_err(|e| Error::Collaborator(anyhow::anyhow!("failed to start timers: {e}")))?;

        let agents: Vec<String> = {
            let mut state = self.shared.lock_state();
            state.running = true;
            state.model.resources_by_agent.keys().cloned().collect()
        };
        self.ensure_agents(agents);
        log::info!("Scheduler started");
        Ok(())
    }

    /// Stop all workers; queued work is dropped, in-flight work completes
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock_state();
            state.running = false;
            state.work.clear();
        }
        self.shared.work_available.notify_all();
        self.shared.idle.notify_all();
        self.shared.timers.stop();
        self.shared.executors.stop();
        log::info!("Scheduler stopped");
    }

    /// Wait for all worker threads to exit
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
        self.shared.timers.join();
        crate::dispatch::close_all_versions(&self.shared);
    }

    /// Spawn workers for agents that do not have any yet
    fn ensure_agents(&self, agents: impl IntoIterator<Item = String>) {
        let mut state = self.shared.lock_state();
        if !state.running {
            return;
        }
        for agent in agents {
            if !state.agents.insert(agent.clone()) {
                continue;
            }
            let slot = Arc::new(crate::dispatch::AgentSlot::new(&agent));
            self.shared
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(agent.clone(), Arc::clone(&slot));

            let mut handles = Vec::new();
            let lanes = std::iter::repeat_n(Lane::Deploy, self.shared.options.max_concurrency_per_agent.max(1))
                .chain(std::iter::once(Lane::Side));
            for (n, lane) in lanes.enumerate() {
                let shared = Arc::clone(&self.shared);
                let slot = Arc::clone(&slot);
                let spawned = thread::Builder::new()
                    .name(format!("agent-{agent}-{n}"))
                    .spawn(move || crate::dispatch::run_worker(&shared, &slot, lane));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => log::error!("Failed to spawn worker for agent {agent}: {e}"),
                }
            }
            log::debug!("Started {} workers for agent {agent}", handles.len());
            self.shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(handles);
        }
    }

    // ========================================================================
    // Version intake
    // ========================================================================

    /// Apply a full version
    ///
    /// New and changed resources are scheduled for deploy at
    /// `NewVersionDeploy`. Resources whose intent is unchanged are left
    /// alone. An invalid version is rejected without touching the model.
    pub fn new_version(&self, model: ModelVersion) -> Result<VersionApplied> {
        let _intent = self
            .shared
            .intent_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        model.validate()?;
        self.apply(model, None)
    }

    /// Merge a partial version into the current model
    ///
    /// Only resources carried by the partial are ever scheduled, even when
    /// resources outside the touched sets require them.
    pub fn new_partial_version(&self, partial: PartialVersion) -> Result<VersionApplied> {
        let _intent = self
            .shared
            .intent_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = Arc::clone(&self.shared.lock_state().current);
        let merged = partial.merge_into(&current)?;
        let scope: HashSet<ResourceId> = partial.updates.resources.keys().cloned().collect();
        log::debug!(
            "Partial version {} updates sets {:?}, removes sets {:?}",
            partial.version,
            partial.updated_sets(),
            partial.removed_sets
        );
        self.apply(merged, Some(scope))
    }

    /// Load a version applied by an earlier run, with its recorded states
    ///
    /// Nothing is scheduled. Resources whose record no longer matches their
    /// intent stay dirty for the next deploy. Only valid before any version
    /// is applied.
    ///
    /// # Returns
    /// The number of resources whose state was restored
    pub fn restore(&self, model: ModelVersion, recorded: Vec<RecordedState>) -> Result<usize> {
        let _intent = self
            .shared
            .intent_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        model.validate()?;
        let version = model.version;
        let (restored, new_agents) = {
            let mut guard = self.shared.lock_state();
            let state = &mut *guard;
            if state.applied {
                return Err(Error::rejected(
                    version,
                    format!("version {} is already applied", state.model.version),
                ));
            }

            let diff = state.model.apply_version(&model);
            let restored = state.model.restore_states(recorded);
            state.current = Arc::new(model);
            state.applied = true;
            log::info!(
                "Restored version {version}: {} resources, {restored} with recorded state, {} dirty",
                state.model.len(),
                state.model.dirty.len()
            );
            (restored, diff.new_agents)
        };
        self.ensure_agents(new_agents);
        Ok(restored)
    }

    fn apply(&self, model: ModelVersion, scope: Option<HashSet<ResourceId>>) -> Result<VersionApplied> {
        let version = model.version;
        let (applied, new_agents) = {
            let mut guard = self.shared.lock_state();
            let state = &mut *guard;
            if state.applied && version < state.model.version {
                return Err(Error::rejected(
                    version,
                    format!("older than the current version {}", state.model.version),
                ));
            }

            let diff = state.model.apply_version(&model);
            for removed in &diff.removed {
                state.work.delete_resource(removed);
                self.shared.timers.stop_timer(removed);
            }
            for blocked in &diff.blocked {
                state.work.delete_resource(blocked);
                self.shared.timers.stop_timer(blocked);
            }

            let increment: Vec<ResourceId> = diff
                .added
                .iter()
                .chain(&diff.changed)
                .chain(&diff.unblocked)
                .filter(|id| state.model.dirty.contains(*id))
                .filter(|id| scope.as_ref().is_none_or(|s| s.contains(*id)))
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();

            let scheduled = self.shared.schedule_locked(
                state,
                increment,
                TaskPriority::NewVersionDeploy,
                false,
                false,
                &diff.requires,
            );
            state.current = Arc::new(model);
            state.applied = true;
            self.shared.notify_if_idle(state);

            log::info!(
                "Applied version {version}: {} added, {} changed, {} removed, {scheduled} scheduled",
                diff.added.len(),
                diff.changed.len(),
                diff.removed.len()
            );
            (
                VersionApplied {
                    version,
                    added: diff.added.len(),
                    changed: diff.changed.len(),
                    removed: diff.removed.len(),
                    scheduled,
                },
                diff.new_agents,
            )
        };
        self.ensure_agents(new_agents);
        Ok(applied)
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    /// Deploy every resource that is not compliant and not blocked
    pub fn deploy(&self, priority: TaskPriority) -> usize {
        let mut state = self.shared.lock_state();
        let dirty: Vec<ResourceId> = state.model.dirty.iter().cloned().collect();
        let scheduled =
            self.shared
                .schedule_locked(&mut state, dirty, priority, false, false, &HashMap::new());
        log::info!("Deploy ({priority:?}): {scheduled} resources scheduled");
        self.shared.notify_if_idle(&state);
        scheduled
    }

    /// Repair every resource that is not blocked, regardless of compliance
    pub fn repair(&self, priority: TaskPriority) -> usize {
        let mut state = self.shared.lock_state();
        state.model.mark_all_dirty();
        let all: Vec<ResourceId> = state.model.dirty.iter().cloned().collect();
        let scheduled =
            self.shared
                .schedule_locked(&mut state, all, priority, true, true, &HashMap::new());
        log::info!("Repair ({priority:?}): {scheduled} resources scheduled");
        self.shared.notify_if_idle(&state);
        scheduled
    }

    /// Deploy or repair a single resource
    pub fn deploy_resource(&self, id: &ResourceId, priority: TaskPriority) -> Result<()> {
        let repair = matches!(
            priority,
            TaskPriority::UserRepair | TaskPriority::IntervalRepair
        );
        let mut state = self.shared.lock_state();
        if !state.model.intent.contains_key(id) {
            return Err(Error::UnknownResource(id.clone()));
        }
        self.shared.schedule_locked(
            &mut state,
            [id.clone()],
            priority,
            repair,
            true,
            &HashMap::new(),
        );
        Ok(())
    }

    /// Queue a dry run of every defined resource of `version`
    ///
    /// Dry runs never change resource state and never trigger dependents.
    ///
    /// # Returns
    /// The number of resources queued
    pub fn dryrun(&self, dry_run_id: Uuid, version: u64) -> Result<usize> {
        let model = self.shared.model_source.get_version(version).map_err(|e| {
            log::warn!("Dry run {dry_run_id}: cannot load version {version}: {e:#}");
            Error::UnknownVersion(version)
        })?;

        let mut agents = HashSet::new();
        let mut queued = 0;
        {
            let mut state = self.shared.lock_state();
            for (id, details) in &model.resources {
                if model.undefined.contains(id) {
                    log::debug!("Dry run {dry_run_id}: skipping undefined {id}");
                    continue;
                }
                agents.insert(id.agent_name().to_string());
                let task = Task::DryRun {
                    details: Arc::clone(details),
                    version,
                    dry_run_id,
                };
                if state.work.put_side_task(task, TaskPriority::DryRun) {
                    queued += 1;
                }
            }
        }
        self.ensure_agents(agents);
        self.shared.work_available.notify_all();
        log::info!("Dry run {dry_run_id} of version {version}: {queued} resources queued");
        Ok(queued)
    }

    /// Queue fact collection for a managed resource
    pub fn get_facts(&self, resource: &ResourceId) -> Result<()> {
        let mut state = self.shared.lock_state();
        if !state.model.intent.contains_key(resource) {
            return Err(Error::UnknownResource(resource.clone()));
        }
        state.work.put_side_task(
            Task::RefreshFacts {
                resource: resource.clone(),
            },
            TaskPriority::FactRefresh,
        );
        self.shared.work_available.notify_all();
        Ok(())
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Block until no work is waiting, queued or in flight
    ///
    /// # Returns
    /// `true` if the scheduler went idle before the timeout
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        while !state.work.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn summary(&self) -> DeploySummary {
        self.shared.lock_state().summary.clone()
    }

    /// Return the summary and reset the counters
    pub fn take_summary(&self) -> DeploySummary {
        std::mem::take(&mut self.shared.lock_state().summary)
    }

    pub fn version(&self) -> Option<u64> {
        let state = self.shared.lock_state();
        state.applied.then_some(state.model.version)
    }

    pub fn resource_count(&self) -> usize {
        self.shared.lock_state().model.len()
    }

    pub fn resource_state(&self, id: &ResourceId) -> Option<ResourceState> {
        self.shared.lock_state().model.resource_state.get(id).cloned()
    }

    pub fn status_report(&self) -> Vec<ResourceStatus> {
        self.shared.lock_state().model.status_report()
    }

    /// The current full model
    pub fn current_version(&self) -> Arc<ModelVersion> {
        Arc::clone(&self.shared.lock_state().current)
    }

    /// Priority of the pending timer of a resource
    pub fn pending_timer(&self, id: &ResourceId) -> Option<TaskPriority> {
        self.shared.timers.pending(id)
    }
}

impl Drop for ResourceScheduler {
    fn drop(&mut self) {
        let running = self.shared.lock_state().running;
        if running {
            self.stop();
        }
    }
}
