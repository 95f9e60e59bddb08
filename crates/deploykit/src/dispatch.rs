//! Agent workers: pop tasks, call the executor, apply results
//!
//! A worker takes the state lock to pop a task and snapshot what it needs,
//! releases it for the executor call, and takes it again to apply the
//! result. The per-key in-flight guard in the agent queue keeps a resource
//! from being deployed twice at the same time.

use crate::error::ExecutorError;
use crate::executor::{call_with_timeout, CancellationToken, DeployIntent, Executor};
use crate::id::ResourceId;
use crate::model::ResourceDetails;
use crate::persistence::log_failure;
use crate::queue::{Lane, QueuedTask, Task};
use crate::scheduler::{SchedulerState, Shared};
use crate::state::{DeployApplied, ResourceState};
use crate::types::{
    Blocked, Compliance, DeployReport, DeployResult, DeployStatus, HandlerResourceState,
    TaskPriority,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

// ============================================================================
// Agent slot
// ============================================================================

/// Version bracket of an agent executor
#[derive(Debug, Default)]
struct Bracket {
    open: Option<u64>,
    /// Version a worker is opening, with the bracket lock released
    opening: Option<u64>,
}

/// Lazily created executor of one agent and the version it has open
///
/// The bracket lock is never held across a call into the executor, and the
/// open version only moves forward.
pub(crate) struct AgentSlot {
    name: String,
    executor: Mutex<Option<Arc<dyn Executor>>>,
    bracket: Mutex<Bracket>,
    bracket_changed: Condvar,
}

impl AgentSlot {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            executor: Mutex::new(None),
            bracket: Mutex::new(Bracket::default()),
            bracket_changed: Condvar::new(),
        }
    }

    fn executor(&self, shared: &Shared) -> Result<Arc<dyn Executor>, ExecutorError> {
        let mut slot = self.executor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(executor) = slot.as_ref() {
            return Ok(Arc::clone(executor));
        }
        let executor = shared.executors.get_executor(&self.name).map_err(|e| {
            log::error!("Failed to create executor for agent {}: {e:#}", self.name);
            ExecutorError::Unavailable(format!("agent {}: {e}", self.name))
        })?;
        *slot = Some(Arc::clone(&executor));
        Ok(executor)
    }

    fn lock_bracket(&self) -> MutexGuard<'_, Bracket> {
        self.bracket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn opened_version(&self) -> Option<u64> {
        self.lock_bracket().open
    }

    /// Whether a deploy of `version` finds no equal or newer version open
    fn needs_open(&self, version: u64) -> bool {
        self.opened_version().is_none_or(|open| open < version)
    }

    /// Make sure the executor has `version` or a newer one open
    ///
    /// An older version never replaces a newer one; its deploys run against
    /// the open version. Workers wait while another worker opens a version.
    fn ensure_version(
        &self,
        executor: &dyn Executor,
        version: u64,
        resources: Option<Vec<Arc<ResourceDetails>>>,
    ) -> Result<(), ExecutorError> {
        let (previous, resources) = {
            let mut bracket = self.lock_bracket();
            loop {
                if bracket.open.is_some_and(|open| open >= version) {
                    return Ok(());
                }
                if bracket.opening.is_none() {
                    break;
                }
                bracket = self
                    .bracket_changed
                    .wait(bracket)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            let Some(resources) = resources else {
                log::debug!(
                    "Agent {}: version {version} is no longer open, deploying without it",
                    self.name
                );
                return Ok(());
            };
            bracket.opening = Some(version);
            (bracket.open.take(), resources)
        };

        if let Some(previous) = previous {
            if let Err(e) = executor.close_version(previous) {
                log::warn!("Agent {}: failed to close version {previous}: {e:#}", self.name);
            }
        }
        let opened = executor.open_version(version, &resources);

        {
            let mut bracket = self.lock_bracket();
            bracket.opening = None;
            if opened.is_ok() {
                bracket.open = Some(version);
            }
        }
        self.bracket_changed.notify_all();

        opened.map_err(|e| {
            ExecutorError::Unavailable(format!("failed to open version {version}: {e:#}"))
        })?;
        log::debug!("Agent {} opened version {version}", self.name);
        Ok(())
    }
}

/// Close the open version of every agent executor
pub(crate) fn close_all_versions(shared: &Shared) {
    let slots: Vec<Arc<AgentSlot>> = shared
        .slots
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();
    for slot in slots {
        let executor = slot
            .executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let opened = slot.lock_bracket().open.take();
        if let (Some(executor), Some(version)) = (executor, opened) {
            log_failure("version close", executor.close_version(version));
        }
    }
}

// ============================================================================
// Worker loop
// ============================================================================

/// Work snapshot taken under the state lock
enum Prepared {
    /// Nothing to call; the task was settled under the lock
    Settled,
    Deploy(DeployStart),
    DryRun(QueuedTask),
    Facts {
        task: QueuedTask,
        details: Arc<ResourceDetails>,
    },
}

struct DeployStart {
    task: QueuedTask,
    intent: DeployIntent,
    /// Requirement whose failure makes this deploy a skip
    skip_for: Option<ResourceId>,
    /// Agent resources, present when the executor must open this version
    open_resources: Option<Vec<Arc<ResourceDetails>>>,
}

pub(crate) fn run_worker(shared: &Arc<Shared>, slot: &Arc<AgentSlot>, lane: Lane) {
    loop {
        let prepared = {
            let mut state = shared.lock_state();
            loop {
                if !state.running {
                    return;
                }
                if let Some(task) = state.work.pop(&slot.name, lane) {
                    break prepare(shared, slot, &mut state, task);
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        match prepared {
            Prepared::Settled => {}
            Prepared::Deploy(start) => run_deploy(shared, slot, start),
            Prepared::DryRun(task) => run_dry_run(shared, slot, task),
            Prepared::Facts { task, details } => run_get_facts(shared, slot, task, &details),
        }
    }
}

fn prepare(
    shared: &Shared,
    slot: &AgentSlot,
    state: &mut SchedulerState,
    queued: QueuedTask,
) -> Prepared {
    match &queued.task {
        Task::Deploy { resource, repair } => {
            let resource = resource.clone();
            let repair = *repair;
            deploy_start(shared, slot, state, queued, &resource, repair)
        }
        Task::DryRun { .. } => Prepared::DryRun(queued),
        Task::RefreshFacts { resource } => match state.model.intent.get(resource) {
            Some(details) => Prepared::Facts {
                details: Arc::clone(details),
                task: queued,
            },
            None => {
                settle(shared, state, &slot.name, &queued);
                Prepared::Settled
            }
        },
    }
}

/// Release the in-flight guard of a task that needs no executor call
fn settle(shared: &Shared, state: &mut SchedulerState, agent: &str, queued: &QueuedTask) {
    state.work.task_done(agent, &queued.task.key());
    if let Task::Deploy { resource, .. } = &queued.task {
        let SchedulerState { model, work, .. } = state;
        work.finished_deploy(resource, &model.requires);
    }
    shared.work_available.notify_all();
    shared.notify_if_idle(state);
}

// ============================================================================
// Deploy
// ============================================================================

fn deploy_start(
    shared: &Shared,
    slot: &AgentSlot,
    state: &mut SchedulerState,
    queued: QueuedTask,
    resource: &ResourceId,
    repair: bool,
) -> Prepared {
    let Some(details) = state.model.intent.get(resource).cloned() else {
        log::debug!("Dropping deploy of {resource}: no longer managed");
        state.summary.add(DeployStatus::Cancelled);
        settle(shared, state, &slot.name, &queued);
        return Prepared::Settled;
    };
    if state.model.is_blocked(resource) {
        log::warn!("Not deploying {resource}: it depends on an undefined value");
        state.summary.add(DeployStatus::SkippedForUndefined);
        settle(shared, state, &slot.name, &queued);
        return Prepared::Settled;
    }

    let skip_for = if repair {
        None
    } else {
        state.model.should_skip_for_dependencies(resource)
    };
    let version = state.model.version;
    let open_resources = slot.needs_open(version).then(|| {
        state
            .model
            .resources_by_agent
            .get(&slot.name)
            .into_iter()
            .flatten()
            .filter_map(|id| state.model.intent.get(id).cloned())
            .collect()
    });

    state
        .deploying
        .insert(resource.clone(), details.attribute_hash.clone());
    let intent = DeployIntent {
        action_id: Uuid::new_v4(),
        version,
        dependencies: state.model.dependency_states(resource),
        details,
        started: Utc::now(),
    };
    Prepared::Deploy(DeployStart {
        task: queued,
        intent,
        skip_for,
        open_resources,
    })
}

fn run_deploy(shared: &Shared, slot: &AgentSlot, start: DeployStart) {
    let DeployStart {
        task,
        intent,
        skip_for,
        open_resources,
    } = start;
    let rvid = intent.resource_version_id();

    log_failure(
        "deploy start",
        shared.persistence.send_in_progress(intent.action_id, &rvid),
    );

    let report = if let Some(dependency) = skip_for {
        log::warn!("Skipping {rvid}: requirement {dependency} did not deploy successfully");
        DeployReport::undeployable(
            rvid,
            intent.action_id,
            HandlerResourceState::SkippedForDependency,
            format!("skipped because requirement {dependency} failed or was skipped"),
        )
    } else {
        execute(shared, slot, &task, &intent, open_resources)
    };

    deploy_done(shared, slot, &task, &intent, report);
}

fn execute(
    shared: &Shared,
    slot: &AgentSlot,
    task: &QueuedTask,
    intent: &DeployIntent,
    open_resources: Option<Vec<Arc<ResourceDetails>>>,
) -> DeployReport {
    let rvid = intent.resource_version_id();
    let result = slot.executor(shared).and_then(|executor| {
        slot.ensure_version(executor.as_ref(), intent.version, open_resources)?;
        let generation = task.generation;
        let reason = task.priority.reason();
        let call_intent = intent.clone();
        call_with_timeout(
            shared.options.executor_timeout,
            &CancellationToken::new(),
            move |cancel| executor.execute(generation, &call_intent, reason, &cancel),
        )
    });

    match result {
        Ok(mut report) => {
            report.resource_version_id = rvid;
            report.action_id = intent.action_id;
            report
        }
        Err(e) => {
            let state = if e.is_retryable() {
                HandlerResourceState::Unavailable
            } else {
                HandlerResourceState::Failed
            };
            log::warn!("Deploy of {rvid} failed: {e}");
            DeployReport::undeployable(rvid, intent.action_id, state, e.to_string())
        }
    }
}

fn deploy_done(
    shared: &Shared,
    slot: &AgentSlot,
    task: &QueuedTask,
    intent: &DeployIntent,
    report: DeployReport,
) {
    let finished = Utc::now();
    let resource = &intent.details.id;
    let hash = intent.details.attribute_hash.as_str();

    let persisted: Option<ResourceState> = {
        let mut state = shared.lock_state();
        state.work.task_done(&slot.name, &task.task.key());
        state.deploying.remove(resource);

        let applied =
            state
                .model
                .record_deploy(resource, hash, report.resource_state, finished);
        let persisted = match applied {
            DeployApplied::Removed => {
                log::debug!("Discarding result for {resource}: no longer managed");
                state.summary.add(DeployStatus::Cancelled);
                None
            }
            DeployApplied::Stale => {
                log::debug!("Discarding stale result for {resource}: intent changed during deploy");
                state.summary.add(DeployStatus::Stale);
                if state.model.dirty.contains(resource) && !state.work.is_scheduled(resource) {
                    shared.schedule_locked(
                        &mut state,
                        [resource.clone()],
                        task.priority,
                        false,
                        false,
                        &HashMap::new(),
                    );
                }
                state.model.resource_state.get(resource).cloned()
            }
            DeployApplied::Recorded { previous } => {
                record_outcome(shared, &mut state, task, intent, &report, previous);
                state.model.resource_state.get(resource).cloned()
            }
        };

        let SchedulerState { model, work, .. } = &mut *state;
        work.finished_deploy(resource, &model.requires);
        shared.work_available.notify_all();
        shared.notify_if_idle(&state);
        persisted
    };

    if let Some(resource_state) = persisted {
        log_failure(
            "deploy result",
            shared.persistence.send_deploy_done(
                hash,
                &report,
                &resource_state,
                intent.started,
                finished,
            ),
        );
    }
}

/// Count the outcome, propagate events and arm the resource's timer
fn record_outcome(
    shared: &Shared,
    state: &mut SchedulerState,
    task: &QueuedTask,
    intent: &DeployIntent,
    report: &DeployReport,
    previous: DeployResult,
) {
    let resource = &intent.details.id;
    let result = DeployResult::from(report.resource_state);
    match report.resource_state {
        HandlerResourceState::Deployed => {
            log::info!("Deployed {}", report.resource_version_id);
            state.summary.add(DeployStatus::Deployed);
        }
        HandlerResourceState::Skipped | HandlerResourceState::SkippedForDependency => {
            log::warn!(
                "Skipped {}: {}",
                report.resource_version_id,
                report.messages.join("; ")
            );
            state.summary.add(DeployStatus::Skipped);
        }
        HandlerResourceState::Failed | HandlerResourceState::Unavailable => {
            log::warn!(
                "Failed {}: {}",
                report.resource_version_id,
                report.messages.join("; ")
            );
            state.summary.add(DeployStatus::Failed);
        }
    }

    if result == DeployResult::Deployed {
        let dependents: Vec<ResourceId> = state
            .model
            .requires
            .get_dependents(resource)
            .iter()
            .cloned()
            .collect();

        if intent.details.send_event() && report.has_change() {
            let receivers: Vec<ResourceId> = dependents
                .iter()
                .filter(|d| {
                    state
                        .model
                        .intent
                        .get(*d)
                        .is_some_and(|details| details.receive_events())
                })
                .cloned()
                .collect();
            if !receivers.is_empty() {
                log::debug!("{resource} changed, notifying {} dependents", receivers.len());
                shared.schedule_locked(
                    state,
                    receivers,
                    task.priority,
                    false,
                    true,
                    &HashMap::new(),
                );
            }
        }

        if matches!(previous, DeployResult::Failed | DeployResult::Skipped) {
            let recovered: Vec<ResourceId> = dependents
                .into_iter()
                .filter(|d| state.model.unblock_temporarily_blocked(d))
                .collect();
            if !recovered.is_empty() {
                log::info!(
                    "{resource} recovered, rescheduling {} skipped dependents",
                    recovered.len()
                );
                shared.schedule_locked(
                    state,
                    recovered,
                    task.priority,
                    false,
                    false,
                    &HashMap::new(),
                );
            }
        }
    }

    arm_timer(shared, state, resource);
}

fn arm_timer(shared: &Shared, state: &SchedulerState, resource: &ResourceId) {
    if state.work.is_scheduled(resource) {
        return;
    }
    let Some(resource_state) = state.model.resource_state.get(resource) else {
        return;
    };
    let options = &shared.options;
    let timer = match (resource_state.compliance, resource_state.blocked) {
        // temporarily blocked resources wait for their requirement to recover
        (_, Blocked::Blocked | Blocked::TemporarilyBlocked) => None,
        (Compliance::Compliant, _) => options
            .repair_interval
            .map(|d| (d, TaskPriority::IntervalRepair)),
        _ => options
            .deploy_interval
            .map(|d| (d, TaskPriority::IntervalDeploy)),
    };
    if let Some((delay, priority)) = timer {
        shared.timers.set(resource, delay, priority);
    }
}

// ============================================================================
// Dry runs and facts
// ============================================================================

fn run_dry_run(shared: &Shared, slot: &AgentSlot, task: QueuedTask) {
    if let Task::DryRun {
        details,
        version,
        dry_run_id,
    } = &task.task
    {
        let resources = vec![Arc::clone(details)];
        let (version, dry_run_id) = (*version, *dry_run_id);
        let result = slot.executor(shared).and_then(|executor| {
            call_with_timeout(
                shared.options.executor_timeout,
                &CancellationToken::new(),
                move |cancel| executor.dry_run(&resources, version, dry_run_id, &cancel),
            )
        });
        match result {
            Ok(results) => {
                for result in &results {
                    log_failure(
                        "dry run result",
                        shared.persistence.dryrun_update(dry_run_id, result),
                    );
                }
            }
            Err(e) => log::warn!("Dry run {dry_run_id} of {} failed: {e}", details.id),
        }
    }
    finish_side_task(shared, slot, &task);
}

fn run_get_facts(
    shared: &Shared,
    slot: &AgentSlot,
    task: QueuedTask,
    details: &Arc<ResourceDetails>,
) {
    let call_details = Arc::clone(details);
    let result = slot.executor(shared).and_then(|executor| {
        call_with_timeout(
            shared.options.executor_timeout,
            &CancellationToken::new(),
            move |cancel| executor.get_facts(&call_details, &cancel),
        )
    });
    match result {
        Ok(facts) => {
            log::debug!("Collected {} facts for {}", facts.len(), details.id);
            log_failure("facts", shared.persistence.set_facts(&details.id, &facts));
        }
        Err(e) => log::warn!("Fact collection for {} failed: {e}", details.id),
    }
    finish_side_task(shared, slot, &task);
}

fn finish_side_task(shared: &Shared, slot: &AgentSlot, task: &QueuedTask) {
    let mut state = shared.lock_state();
    settle(shared, &mut state, &slot.name, task);
}
