//! End-to-end scheduling scenarios against a scripted executor

use chrono::{DateTime, Utc};
use deploykit::{
    Blocked, CancellationToken, Change, Compliance, DeployIntent, DeployReport, DeployResult,
    DryRunResult, Error, Executor, ExecutorError, ExecutorManager, Facts, HandlerResourceState,
    ModelVersion, PartialVersion, RecordedState, ResourceDetails, ResourceId, ResourceRecord,
    ResourceScheduler, ResourceState, ResourceVersionId, SchedulerOptions, StateUpdateManager, TaskPriority,
    VersionHistory,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Scripted collaborators
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String, String),
    End(String),
}

#[derive(Default)]
struct Script {
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    events: Mutex<Vec<Event>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight_per_resource: Mutex<usize>,
    max_in_flight_total: Mutex<usize>,
    dry_runs: Mutex<usize>,
    opened: Mutex<Vec<u64>>,
    closed: Mutex<Vec<u64>>,
    /// Agents that started opening a version
    opening: Mutex<Vec<String>>,
    open_delays: Mutex<HashMap<String, Duration>>,
    broken_agents: Mutex<HashSet<String>>,
}

impl Script {
    fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    fn delay(&self, name: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    fn delay_open(&self, agent: &str, delay: Duration) {
        self.open_delays
            .lock()
            .unwrap()
            .insert(agent.to_string(), delay);
    }

    fn break_agent(&self, agent: &str) {
        self.broken_agents.lock().unwrap().insert(agent.to_string());
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Names in the order their deploys started
    fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Start(name, _) => Some(name),
                Event::End(_) => None,
            })
            .collect()
    }

    fn position(&self, event: &Event) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {event:?}"))
    }

    fn wait_for_start(&self, name: &str) {
        wait_until(&format!("{name} to start"), || {
            self.started().iter().any(|n| n == name)
        });
    }
}

fn wait_until(what: &str, done: impl Fn() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("gave up waiting for {what}");
}

struct ScriptedExecutor {
    script: Arc<Script>,
    agent: String,
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        _generation: Uuid,
        intent: &DeployIntent,
        _reason: &str,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, ExecutorError> {
        let script = &self.script;
        let name = intent.details.id.attribute_value().to_string();
        script.events.lock().unwrap().push(Event::Start(
            name.clone(),
            intent.details.attribute_hash.clone(),
        ));
        {
            let mut in_flight = script.in_flight.lock().unwrap();
            let count = in_flight.entry(name.clone()).or_default();
            *count += 1;
            let mut max = script.max_in_flight_per_resource.lock().unwrap();
            *max = (*max).max(*count);
            let total: usize = in_flight.values().sum();
            let mut max_total = script.max_in_flight_total.lock().unwrap();
            *max_total = (*max_total).max(total);
        }

        let delay = script.delays.lock().unwrap().get(&name).copied();
        if let Some(delay) = delay {
            let deadline = std::time::Instant::now() + delay;
            while std::time::Instant::now() < deadline && !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(2));
            }
        }

        *script
            .in_flight
            .lock()
            .unwrap()
            .get_mut(&name)
            .unwrap() -= 1;
        script.events.lock().unwrap().push(Event::End(name.clone()));

        let failing = script.failing.lock().unwrap().contains(&name);
        Ok(DeployReport {
            resource_version_id: intent.resource_version_id(),
            action_id: intent.action_id,
            resource_state: if failing {
                HandlerResourceState::Failed
            } else {
                HandlerResourceState::Deployed
            },
            messages: Vec::new(),
            changes: BTreeMap::new(),
            change: if failing {
                Change::Nochange
            } else {
                Change::Updated
            },
        })
    }

    fn dry_run(
        &self,
        resources: &[Arc<ResourceDetails>],
        version: u64,
        _dry_run_id: Uuid,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DryRunResult>, ExecutorError> {
        *self.script.dry_runs.lock().unwrap() += resources.len();
        Ok(resources
            .iter()
            .map(|r| DryRunResult {
                resource_version_id: r.id.with_version(version),
                changes: BTreeMap::new(),
                messages: vec!["no changes".into()],
            })
            .collect())
    }

    fn get_facts(
        &self,
        details: &ResourceDetails,
        _cancel: &CancellationToken,
    ) -> Result<Facts, ExecutorError> {
        let mut facts = Facts::new();
        facts.insert("name".into(), json!(details.id.attribute_value()));
        Ok(facts)
    }

    fn open_version(&self, version: u64, _resources: &[Arc<ResourceDetails>]) -> anyhow::Result<()> {
        let script = &self.script;
        script.opening.lock().unwrap().push(self.agent.clone());
        let delay = script.open_delays.lock().unwrap().get(&self.agent).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        script.opened.lock().unwrap().push(version);
        Ok(())
    }

    fn close_version(&self, version: u64) -> anyhow::Result<()> {
        self.script.closed.lock().unwrap().push(version);
        Ok(())
    }
}

struct ScriptedManager(Arc<Script>);

impl ExecutorManager for ScriptedManager {
    fn get_executor(&self, agent: &str) -> anyhow::Result<Arc<dyn Executor>> {
        if self.0.broken_agents.lock().unwrap().contains(agent) {
            anyhow::bail!("agent {agent} is unreachable");
        }
        Ok(Arc::new(ScriptedExecutor {
            script: Arc::clone(&self.0),
            agent: agent.to_string(),
        }))
    }
}

#[derive(Default)]
struct Recorder {
    in_progress: Mutex<Vec<ResourceVersionId>>,
    done: Mutex<Vec<(String, HandlerResourceState)>>,
    dry_runs: Mutex<Vec<(Uuid, DryRunResult)>>,
    facts: Mutex<HashMap<ResourceId, Facts>>,
}

impl StateUpdateManager for Recorder {
    fn send_in_progress(&self, _action_id: Uuid, resource: &ResourceVersionId) -> anyhow::Result<()> {
        self.in_progress.lock().unwrap().push(resource.clone());
        Ok(())
    }

    fn send_deploy_done(
        &self,
        _attribute_hash: &str,
        report: &DeployReport,
        _state: &ResourceState,
        _started: DateTime<Utc>,
        _finished: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.done.lock().unwrap().push((
            report.resource_version_id.id.attribute_value().to_string(),
            report.resource_state,
        ));
        Ok(())
    }

    fn dryrun_update(&self, dry_run_id: Uuid, result: &DryRunResult) -> anyhow::Result<()> {
        self.dry_runs
            .lock()
            .unwrap()
            .push((dry_run_id, result.clone()));
        Ok(())
    }

    fn set_facts(&self, resource: &ResourceId, facts: &Facts) -> anyhow::Result<()> {
        self.facts
            .lock()
            .unwrap()
            .insert(resource.clone(), facts.clone());
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

struct Harness {
    scheduler: ResourceScheduler,
    script: Arc<Script>,
    recorder: Arc<Recorder>,
    history: Arc<VersionHistory>,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(SchedulerOptions {
            max_concurrency_per_agent: 4,
            executor_timeout: Some(Duration::from_secs(5)),
            deploy_interval: None,
            repair_interval: None,
        })
    }

    fn with_options(options: SchedulerOptions) -> Self {
        let script = Arc::new(Script::default());
        let recorder = Arc::new(Recorder::default());
        let history = Arc::new(VersionHistory::new());
        let scheduler = ResourceScheduler::new(
            options,
            Arc::new(ScriptedManager(Arc::clone(&script))),
            Arc::clone(&recorder) as Arc<dyn StateUpdateManager>,
            Arc::clone(&history) as Arc<dyn deploykit::ModelSource>,
        );
        scheduler.start().unwrap();
        Self {
            scheduler,
            script,
            recorder,
            history,
        }
    }

    fn apply(&self, model: ModelVersion) -> deploykit::VersionApplied {
        let model_copy = model.clone();
        let applied = self.scheduler.new_version(model).unwrap();
        self.history.record(Arc::new(model_copy));
        applied
    }

    fn settle(&self) {
        assert!(self.scheduler.wait_until_idle(IDLE_TIMEOUT), "scheduler never went idle");
    }

    fn state(&self, name: &str) -> ResourceState {
        self.scheduler.resource_state(&rid(name)).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.scheduler.join();
    }
}

fn rid(name: &str) -> ResourceId {
    rid_on("agent1", name)
}

fn rid_on(agent: &str, name: &str) -> ResourceId {
    ResourceId::new("test::Resource", agent, "key", name).unwrap()
}

fn res(name: &str, value: &str, requires: &[&str]) -> ResourceRecord {
    res_on("agent1", name, value, requires)
}

fn res_on(agent: &str, name: &str, value: &str, requires: &[&str]) -> ResourceRecord {
    ResourceRecord {
        id: rid_on(agent, name),
        attributes: json!({ "value": value }).as_object().cloned().unwrap(),
        requires: requires.iter().map(|r| rid_on(agent, r)).collect(),
        undefined: false,
        resource_set: None,
    }
}

fn in_set(mut record: ResourceRecord, set: &str) -> ResourceRecord {
    record.resource_set = Some(set.to_string());
    record
}

fn sending_events(mut record: ResourceRecord) -> ResourceRecord {
    record.attributes.insert("send_event".into(), json!(true));
    record
}

fn version(v: u64, records: Vec<ResourceRecord>) -> ModelVersion {
    ModelVersion::from_records(v, records).unwrap()
}

fn chain(v: u64, key2_value: &str) -> ModelVersion {
    version(
        v,
        vec![
            res("key1", "a", &[]),
            res("key2", key2_value, &["key1"]),
            res("key3", "c", &["key2"]),
        ],
    )
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_full_deploy_follows_requires_order() {
    let h = Harness::new();
    let applied = h.apply(chain(1, "b"));
    assert_eq!(applied.scheduled, 3);
    h.settle();

    assert_eq!(h.script.started(), ["key1", "key2", "key3"]);
    let end1 = h.script.position(&Event::End("key1".into()));
    let start2 = h
        .script
        .events()
        .iter()
        .position(|e| matches!(e, Event::Start(n, _) if n == "key2"))
        .unwrap();
    let end2 = h.script.position(&Event::End("key2".into()));
    let start3 = h
        .script
        .events()
        .iter()
        .position(|e| matches!(e, Event::Start(n, _) if n == "key3"))
        .unwrap();
    assert!(end1 < start2);
    assert!(end2 < start3);

    let summary = h.scheduler.summary();
    assert_eq!(summary.deployed, 3);
    assert!(summary.is_success());
    assert_eq!(h.recorder.in_progress.lock().unwrap().len(), 3);
    assert_eq!(h.recorder.done.lock().unwrap().len(), 3);
    assert_eq!(*h.script.opened.lock().unwrap(), vec![1]);
    for name in ["key1", "key2", "key3"] {
        assert_eq!(h.state(name).compliance, Compliance::Compliant);
    }
}

#[test]
fn test_incremental_deploy_only_touches_changed_resource() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.settle();

    let applied = h.apply(chain(2, "b2"));
    assert_eq!(applied.changed, 1);
    assert_eq!(applied.scheduled, 1);
    h.settle();

    assert_eq!(h.script.started(), ["key1", "key2", "key3", "key2"]);
    assert_eq!(h.scheduler.version(), Some(2));
}

#[test]
fn test_send_event_redeploys_dependents() {
    let h = Harness::new();
    let with_events = |v, value: &str| {
        version(
            v,
            vec![
                res("key1", "a", &[]),
                sending_events(res("key2", value, &["key1"])),
                res("key3", "c", &["key2"]),
            ],
        )
    };
    h.apply(with_events(1, "b"));
    h.settle();
    let before = h.script.started().len();

    h.apply(with_events(2, "b2"));
    h.settle();

    let after: Vec<String> = h.script.started()[before..].to_vec();
    assert_eq!(after, ["key2", "key3"]);
}

#[test]
fn test_failed_requirement_skips_dependents() {
    let h = Harness::new();
    h.script.fail("key1");
    h.apply(chain(1, "b"));
    h.settle();

    assert_eq!(h.script.started(), ["key1"]);
    let summary = h.scheduler.summary();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.deployed, 0);

    let key2 = h.state("key2");
    assert_eq!(key2.last_deploy_result, DeployResult::Skipped);
    assert_eq!(key2.blocked, Blocked::TemporarilyBlocked);
    assert_ne!(key2.compliance, Compliance::Compliant);

    let done = h.recorder.done.lock().unwrap().clone();
    assert!(done.contains(&("key2".into(), HandlerResourceState::SkippedForDependency)));
}

#[test]
fn test_recovery_unblocks_skipped_dependents() {
    let h = Harness::new();
    h.script.fail("key1");
    h.apply(chain(1, "b"));
    h.settle();

    h.script.heal("key1");
    h.scheduler
        .deploy_resource(&rid("key1"), TaskPriority::UserDeploy)
        .unwrap();
    h.settle();

    assert_eq!(h.script.started(), ["key1", "key1", "key2", "key3"]);
    for name in ["key1", "key2", "key3"] {
        let state = h.state(name);
        assert_eq!(state.compliance, Compliance::Compliant, "{name}");
        assert_eq!(state.blocked, Blocked::NotBlocked, "{name}");
    }
}

#[test]
fn test_reapplying_identical_version_schedules_nothing() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.settle();

    let applied = h.apply(chain(1, "b"));
    assert_eq!(applied.scheduled, 0);
    assert_eq!(applied.added + applied.changed + applied.removed, 0);
    h.settle();
    assert_eq!(h.script.started().len(), 3);
}

#[test]
fn test_rejected_version_leaves_model_untouched() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.settle();

    let cyclic = version(
        2,
        vec![
            res("key1", "a", &["key3"]),
            res("key2", "b", &["key1"]),
            res("key3", "c", &["key2"]),
        ],
    );
    let err = h.scheduler.new_version(cyclic).unwrap_err();
    assert!(matches!(err, Error::VersionRejected { version: 2, .. }));

    let dangling = version(3, vec![res("key1", "a", &["missing"])]);
    assert!(h.scheduler.new_version(dangling).is_err());

    assert_eq!(h.scheduler.version(), Some(1));
    assert_eq!(h.scheduler.resource_count(), 3);

    let older = chain(0, "b");
    assert!(h.scheduler.new_version(older).is_err());
}

#[test]
fn test_partial_version_removing_set() {
    let h = Harness::new();
    h.apply(version(
        1,
        vec![
            in_set(res("a1", "1", &[]), "set1"),
            in_set(res("a2", "1", &["a1"]), "set1"),
            in_set(res("b1", "1", &[]), "set2"),
            in_set(res("b2", "1", &[]), "set2"),
            in_set(res("b3", "1", &["b1"]), "set2"),
        ],
    ));
    h.settle();

    let partial = PartialVersion::new(ModelVersion::new(2), ["set1".to_string()]);
    let applied = h.scheduler.new_partial_version(partial).unwrap();
    assert_eq!(applied.removed, 2);
    assert_eq!(applied.scheduled, 0);
    assert_eq!(h.scheduler.resource_count(), 3);
    assert!(h.scheduler.resource_state(&rid("a1")).is_none());
    assert!(h.scheduler.resource_state(&rid("b3")).is_some());
}

#[test]
fn test_partial_version_isolates_untouched_sets() {
    let h = Harness::new();
    h.apply(version(
        1,
        vec![
            in_set(res("a1", "1", &[]), "setA"),
            in_set(res("b1", "1", &["a1"]), "setB"),
            in_set(res("b2", "1", &["b1"]), "setB"),
        ],
    ));
    h.settle();
    let before = h.script.started().len();

    let updates = version(2, vec![in_set(res("a1", "2", &[]), "setA")]);
    let applied = h
        .scheduler
        .new_partial_version(PartialVersion::new(updates, []))
        .unwrap();
    assert_eq!(applied.changed, 1);
    h.settle();

    let after: Vec<String> = h.script.started()[before..].to_vec();
    assert_eq!(after, ["a1"]);
    assert_eq!(h.scheduler.resource_count(), 3);
    assert_eq!(h.scheduler.version(), Some(2));
}

#[test]
fn test_at_most_one_deploy_in_flight_per_resource() {
    let h = Harness::with_options(SchedulerOptions {
        max_concurrency_per_agent: 2,
        executor_timeout: Some(Duration::from_secs(5)),
        deploy_interval: None,
        repair_interval: None,
    });
    let names: Vec<String> = (0..6).map(|i| format!("r{i}")).collect();
    for name in &names {
        h.script.delay(name, Duration::from_millis(30));
    }
    h.apply(version(1, names.iter().map(|n| res(n, "x", &[])).collect()));

    h.script.wait_for_start("r0");
    for _ in 0..5 {
        h.scheduler
            .deploy_resource(&rid("r0"), TaskPriority::UserDeploy)
            .unwrap();
    }
    h.settle();

    assert_eq!(*h.script.max_in_flight_per_resource.lock().unwrap(), 1);
    assert!(*h.script.max_in_flight_total.lock().unwrap() <= 2);
    let r0_runs = h.script.started().iter().filter(|n| *n == "r0").count();
    // requests made while r0 was in flight coalesce into one follow-up deploy
    assert_eq!(r0_runs, 2);
}

#[test]
fn test_stale_result_is_discarded_and_redeployed() {
    let h = Harness::new();
    h.script.delay("key1", Duration::from_millis(150));
    h.apply(version(1, vec![res("key1", "a", &[])]));
    h.script.wait_for_start("key1");

    h.apply(version(2, vec![res("key1", "b", &[])]));
    h.settle();

    let hashes: Vec<String> = h
        .script
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Start(_, hash) => Some(hash),
            Event::End(_) => None,
        })
        .collect();
    assert_eq!(hashes.len(), 2);
    assert_ne!(hashes[0], hashes[1]);

    let summary = h.scheduler.summary();
    assert_eq!(summary.stale, 1);
    assert_eq!(summary.deployed, 1);
    assert_eq!(h.state("key1").compliance, Compliance::Compliant);
}

#[test]
fn test_undefined_resources_are_never_deployed() {
    let h = Harness::new();
    let mut undefined = res("key1", "a", &[]);
    undefined.undefined = true;
    let applied = h.apply(version(
        1,
        vec![undefined, res("key2", "b", &["key1"]), res("key3", "c", &[])],
    ));
    assert_eq!(applied.scheduled, 1);
    h.settle();

    assert_eq!(h.script.started(), ["key3"]);
    assert_eq!(h.state("key1").blocked, Blocked::Blocked);
    assert_eq!(h.state("key1").compliance, Compliance::Undefined);
    assert_eq!(h.state("key2").blocked, Blocked::Blocked);

    assert_eq!(h.scheduler.deploy(TaskPriority::UserDeploy), 0);
    assert_eq!(h.scheduler.repair(TaskPriority::UserRepair), 1);
    h.settle();
    assert_eq!(h.script.started(), ["key3", "key3"]);
}

#[test]
fn test_executor_timeout_is_a_failed_deploy() {
    let h = Harness::with_options(SchedulerOptions {
        max_concurrency_per_agent: 1,
        executor_timeout: Some(Duration::from_millis(50)),
        deploy_interval: None,
        repair_interval: None,
    });
    h.script.delay("key1", Duration::from_secs(2));
    h.apply(version(1, vec![res("key1", "a", &[]), res("key2", "b", &[])]));
    h.settle();

    let key1 = h.state("key1");
    assert_eq!(key1.last_deploy_result, DeployResult::Failed);
    assert_eq!(key1.compliance, Compliance::NonCompliant);
    assert_eq!(h.state("key2").compliance, Compliance::Compliant);
    assert_eq!(h.scheduler.summary().failed, 1);

    let done = h.recorder.done.lock().unwrap().clone();
    assert!(done.contains(&("key1".into(), HandlerResourceState::Unavailable)));
}

#[test]
fn test_deploy_and_repair_triggers() {
    let h = Harness::new();
    h.script.fail("key3");
    h.apply(chain(1, "b"));
    h.settle();
    assert_eq!(h.script.started().len(), 3);

    h.script.heal("key3");
    assert_eq!(h.scheduler.deploy(TaskPriority::UserDeploy), 1);
    h.settle();
    assert_eq!(h.script.started().last().map(String::as_str), Some("key3"));

    assert_eq!(h.scheduler.deploy(TaskPriority::UserDeploy), 0);
    assert_eq!(h.scheduler.repair(TaskPriority::UserRepair), 3);
    h.settle();
    assert_eq!(h.script.started().len(), 7);
    assert_eq!(h.script.started()[4..], ["key1", "key2", "key3"]);
}

#[test]
fn test_dryrun_reports_without_changing_state() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.settle();
    let summary = h.scheduler.summary();

    let dry_run_id = Uuid::new_v4();
    assert_eq!(h.scheduler.dryrun(dry_run_id, 1).unwrap(), 3);
    h.settle();

    assert_eq!(*h.script.dry_runs.lock().unwrap(), 3);
    let results = h.recorder.dry_runs.lock().unwrap().clone();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(id, _)| *id == dry_run_id));
    assert_eq!(h.scheduler.summary(), summary);
    assert_eq!(h.script.started().len(), 3);

    assert!(matches!(
        h.scheduler.dryrun(Uuid::new_v4(), 9),
        Err(Error::UnknownVersion(9))
    ));
}

#[test]
fn test_get_facts_reaches_persistence() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.scheduler.get_facts(&rid("key2")).unwrap();
    h.settle();

    let facts = h.recorder.facts.lock().unwrap().clone();
    assert_eq!(facts[&rid("key2")]["name"], json!("key2"));

    let unknown = ResourceId::new("test::Resource", "agent1", "key", "nope").unwrap();
    assert!(matches!(
        h.scheduler.get_facts(&unknown),
        Err(Error::UnknownResource(_))
    ));
}

#[test]
fn test_timers_are_armed_after_deploy() {
    let h = Harness::with_options(SchedulerOptions {
        max_concurrency_per_agent: 2,
        executor_timeout: Some(Duration::from_secs(5)),
        deploy_interval: Some(Duration::from_secs(3600)),
        repair_interval: Some(Duration::from_secs(3600)),
    });
    h.script.fail("key2");
    h.apply(version(1, vec![res("key1", "a", &[]), res("key2", "b", &[])]));
    h.settle();

    assert_eq!(
        h.scheduler.pending_timer(&rid("key1")),
        Some(TaskPriority::IntervalRepair)
    );
    assert_eq!(
        h.scheduler.pending_timer(&rid("key2")),
        Some(TaskPriority::IntervalDeploy)
    );
}

#[test]
fn test_repair_timer_fires() {
    let h = Harness::with_options(SchedulerOptions {
        max_concurrency_per_agent: 1,
        executor_timeout: Some(Duration::from_secs(5)),
        deploy_interval: None,
        repair_interval: Some(Duration::from_millis(50)),
    });
    h.apply(version(1, vec![res("key1", "a", &[])]));

    for _ in 0..400 {
        if h.script.started().len() >= 2 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(h.script.started().len() >= 2);
}

#[test]
fn test_removed_resource_is_purged() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.settle();

    let applied = h.apply(version(2, vec![res("key1", "a", &[])]));
    assert_eq!(applied.removed, 2);
    assert_eq!(applied.scheduled, 0);
    assert!(h.scheduler.resource_state(&rid("key2")).is_none());
    assert_eq!(h.scheduler.status_report().len(), 1);
}

#[test]
fn test_temporarily_blocked_resources_get_no_timer() {
    let h = Harness::with_options(SchedulerOptions {
        max_concurrency_per_agent: 2,
        executor_timeout: Some(Duration::from_secs(5)),
        deploy_interval: Some(Duration::from_secs(3600)),
        repair_interval: Some(Duration::from_secs(3600)),
    });
    h.script.fail("key1");
    h.apply(chain(1, "b"));
    h.settle();

    assert_eq!(
        h.scheduler.pending_timer(&rid("key1")),
        Some(TaskPriority::IntervalDeploy)
    );
    for name in ["key2", "key3"] {
        assert_eq!(h.state(name).blocked, Blocked::TemporarilyBlocked, "{name}");
        assert_eq!(h.scheduler.pending_timer(&rid(name)), None, "{name}");
    }
}

// ============================================================================
// Agents and version brackets
// ============================================================================

fn is_compliant(h: &Harness, id: &ResourceId) -> bool {
    h.scheduler
        .resource_state(id)
        .is_some_and(|s| s.compliance == Compliance::Compliant)
}

#[test]
fn test_slow_open_version_does_not_stall_scheduler() {
    let h = Harness::new();
    h.script.delay_open("agent1", Duration::from_millis(1500));
    h.apply(version(
        1,
        vec![res("a1", "x", &[]), res_on("agent2", "b1", "x", &[])],
    ));
    wait_until("agent1 to open a version", || {
        h.script.opening.lock().unwrap().iter().any(|a| a == "agent1")
    });

    let asked = Instant::now();
    assert_eq!(h.scheduler.resource_count(), 2);
    let applied = h.apply(version(
        2,
        vec![
            res("a1", "x", &[]),
            res("a2", "y", &[]),
            res_on("agent2", "b1", "x", &[]),
        ],
    ));
    assert_eq!(applied.added, 1);
    assert!(asked.elapsed() < Duration::from_millis(500));

    wait_until("b1 to converge", || is_compliant(&h, &rid_on("agent2", "b1")));
    assert!(!h.script.started().iter().any(|n| n == "a1"));

    h.settle();
    assert!(is_compliant(&h, &rid("a1")));
    assert!(is_compliant(&h, &rid("a2")));
}

#[test]
fn test_hanging_agent_does_not_block_other_agents() {
    let h = Harness::new();
    h.script.delay("a1", Duration::from_secs(1));
    h.apply(version(
        1,
        vec![
            res("a1", "x", &[]),
            res_on("agent2", "b1", "x", &[]),
            res_on("agent2", "b2", "x", &["b1"]),
        ],
    ));
    h.script.wait_for_start("a1");

    wait_until("agent2 to converge", || {
        is_compliant(&h, &rid_on("agent2", "b2"))
    });
    assert!(!h.script.events().contains(&Event::End("a1".into())));

    h.settle();
    assert_eq!(h.scheduler.summary().deployed, 3);
}

#[test]
fn test_unreachable_agent_does_not_stop_other_agents() {
    let h = Harness::new();
    h.script.break_agent("agent1");
    h.apply(version(
        1,
        vec![
            res("a1", "x", &[]),
            res("a2", "x", &["a1"]),
            res_on("agent2", "b1", "x", &[]),
            res_on("agent2", "b2", "x", &["b1"]),
        ],
    ));
    h.settle();

    assert_eq!(h.script.started(), ["b1", "b2"]);
    let summary = h.scheduler.summary();
    assert_eq!(summary.deployed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(h.state("a1").last_deploy_result, DeployResult::Failed);
    assert_eq!(h.state("a2").blocked, Blocked::TemporarilyBlocked);
    assert!(is_compliant(&h, &rid_on("agent2", "b2")));
}

#[test]
fn test_new_version_closes_and_reopens() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.settle();
    h.apply(chain(2, "b2"));
    h.settle();

    assert_eq!(*h.script.opened.lock().unwrap(), vec![1, 2]);
    assert_eq!(*h.script.closed.lock().unwrap(), vec![1]);
}

#[test]
fn test_open_versions_only_move_forward() {
    let h = Harness::new();
    let names: Vec<String> = (0..8).map(|i| format!("r{i}")).collect();
    for name in &names {
        h.script.delay(name, Duration::from_millis(20));
    }
    for v in 1..=3 {
        let value = v.to_string();
        h.apply(version(
            v,
            names
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    // every version changes half of the resources
                    let changed = (i as u64 + v) % 2 == 0;
                    res(n, if changed { value.as_str() } else { "base" }, &[])
                })
                .collect(),
        ));
        thread::sleep(Duration::from_millis(5));
    }
    h.settle();

    let opened = h.script.opened.lock().unwrap().clone();
    assert!(!opened.is_empty());
    assert!(
        opened.windows(2).all(|w| w[0] < w[1]),
        "versions opened out of order: {opened:?}"
    );
    assert_eq!(opened.last(), Some(&3));
}

// ============================================================================
// Restoring an earlier run
// ============================================================================

fn recorded_states(h: &Harness) -> Vec<RecordedState> {
    let current = h.scheduler.current_version();
    current
        .resources
        .iter()
        .filter_map(|(id, details)| {
            Some(RecordedState {
                resource: id.clone(),
                attribute_hash: details.attribute_hash.clone(),
                state: h.scheduler.resource_state(id)?,
            })
        })
        .collect()
}

fn previous_run(model: ModelVersion, failing: &[&str]) -> Vec<RecordedState> {
    let h = Harness::new();
    for name in failing {
        h.script.fail(name);
    }
    h.apply(model);
    h.settle();
    recorded_states(&h)
}

#[test]
fn test_restored_run_redeploys_only_what_did_not_converge() {
    let recorded = previous_run(chain(1, "b"), &["key3"]);

    let h = Harness::new();
    assert_eq!(h.scheduler.restore(chain(1, "b"), recorded).unwrap(), 3);
    assert_eq!(h.scheduler.version(), Some(1));
    assert_eq!(h.state("key1").compliance, Compliance::Compliant);
    assert_eq!(h.state("key3").last_deploy_result, DeployResult::Failed);

    assert_eq!(h.apply(chain(1, "b")).scheduled, 0);
    assert_eq!(h.scheduler.deploy(TaskPriority::UserDeploy), 1);
    h.settle();
    assert_eq!(h.script.started(), ["key3"]);
}

#[test]
fn test_restored_run_keeps_changed_intent_dirty() {
    let recorded = previous_run(chain(1, "b"), &[]);

    let h = Harness::new();
    assert_eq!(h.scheduler.restore(chain(2, "changed"), recorded).unwrap(), 2);
    assert_eq!(h.state("key2").compliance, Compliance::HasUpdate);
    assert!(h.script.started().is_empty());

    assert_eq!(h.scheduler.deploy(TaskPriority::UserDeploy), 1);
    h.settle();
    assert_eq!(h.script.started(), ["key2"]);
}

#[test]
fn test_restore_after_a_version_is_rejected() {
    let h = Harness::new();
    h.apply(chain(1, "b"));
    h.settle();

    let err = h.scheduler.restore(chain(1, "b"), Vec::new()).unwrap_err();
    assert!(matches!(err, Error::VersionRejected { version: 1, .. }));
    assert_eq!(h.scheduler.resource_count(), 3);
}
