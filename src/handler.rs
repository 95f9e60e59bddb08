//! Process executor: runs one handler program per action
//!
//! A handler receives a JSON document on stdin:
//!
//! ```json
//! { "action": "deploy", "reason": "...", "version": 3,
//!   "resource": { "id": "...", "attributes": {} }, "dependencies": {} }
//! ```
//!
//! Exit code 0 means deployed, 3 means skipped, anything else failed.
//! Stdout may carry `{ "change", "changes", "facts", "messages" }`.

use crate::config::HandlerConfig;
use crate::runner::{self, Finished};
use deploykit::{
    AttributeChange, CancellationToken, Change, DeployIntent, DeployReport, DryRunResult, Executor,
    ExecutorError, ExecutorManager, Facts, HandlerResourceState, ResourceDetails,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Exit code a handler uses to report a skip
pub const EXIT_SKIPPED: i32 = 3;

/// Handler key matching every entity type
const ANY_TYPE: &str = "*";

/// What a handler may print on stdout
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerOutput {
    pub change: Option<Change>,
    pub changes: BTreeMap<String, AttributeChange>,
    pub facts: Facts,
    pub messages: Vec<String>,
}

impl HandlerOutput {
    fn parse(program: &str, stdout: &str) -> Self {
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Self::default();
        }
        match serde_json::from_str(stdout) {
            Ok(output) => output,
            Err(e) => {
                log::warn!("{program} printed invalid output: {e}");
                Self {
                    messages: vec![stdout.to_string()],
                    ..Self::default()
                }
            }
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Executor for one agent, spawning the configured handler per action
pub struct ProcessExecutor {
    agent: String,
    handlers: Arc<BTreeMap<String, HandlerConfig>>,
    /// Bindings resolved when the current version was opened
    resolved: Mutex<Option<(u64, HashMap<String, HandlerConfig>)>>,
}

impl ProcessExecutor {
    pub fn new(agent: &str, handlers: Arc<BTreeMap<String, HandlerConfig>>) -> Self {
        Self {
            agent: agent.to_string(),
            handlers,
            resolved: Mutex::new(None),
        }
    }

    fn lookup(&self, entity_type: &str) -> Option<HandlerConfig> {
        self.handlers
            .get(entity_type)
            .or_else(|| self.handlers.get(ANY_TYPE))
            .cloned()
    }

    /// Handler for an entity type, preferring the binding of the open version
    fn binding(&self, entity_type: &str) -> Result<HandlerConfig, ExecutorError> {
        let resolved = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((_, bindings)) = resolved.as_ref() {
            if let Some(handler) = bindings.get(entity_type) {
                return Ok(handler.clone());
            }
        }
        drop(resolved);
        self.lookup(entity_type).ok_or_else(|| {
            ExecutorError::Handler(format!("no handler configured for {entity_type}"))
        })
    }

    fn run(
        &self,
        details: &ResourceDetails,
        payload: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(Finished, HandlerOutput), ExecutorError> {
        let handler = self.binding(details.id.entity_type())?;
        let input = serde_json::to_vec(payload)
            .map_err(|e| ExecutorError::Handler(format!("cannot encode input: {e}")))?;
        log::debug!("Agent {}: running {} for {}", self.agent, handler.program, details.id);

        let finished = runner::run_with_input(&handler.program, &handler.args, &input, cancel)?;
        let output = HandlerOutput::parse(&handler.program, &finished.stdout);
        Ok((finished, output))
    }
}

fn resource_json(details: &ResourceDetails) -> serde_json::Value {
    json!({
        "id": details.id,
        "attribute_hash": details.attribute_hash,
        "attributes": details.attributes,
    })
}

fn stderr_messages(finished: &Finished) -> impl Iterator<Item = String> + '_ {
    finished
        .stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        _generation: Uuid,
        intent: &DeployIntent,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, ExecutorError> {
        let payload = json!({
            "action": "deploy",
            "reason": reason,
            "version": intent.version,
            "resource": resource_json(&intent.details),
            "dependencies": intent.dependencies,
        });
        let (finished, output) = self.run(&intent.details, &payload, cancel)?;

        let resource_state = match finished.code() {
            Some(0) => HandlerResourceState::Deployed,
            Some(EXIT_SKIPPED) => HandlerResourceState::Skipped,
            _ => HandlerResourceState::Failed,
        };
        let change = output.change.unwrap_or(if output.changes.is_empty() {
            Change::Nochange
        } else {
            Change::Updated
        });
        let mut messages = output.messages;
        messages.extend(stderr_messages(&finished));
        if resource_state == HandlerResourceState::Failed {
            messages.push(format!("handler exited with {}", finished.status));
        }

        Ok(DeployReport {
            resource_version_id: intent.resource_version_id(),
            action_id: intent.action_id,
            resource_state,
            messages,
            changes: output.changes,
            change,
        })
    }

    fn dry_run(
        &self,
        resources: &[Arc<ResourceDetails>],
        version: u64,
        dry_run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<DryRunResult>, ExecutorError> {
        let mut results = Vec::with_capacity(resources.len());
        for details in resources {
            let payload = json!({
                "action": "dryrun",
                "dry_run_id": dry_run_id,
                "version": version,
                "resource": resource_json(details),
            });
            let (finished, output) = self.run(details, &payload, cancel)?;
            let mut messages = output.messages;
            messages.extend(stderr_messages(&finished));
            if !finished.status.success() {
                messages.push(format!("handler exited with {}", finished.status));
            }
            results.push(DryRunResult {
                resource_version_id: details.id.with_version(version),
                changes: output.changes,
                messages,
            });
        }
        Ok(results)
    }

    fn get_facts(
        &self,
        details: &ResourceDetails,
        cancel: &CancellationToken,
    ) -> Result<Facts, ExecutorError> {
        let payload = json!({
            "action": "facts",
            "resource": resource_json(details),
        });
        let (finished, output) = self.run(details, &payload, cancel)?;
        if !finished.status.success() {
            return Err(ExecutorError::Handler(format!(
                "fact collection for {} exited with {}",
                details.id, finished.status
            )));
        }
        Ok(output.facts)
    }

    fn open_version(&self, version: u64, resources: &[Arc<ResourceDetails>]) -> anyhow::Result<()> {
        let mut bindings = HashMap::new();
        for details in resources {
            let entity_type = details.id.entity_type();
            if bindings.contains_key(entity_type) {
                continue;
            }
            match self.lookup(entity_type) {
                Some(handler) => {
                    bindings.insert(entity_type.to_string(), handler);
                }
                None => log::warn!(
                    "Agent {}: no handler for {entity_type}, its resources will fail",
                    self.agent
                ),
            }
        }
        log::debug!(
            "Agent {}: version {version} uses {} handlers",
            self.agent,
            bindings.len()
        );
        *self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((version, bindings));
        Ok(())
    }

    fn close_version(&self, version: u64) -> anyhow::Result<()> {
        let mut resolved = self
            .resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if resolved.as_ref().is_some_and(|(open, _)| *open == version) {
            *resolved = None;
        }
        Ok(())
    }
}

/// Creates a [`ProcessExecutor`] per agent from the `[handlers]` table
pub struct HandlerManager {
    handlers: Arc<BTreeMap<String, HandlerConfig>>,
}

impl HandlerManager {
    pub fn new(handlers: BTreeMap<String, HandlerConfig>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }
}

impl ExecutorManager for HandlerManager {
    fn get_executor(&self, agent: &str) -> anyhow::Result<Arc<dyn Executor>> {
        if self.handlers.is_empty() {
            anyhow::bail!("no handlers configured");
        }
        Ok(Arc::new(ProcessExecutor::new(agent, Arc::clone(&self.handlers))))
    }
}
