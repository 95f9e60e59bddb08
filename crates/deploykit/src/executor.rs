//! Executor collaborator traits
//!
//! Executors perform the actual work for one agent. The scheduler never calls
//! them while holding its own locks, and every call may be bounded by a
//! timeout and observed through a cancellation token.

use crate::error::ExecutorError;
use crate::id::{ResourceId, ResourceVersionId};
use crate::model::ResourceDetails;
use crate::types::{DeployReport, DeployResult, DryRunResult, Facts};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Everything an executor needs to deploy one resource
#[derive(Debug, Clone)]
pub struct DeployIntent {
    pub action_id: Uuid,
    pub version: u64,
    pub details: Arc<ResourceDetails>,
    /// Last deploy result of each requirement at deploy start
    pub dependencies: HashMap<ResourceId, DeployResult>,
    pub started: DateTime<Utc>,
}

impl DeployIntent {
    pub fn resource_version_id(&self) -> ResourceVersionId {
        self.details.id.with_version(self.version)
    }
}

/// Cooperative cancellation flag shared with an executor call
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs handler code for the resources of one agent
pub trait Executor: Send + Sync {
    /// Deploy one resource
    ///
    /// # Arguments
    /// * `generation` - Id of the scheduling run that produced this task
    /// * `intent` - The resource intent and its context
    /// * `reason` - Human readable trigger of the deploy
    /// * `cancel` - Set when the caller stopped waiting for the result
    fn execute(
        &self,
        generation: Uuid,
        intent: &DeployIntent,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, ExecutorError>;

    /// Compare resources against the live system without changing it
    fn dry_run(
        &self,
        resources: &[Arc<ResourceDetails>],
        version: u64,
        dry_run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<DryRunResult>, ExecutorError>;

    /// Collect facts for a resource
    fn get_facts(
        &self,
        details: &ResourceDetails,
        cancel: &CancellationToken,
    ) -> Result<Facts, ExecutorError>;

    /// Prepare for deploys of a version
    fn open_version(&self, version: u64, resources: &[Arc<ResourceDetails>]) -> anyhow::Result<()>;

    /// Release whatever `open_version` prepared
    fn close_version(&self, version: u64) -> anyhow::Result<()>;
}

/// Creates executors on demand, one per agent
pub trait ExecutorManager: Send + Sync {
    fn get_executor(&self, agent: &str) -> anyhow::Result<Arc<dyn Executor>>;

    /// Called once when the scheduler stops
    fn stop(&self) {}
}

/// Run an executor call on its own thread, bounded by `timeout`
///
/// On timeout the token is cancelled and the call is abandoned; its late
/// result is dropped.
pub fn call_with_timeout<T, F>(
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, ExecutorError>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Result<T, ExecutorError> + Send + 'static,
{
    let Some(timeout) = timeout else {
        return call(cancel.clone());
    };

    let (tx, rx) = mpsc::channel();
    let token = cancel.clone();
    thread::Builder::new()
        .name("executor-call".into())
        .spawn(move || {
            let _ = tx.send(call(token));
        })
        .map_err(|e| ExecutorError::Unavailable(format!("failed to spawn call thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            cancel.cancel();
            Err(ExecutorError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(ExecutorError::Handler("executor call panicked".into()))
        }
    }
}
