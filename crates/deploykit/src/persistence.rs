//! Persistence collaborator
//!
//! Status and action history updates are fire-and-forget: the scheduler logs
//! failures and carries on.

use crate::id::{ResourceId, ResourceVersionId};
use crate::state::ResourceState;
use crate::types::{DeployReport, DryRunResult, Facts};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Receives durable status updates from the scheduler
pub trait StateUpdateManager: Send + Sync {
    /// A deploy action started
    fn send_in_progress(&self, action_id: Uuid, resource: &ResourceVersionId)
    -> anyhow::Result<()>;

    /// A deploy action finished
    ///
    /// # Arguments
    /// * `attribute_hash` - Hash of the intent that was deployed
    /// * `report` - The executor's report
    /// * `state` - Resource state after the result was applied
    /// * `started` - When the action started
    /// * `finished` - When the action finished
    fn send_deploy_done(
        &self,
        attribute_hash: &str,
        report: &DeployReport,
        state: &ResourceState,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// A dry run produced a result for one resource
    fn dryrun_update(&self, dry_run_id: Uuid, result: &DryRunResult) -> anyhow::Result<()>;

    /// Facts were collected for a resource
    fn set_facts(&self, resource: &ResourceId, facts: &Facts) -> anyhow::Result<()>;
}

/// Discards every update
pub struct NoPersistence;

impl StateUpdateManager for NoPersistence {
    fn send_in_progress(
        &self,
        _action_id: Uuid,
        _resource: &ResourceVersionId,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn send_deploy_done(
        &self,
        _attribute_hash: &str,
        _report: &DeployReport,
        _state: &ResourceState,
        _started: DateTime<Utc>,
        _finished: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn dryrun_update(&self, _dry_run_id: Uuid, _result: &DryRunResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_facts(&self, _resource: &ResourceId, _facts: &Facts) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Log a failed persistence update without propagating it
pub(crate) fn log_failure(operation: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        log::error!("Failed to persist {operation}: {e:#}");
    }
}
