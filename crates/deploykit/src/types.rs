//! Core types for resource deploy scheduling

use crate::id::{ResourceId, ResourceVersionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Resource status
// ============================================================================

/// Whether a resource's last known state matches its desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compliance {
    /// Last deploy of the current intent succeeded
    Compliant,
    /// The intent changed since the last successful deploy
    HasUpdate,
    /// The last deploy of the current intent did not succeed
    NonCompliant,
    /// Attributes depend on an unknown value
    Undefined,
}

impl Compliance {
    /// Whether the resource needs a deploy to converge
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::HasUpdate | Self::NonCompliant)
    }
}

/// Outcome of the most recent deploy, regardless of intent changes since
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployResult {
    New,
    Deployed,
    Failed,
    Skipped,
}

impl From<HandlerResourceState> for DeployResult {
    fn from(state: HandlerResourceState) -> Self {
        match state {
            HandlerResourceState::Deployed => Self::Deployed,
            HandlerResourceState::Skipped | HandlerResourceState::SkippedForDependency => {
                Self::Skipped
            }
            HandlerResourceState::Failed | HandlerResourceState::Unavailable => Self::Failed,
        }
    }
}

/// Whether a resource may be deployed at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Blocked {
    /// Undefined, or transitively requires an undefined resource
    Blocked,
    NotBlocked,
    /// Skipped because a requirement failed; lifted when it recovers
    TemporarilyBlocked,
}

impl Blocked {
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked)
    }
}

/// Resource state as reported by handler code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerResourceState {
    Deployed,
    Skipped,
    SkippedForDependency,
    Failed,
    Unavailable,
}

// ============================================================================
// Priorities
// ============================================================================

/// Task priority, lower sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    UserDeploy,
    NewVersionDeploy,
    UserRepair,
    IntervalDeploy,
    IntervalRepair,
    DryRun,
    FactRefresh,
}

impl TaskPriority {
    /// Reason string handed to the executor
    pub fn reason(self) -> &'static str {
        match self {
            Self::UserDeploy => "user requested deploy",
            Self::NewVersionDeploy => "new version released",
            Self::UserRepair => "user requested repair",
            Self::IntervalDeploy => "periodic deploy",
            Self::IntervalRepair => "periodic repair",
            Self::DryRun => "dry run",
            Self::FactRefresh => "fact refresh",
        }
    }
}

// ============================================================================
// Deploy reports
// ============================================================================

/// Kind of change a deploy made
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    #[default]
    Nochange,
    Created,
    Purged,
    Updated,
}

/// Change of one attribute between current and desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub current: serde_json::Value,
    pub desired: serde_json::Value,
}

/// Structured result of one executor deploy call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReport {
    pub resource_version_id: ResourceVersionId,
    pub action_id: Uuid,
    pub resource_state: HandlerResourceState,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub changes: BTreeMap<String, AttributeChange>,
    #[serde(default)]
    pub change: Change,
}

impl DeployReport {
    /// Report for a deploy that never reached handler code
    pub fn undeployable(
        resource_version_id: ResourceVersionId,
        action_id: Uuid,
        resource_state: HandlerResourceState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource_version_id,
            action_id,
            resource_state,
            messages: vec![message.into()],
            changes: BTreeMap::new(),
            change: Change::Nochange,
        }
    }

    pub fn has_change(&self) -> bool {
        self.change != Change::Nochange || !self.changes.is_empty()
    }
}

/// Result of a dry run for one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunResult {
    pub resource_version_id: ResourceVersionId,
    #[serde(default)]
    pub changes: BTreeMap<String, AttributeChange>,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// Facts collected for a resource
pub type Facts = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Summary
// ============================================================================

/// Outcome of a deploy task as counted in the summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Deployed,
    Failed,
    Skipped,
    SkippedForUndefined,
    Cancelled,
    /// Result discarded because the intent changed while in flight
    Stale,
}

/// Counts of deploy outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySummary {
    pub deployed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub skipped_for_undefined: usize,
    pub cancelled: usize,
    pub stale: usize,
}

impl DeploySummary {
    /// Check if every finished deploy succeeded
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.skipped_for_undefined == 0
    }

    /// Total number of finished deploy tasks
    pub fn total(&self) -> usize {
        self.deployed
            + self.failed
            + self.skipped
            + self.skipped_for_undefined
            + self.cancelled
            + self.stale
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &DeploySummary) {
        self.deployed += other.deployed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.skipped_for_undefined += other.skipped_for_undefined;
        self.cancelled += other.cancelled;
        self.stale += other.stale;
    }

    /// Count one outcome
    pub fn add(&mut self, status: DeployStatus) {
        match status {
            DeployStatus::Deployed => self.deployed += 1,
            DeployStatus::Failed => self.failed += 1,
            DeployStatus::Skipped => self.skipped += 1,
            DeployStatus::SkippedForUndefined => self.skipped_for_undefined += 1,
            DeployStatus::Cancelled => self.cancelled += 1,
            DeployStatus::Stale => self.stale += 1,
        }
    }
}

/// Snapshot of one resource for status listings
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub id: ResourceId,
    pub compliance: Compliance,
    pub last_deploy_result: DeployResult,
    pub blocked: Blocked,
}

// ============================================================================
// Options
// ============================================================================

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Simultaneous in-flight deploys per agent
    pub max_concurrency_per_agent: usize,
    /// Bound on each executor call; `None` waits indefinitely
    pub executor_timeout: Option<Duration>,
    /// Retry delay for resources that did not converge; `None` disables
    pub deploy_interval: Option<Duration>,
    /// Repair period for compliant resources; `None` disables
    pub repair_interval: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency_per_agent: 4,
            executor_timeout: Some(Duration::from_secs(600)),
            deploy_interval: Some(Duration::from_secs(600)),
            repair_interval: Some(Duration::from_secs(86_400)),
        }
    }
}
