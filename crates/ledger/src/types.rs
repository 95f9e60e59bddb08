//! Data types for the ledger crate

use chrono::{DateTime, Utc};
use deploykit::{
    AttributeChange, Blocked, Change, Compliance, DeployResult, RecordedState, ResourceId,
    ResourceState, ResourceVersionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle of a recorded deploy action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Started, no result yet
    InProgress,
    Deployed,
    Skipped,
    SkippedForDependency,
    Failed,
    Unavailable,
}

impl From<deploykit::HandlerResourceState> for ActionStatus {
    fn from(state: deploykit::HandlerResourceState) -> Self {
        use deploykit::HandlerResourceState as H;
        match state {
            H::Deployed => Self::Deployed,
            H::Skipped => Self::Skipped,
            H::SkippedForDependency => Self::SkippedForDependency,
            H::Failed => Self::Failed,
            H::Unavailable => Self::Unavailable,
        }
    }
}

/// One deploy action of a resource
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub action_id: Uuid,
    pub resource_version_id: ResourceVersionId,
    pub status: ActionStatus,
    pub change: Change,
    pub changes: BTreeMap<String, AttributeChange>,
    pub messages: Vec<String>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl ActionRecord {
    /// Time the action took, if it finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished? - self.started?)
    }
}

/// Persisted status of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub resource: ResourceId,
    pub version: u64,
    pub attribute_hash: String,
    pub compliance: Compliance,
    pub last_deploy_result: DeployResult,
    pub blocked: Blocked,
    pub last_deployed: Option<DateTime<Utc>>,
}

impl StatusRecord {
    /// The record as scheduler state, for restoring a later run
    pub fn into_recorded(self) -> RecordedState {
        RecordedState {
            resource: self.resource,
            attribute_hash: self.attribute_hash,
            state: ResourceState {
                compliance: self.compliance,
                last_deploy_result: self.last_deploy_result,
                blocked: self.blocked,
                last_deployed: self.last_deployed,
            },
        }
    }
}

/// Number of resources per compliance state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub compliant: u64,
    pub has_update: u64,
    pub non_compliant: u64,
    pub undefined: u64,
}

impl StatusCounts {
    pub fn add(&mut self, compliance: Compliance, count: u64) {
        match compliance {
            Compliance::Compliant => self.compliant += count,
            Compliance::HasUpdate => self.has_update += count,
            Compliance::NonCompliant => self.non_compliant += count,
            Compliance::Undefined => self.undefined += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.compliant + self.has_update + self.non_compliant + self.undefined
    }
}

/// Stored dry-run result for one resource
#[derive(Debug, Clone, Serialize)]
pub struct DryRunRecord {
    pub dry_run_id: Uuid,
    pub resource_version_id: ResourceVersionId,
    pub changes: BTreeMap<String, AttributeChange>,
    pub messages: Vec<String>,
    pub recorded: Option<DateTime<Utc>>,
}
