//! # Deploykit
//!
//! Deploy scheduling for versioned, declarative desired state.
//!
//! A model version maps resource ids to desired attributes plus a requires
//! graph. The scheduler keeps the latest version in memory, works out which
//! resources need a deploy, and dispatches them to per-agent executors in
//! dependency order.
//!
//! ## Core Concepts
//!
//! - **ResourceId**: `<entity_type>[<agent>,<attribute>=<value>]`, stable across versions
//! - **ModelVersion / PartialVersion**: full snapshots and resource-set scoped updates
//! - **ModelState**: one `ResourceState` per resource, plus the requires/provides index
//! - **AgentQueue**: per-agent priority queue, at most one in-flight task per resource
//! - **ResourceScheduler**: version intake and the deploy, repair, dry-run and fact triggers
//! - **Executor / StateUpdateManager**: injected collaborators doing the work and recording it
//!
//! ## Example
//!
//! ```ignore
//! use deploykit::{ModelVersion, ResourceScheduler, SchedulerOptions, TaskPriority};
//!
//! let scheduler = ResourceScheduler::new(
//!     SchedulerOptions::default(),
//!     executors,
//!     persistence,
//!     history,
//! );
//! scheduler.start()?;
//! scheduler.new_version(ModelVersion::from_records(1, records)?)?;
//! scheduler.wait_until_idle(std::time::Duration::from_secs(60));
//! println!("{:?}", scheduler.summary());
//! ```

mod dispatch;
mod error;
mod executor;
mod id;
mod model;
mod persistence;
mod queue;
mod requires;
mod scheduler;
mod state;
mod timers;
mod types;
mod work;

pub use error::{Error, ExecutorError, Result};
pub use executor::{
    CancellationToken, DeployIntent, Executor, ExecutorManager, call_with_timeout,
};
pub use id::{ResourceId, ResourceVersionId};
pub use model::{
    Attributes, ModelSource, ModelVersion, PartialVersion, ResourceDetails, ResourceRecord,
    VersionHistory, attribute_hash,
};
pub use persistence::{NoPersistence, StateUpdateManager};
pub use queue::{AgentQueue, Lane, QueuedTask, Task, TaskKey};
pub use requires::{RequiresDelta, RequiresProvides, validate_requires};
pub use scheduler::{ResourceScheduler, VersionApplied};
pub use state::{DeployApplied, ModelState, RecordedState, ResourceState, VersionDiff};
pub use timers::{TimerCallback, TimerManager};
pub use types::{
    AttributeChange, Blocked, Change, Compliance, DeployReport, DeployResult, DeployStatus,
    DeploySummary, DryRunResult, Facts, HandlerResourceState, ResourceStatus, SchedulerOptions,
    TaskPriority,
};
pub use work::{BlockedDeploy, ScheduledWork};
