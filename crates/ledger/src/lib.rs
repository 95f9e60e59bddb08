//! # Ledger
//!
//! Durable record of what the deploy scheduler did.
//!
//! This crate provides a SQLite-backed [`StateUpdateManager`] that stores:
//! - Every deploy action, from start to result
//! - The latest status of every resource
//! - Dry-run results, grouped by dry-run id
//! - Facts collected from resources
//! - Every applied model version, so a later run can pick up where the
//!   previous one stopped
//!
//! ## Example
//!
//! ```no_run
//! use ledger::Ledger;
//! use std::path::Path;
//!
//! let ledger = Ledger::open(Path::new("/var/lib/converge/ledger.db"))?;
//!
//! let counts = ledger.status_counts()?;
//! println!("{} of {} resources compliant", counts.compliant, counts.total());
//!
//! let id = "std::File[host1,path=/etc/motd]".parse()?;
//! for action in ledger.actions_for(&id, 10)? {
//!     println!("{} {:?}", action.resource_version_id, action.status);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod types;

pub use error::{Error, Result};
pub use types::{ActionRecord, ActionStatus, DryRunRecord, StatusCounts, StatusRecord};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use deploykit::{
    Compliance, DeployReport, DryRunResult, Facts, ModelSource, ModelVersion, ResourceId,
    ResourceRecord, ResourceState, ResourceVersionId, StateUpdateManager,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// A deploy ledger database
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open or create a ledger database at the given path
    ///
    /// Creates the database file and necessary tables if they don't exist.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS resource_action (
                id INTEGER PRIMARY KEY,
                action_id TEXT NOT NULL UNIQUE,
                resource TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                change TEXT NOT NULL DEFAULT 'nochange',
                changes TEXT NOT NULL DEFAULT '{}',
                messages TEXT NOT NULL DEFAULT '[]',
                started INTEGER,
                finished INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_action_resource ON resource_action(resource);

            CREATE TABLE IF NOT EXISTS resource_status (
                resource TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                attribute_hash TEXT NOT NULL,
                compliance TEXT NOT NULL,
                last_deploy_result TEXT NOT NULL,
                blocked TEXT NOT NULL,
                last_deployed INTEGER
            );

            CREATE TABLE IF NOT EXISTS dryrun_result (
                dry_run_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                version INTEGER NOT NULL,
                changes TEXT NOT NULL,
                messages TEXT NOT NULL,
                recorded INTEGER NOT NULL,
                PRIMARY KEY (dry_run_id, resource)
            );

            CREATE TABLE IF NOT EXISTS fact (
                resource TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated INTEGER NOT NULL,
                PRIMARY KEY (resource, name)
            );

            CREATE TABLE IF NOT EXISTS model_version (
                version INTEGER PRIMARY KEY,
                resources TEXT NOT NULL,
                applied INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record the start of a deploy action
    pub fn record_start(&self, action_id: Uuid, resource: &ResourceVersionId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO resource_action (action_id, resource, version, status, started)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(action_id) DO NOTHING",
            params![
                action_id.to_string(),
                resource.id.as_str(),
                resource.version as i64,
                enum_text(&ActionStatus::InProgress)?,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Record the result of a deploy action and the resulting resource status
    ///
    /// # Arguments
    /// * `attribute_hash` - Hash of the deployed intent
    /// * `report` - Result reported for the action
    /// * `state` - Resource state after the result was applied
    /// * `started` - When the action started
    /// * `finished` - When the action finished
    pub fn record_done(
        &self,
        attribute_hash: &str,
        report: &DeployReport,
        state: &ResourceState,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> Result<()> {
        let rvid = &report.resource_version_id;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO resource_action
                (action_id, resource, version, status, change, changes, messages, started, finished)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(action_id) DO UPDATE SET
                status = excluded.status,
                change = excluded.change,
                changes = excluded.changes,
                messages = excluded.messages,
                started = excluded.started,
                finished = excluded.finished",
            params![
                report.action_id.to_string(),
                rvid.id.as_str(),
                rvid.version as i64,
                enum_text(&ActionStatus::from(report.resource_state))?,
                enum_text(&report.change)?,
                serde_json::to_string(&report.changes)?,
                serde_json::to_string(&report.messages)?,
                started.timestamp_millis(),
                finished.timestamp_millis(),
            ],
        )?;
        tx.execute(
            "INSERT INTO resource_status
                (resource, version, attribute_hash, compliance, last_deploy_result, blocked, last_deployed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(resource) DO UPDATE SET
                version = excluded.version,
                attribute_hash = excluded.attribute_hash,
                compliance = excluded.compliance,
                last_deploy_result = excluded.last_deploy_result,
                blocked = excluded.blocked,
                last_deployed = excluded.last_deployed",
            params![
                rvid.id.as_str(),
                rvid.version as i64,
                attribute_hash,
                enum_text(&state.compliance)?,
                enum_text(&state.last_deploy_result)?,
                enum_text(&state.blocked)?,
                state.last_deployed.map(|t| t.timestamp_millis()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Store an applied version
    ///
    /// Statuses of resources the version no longer manages are dropped with
    /// it, so the recorded statuses always describe the latest version.
    pub fn record_version(&self, model: &ModelVersion) -> Result<()> {
        let managed: HashSet<&str> = model.resources.keys().map(ResourceId::as_str).collect();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO model_version (version, resources, applied)
             VALUES (?1, ?2, ?3)",
            params![
                model.version as i64,
                serde_json::to_string(&model.to_records())?,
                Utc::now().timestamp_millis(),
            ],
        )?;

        let recorded: Vec<String> = {
            let mut stmt = tx.prepare("SELECT resource FROM resource_status")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        let unmanaged: Vec<String> = recorded
            .into_iter()
            .filter(|resource| !managed.contains(resource.as_str()))
            .collect();
        for resource in &unmanaged {
            tx.execute("DELETE FROM resource_status WHERE resource = ?1", [resource])?;
        }
        tx.commit()?;

        log::debug!(
            "Recorded version {} ({} resources, {} statuses dropped)",
            model.version,
            model.resources.len(),
            unmanaged.len()
        );
        Ok(())
    }

    /// Store a dry-run result, replacing an earlier one for the same resource
    pub fn record_dryrun(&self, dry_run_id: Uuid, result: &DryRunResult) -> Result<()> {
        let rvid = &result.resource_version_id;
        self.conn().execute(
            "INSERT OR REPLACE INTO dryrun_result
                (dry_run_id, resource, version, changes, messages, recorded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                dry_run_id.to_string(),
                rvid.id.as_str(),
                rvid.version as i64,
                serde_json::to_string(&result.changes)?,
                serde_json::to_string(&result.messages)?,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Replace all facts of a resource
    pub fn record_facts(&self, resource: &ResourceId, facts: &Facts) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM fact WHERE resource = ?1", [resource.as_str()])?;
        for (name, value) in facts {
            tx.execute(
                "INSERT INTO fact (resource, name, value, updated) VALUES (?1, ?2, ?3, ?4)",
                params![resource.as_str(), name, serde_json::to_string(value)?, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Most recent actions of a resource, newest first
    pub fn actions_for(&self, resource: &ResourceId, limit: usize) -> Result<Vec<ActionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT action_id, resource, version, status, change, changes, messages, started, finished
             FROM resource_action
             WHERE resource = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let actions = stmt
            .query_map(params![resource.as_str(), limit as i64], action_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(actions)
    }

    /// Number of resources per compliance state
    pub fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT compliance, COUNT(*) FROM resource_status GROUP BY compliance")?;
        let rows = stmt.query_map([], |row| {
            let compliance: Compliance = enum_column(row, 0)?;
            let count: i64 = row.get(1)?;
            Ok((compliance, count as u64))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (compliance, count) = row?;
            counts.add(compliance, count);
        }
        Ok(counts)
    }

    /// Last persisted status of a resource
    pub fn resource_status(&self, resource: &ResourceId) -> Result<Option<StatusRecord>> {
        let status = self
            .conn()
            .query_row(
                "SELECT resource, version, attribute_hash, compliance, last_deploy_result, blocked, last_deployed
                 FROM resource_status
                 WHERE resource = ?1",
                [resource.as_str()],
                status_from_row,
            )
            .optional()?;
        Ok(status)
    }

    /// Persisted status of every resource, ordered by resource
    pub fn statuses(&self) -> Result<Vec<StatusRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT resource, version, attribute_hash, compliance, last_deploy_result, blocked, last_deployed
             FROM resource_status
             ORDER BY resource",
        )?;
        let statuses = stmt
            .query_map([], status_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(statuses)
    }

    /// A recorded version, if it was ever applied
    pub fn load_version(&self, version: u64) -> Result<Option<ModelVersion>> {
        let resources: Option<String> = self
            .conn()
            .query_row(
                "SELECT resources FROM model_version WHERE version = ?1",
                [version as i64],
                |row| row.get(0),
            )
            .optional()?;
        resources
            .map(|text| decode_version(version, &text))
            .transpose()
    }

    /// The most recently applied version
    pub fn latest_version(&self) -> Result<Option<ModelVersion>> {
        let latest: Option<(i64, String)> = self
            .conn()
            .query_row(
                "SELECT version, resources FROM model_version ORDER BY version DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        latest
            .map(|(version, text)| decode_version(version as u64, &text))
            .transpose()
    }

    /// All results of one dry run, ordered by resource
    pub fn dryrun_results(&self, dry_run_id: Uuid) -> Result<Vec<DryRunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT dry_run_id, resource, version, changes, messages, recorded
             FROM dryrun_result
             WHERE dry_run_id = ?1
             ORDER BY resource",
        )?;
        let results = stmt
            .query_map([dry_run_id.to_string()], |row| {
                let resource: ResourceId = parsed_column(row, 1)?;
                Ok(DryRunRecord {
                    dry_run_id: parsed_column(row, 0)?,
                    resource_version_id: resource.with_version(row.get::<_, i64>(2)? as u64),
                    changes: json_column(row, 3)?,
                    messages: json_column(row, 4)?,
                    recorded: time_column(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Facts last collected for a resource
    pub fn facts_for(&self, resource: &ResourceId) -> Result<Facts> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name, value FROM fact WHERE resource = ?1")?;
        let facts = stmt
            .query_map([resource.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, json_column(row, 1)?))
            })?
            .collect::<rusqlite::Result<Facts>>()?;
        Ok(facts)
    }
}

impl StateUpdateManager for Ledger {
    fn send_in_progress(&self, action_id: Uuid, resource: &ResourceVersionId) -> anyhow::Result<()> {
        self.record_start(action_id, resource)?;
        Ok(())
    }

    fn send_deploy_done(
        &self,
        attribute_hash: &str,
        report: &DeployReport,
        state: &ResourceState,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.record_done(attribute_hash, report, state, started, finished)?;
        log::debug!("Recorded action {} for {}", report.action_id, report.resource_version_id);
        Ok(())
    }

    fn dryrun_update(&self, dry_run_id: Uuid, result: &DryRunResult) -> anyhow::Result<()> {
        self.record_dryrun(dry_run_id, result)?;
        Ok(())
    }

    fn set_facts(&self, resource: &ResourceId, facts: &Facts) -> anyhow::Result<()> {
        self.record_facts(resource, facts)?;
        Ok(())
    }
}

impl ModelSource for Ledger {
    fn get_version(&self, version: u64) -> anyhow::Result<Arc<ModelVersion>> {
        let model = self
            .load_version(version)?
            .with_context(|| format!("version {version} is not in the ledger"))?;
        Ok(Arc::new(model))
    }
}

// ============================================================================
// Column conversion
// ============================================================================

fn decode_version(version: u64, text: &str) -> Result<ModelVersion> {
    let records: Vec<ResourceRecord> = serde_json::from_str(text)?;
    Ok(ModelVersion::from_records(version, records)?)
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<StatusRecord> {
    Ok(StatusRecord {
        resource: parsed_column(row, 0)?,
        version: row.get::<_, i64>(1)? as u64,
        attribute_hash: row.get(2)?,
        compliance: enum_column(row, 3)?,
        last_deploy_result: enum_column(row, 4)?,
        blocked: enum_column(row, 5)?,
        last_deployed: time_column(row, 6)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<ActionRecord> {
    let resource: ResourceId = parsed_column(row, 1)?;
    Ok(ActionRecord {
        action_id: parsed_column(row, 0)?,
        resource_version_id: resource.with_version(row.get::<_, i64>(2)? as u64),
        status: enum_column(row, 3)?,
        change: enum_column(row, 4)?,
        changes: json_column(row, 5)?,
        messages: json_column(row, 6)?,
        started: time_column(row, 7)?,
        finished: time_column(row, 8)?,
    })
}

/// Text form of a unit enum, as serde names it
fn enum_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn enum_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(text)).map_err(|e| conversion_error(idx, e))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    Ok(millis.and_then(DateTime::from_timestamp_millis))
}

// ============================================================================
// Tests
// ============================================================================
