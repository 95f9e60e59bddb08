//! Command implementations

pub mod deploy;
pub mod dryrun;
pub mod history;
pub mod status;
pub mod validate;

use crate::Context;
use crate::handler::HandlerManager;
use anyhow::{Context as _, Result};
use deploykit::{ModelSource, ModelVersion, ResourceScheduler, StateUpdateManager, VersionHistory};
use ledger::{Ledger, StatusRecord};
use std::sync::Arc;

/// Open the configured ledger
pub fn open_ledger(ctx: &Context) -> Result<Ledger> {
    let path = ctx.config.ledger_path()?;
    log::debug!("Using ledger {}", path.display());
    Ledger::open(&path).with_context(|| format!("Could not open ledger {}", path.display()))
}

/// Versions staged by this process, then those the ledger recorded
struct SessionModels {
    staged: Arc<VersionHistory>,
    ledger: Arc<Ledger>,
}

impl ModelSource for SessionModels {
    fn get_version(&self, version: u64) -> Result<Arc<ModelVersion>> {
        self.staged
            .get_version(version)
            .or_else(|_| self.ledger.get_version(version))
    }
}

/// A running scheduler wired to the process handlers and the ledger
pub struct Session {
    pub scheduler: ResourceScheduler,
    pub ledger: Arc<Ledger>,
    /// Versions known to this process only, such as dry-run targets
    pub staged: Arc<VersionHistory>,
}

impl Session {
    /// Start a scheduler that continues from the last recorded version
    pub fn start(ctx: &Context) -> Result<Self> {
        let ledger = Arc::new(open_ledger(ctx)?);
        let staged = Arc::new(VersionHistory::new());
        let scheduler = ResourceScheduler::new(
            ctx.config.scheduler.options(),
            Arc::new(HandlerManager::new(ctx.config.handlers.clone())),
            Arc::clone(&ledger) as Arc<dyn StateUpdateManager>,
            Arc::new(SessionModels {
                staged: Arc::clone(&staged),
                ledger: Arc::clone(&ledger),
            }),
        );

        if let Some(model) = ledger.latest_version()? {
            let version = model.version;
            let recorded = ledger
                .statuses()?
                .into_iter()
                .map(StatusRecord::into_recorded)
                .collect();
            let restored = scheduler
                .restore(model, recorded)
                .with_context(|| format!("Could not restore version {version}"))?;
            log::debug!("Continuing from version {version} ({restored} resource states restored)");
        }

        scheduler.start()?;
        Ok(Self {
            scheduler,
            ledger,
            staged,
        })
    }

    /// Stop the scheduler and wait for its workers
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.scheduler.join();
    }
}
