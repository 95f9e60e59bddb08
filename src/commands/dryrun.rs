use super::Session;
use crate::Context;
use crate::ui;
use crate::version_file::{Intake, VersionFile};
use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on waiting for dry-run handlers
const DRYRUN_TIMEOUT: Duration = Duration::from_secs(3600);

/// Dry run a version file, or a version an earlier deploy recorded
pub fn run(ctx: &Context, file: Option<&Path>, recorded: Option<u64>) -> Result<()> {
    let session = Session::start(ctx)?;
    let dry_run_id = Uuid::new_v4();
    let queued = stage(&session, file, recorded).and_then(|version| {
        let queued = session.scheduler.dryrun(dry_run_id, version)?;
        Ok((version, queued))
    });
    let finished = queued.is_ok() && session.scheduler.wait_until_idle(DRYRUN_TIMEOUT);
    session.shutdown();
    let (version, queued) = queued?;

    ui::header(&format!("Dry run of version {version}"));
    ui::kv("Dry run", &dry_run_id.to_string());
    ui::kv("Resources", &queued.to_string());
    if !finished {
        ui::warn("Timed out waiting for dry-run results");
    }

    let results = session.ledger.dryrun_results(dry_run_id)?;
    let mut changed = 0;
    for result in &results {
        if result.changes.is_empty() {
            if ctx.verbose > 0 {
                ui::dim(&format!("{}: no changes", result.resource_version_id.id));
            }
        } else {
            changed += 1;
            ui::section(result.resource_version_id.id.as_str());
            for (attribute, change) in &result.changes {
                println!(
                    "  {}: {} → {}",
                    attribute,
                    change.current.to_string().red(),
                    change.desired.to_string().green()
                );
            }
        }
        for message in &result.messages {
            ui::dim(message);
        }
    }

    println!();
    if results.len() < queued {
        ui::warn(&format!("{} resources reported no result", queued - results.len()));
    }
    ui::info(&format!("{changed} of {} resources would change", results.len()));
    Ok(())
}

/// Make the version to dry run available, returning its number
///
/// A partial file is merged into the last recorded version.
fn stage(session: &Session, file: Option<&Path>, recorded: Option<u64>) -> Result<u64> {
    if let Some(version) = recorded {
        return Ok(version);
    }
    let Some(file) = file else {
        anyhow::bail!("Either a version file or --model-version is required");
    };
    let model = match VersionFile::load(file)?.into_intake()? {
        Intake::Full(model) => model,
        Intake::Partial(partial) => partial.merge_into(&session.scheduler.current_version())?,
    };
    let version = model.version;
    session.staged.record(Arc::new(model));
    Ok(version)
}
