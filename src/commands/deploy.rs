use super::Session;
use crate::Context;
use crate::cli::DeployArgs;
use crate::ui;
use crate::version_file::{Intake, VersionFile};
use anyhow::Result;
use deploykit::{Blocked, TaskPriority};
use std::time::Duration;

pub fn run(ctx: &Context, args: DeployArgs) -> Result<()> {
    let intake = VersionFile::load(&args.file)?.into_intake()?;
    ui::header(&format!("Deploying version {}", intake.version()));

    let session = Session::start(ctx)?;
    let result = deploy(ctx, &session, intake, &args);
    session.shutdown();
    result
}

fn deploy(ctx: &Context, session: &Session, intake: Intake, args: &DeployArgs) -> Result<()> {
    let scheduler = &session.scheduler;
    let applied = match intake {
        Intake::Full(model) => scheduler.new_version(model)?,
        Intake::Partial(partial) => scheduler.new_partial_version(partial)?,
    };
    let current = scheduler.current_version();
    session.ledger.record_version(&current)?;

    ui::kv("Added", &applied.added.to_string());
    ui::kv("Changed", &applied.changed.to_string());
    ui::kv("Removed", &applied.removed.to_string());

    let triggered = if args.repair {
        scheduler.repair(TaskPriority::UserRepair)
    } else {
        scheduler.deploy(TaskPriority::UserDeploy)
    };
    log::debug!("{triggered} resources triggered");

    if args.facts {
        for id in current.resources.keys() {
            if !current.undefined.contains(id) {
                scheduler.get_facts(id)?;
            }
        }
    }

    let finished = scheduler.wait_until_idle(Duration::from_secs(args.timeout));
    let summary = scheduler.take_summary();
    ui::summary(&summary);

    let blocked: Vec<_> = scheduler
        .status_report()
        .into_iter()
        .filter(|s| s.blocked == Blocked::Blocked)
        .collect();
    if !blocked.is_empty() {
        ui::section("Blocked on undefined values");
        for status in &blocked {
            ui::dim(status.id.as_str());
        }
    }

    if !finished {
        anyhow::bail!("Timed out after {}s waiting for deploys to finish", args.timeout);
    }
    if !summary.is_success() {
        anyhow::bail!(
            "{} failed, {} skipped",
            summary.failed,
            summary.skipped + summary.skipped_for_undefined
        );
    }
    if !ctx.quiet {
        println!();
        ui::success("All resources converged");
    }
    Ok(())
}
