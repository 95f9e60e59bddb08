use super::open_ledger;
use crate::Context;
use crate::ui;
use anyhow::{Context as _, Result};
use colored::Colorize;
use deploykit::ResourceId;
use ledger::ActionStatus;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn run(ctx: &Context, resource: &str, limit: usize) -> Result<()> {
    let id: ResourceId = resource
        .parse()
        .with_context(|| format!("Invalid resource id '{resource}'"))?;
    let ledger = open_ledger(ctx)?;
    let actions = ledger.actions_for(&id, limit)?;

    ui::header(&ui::truncate_start(id.as_str(), 72));
    if actions.is_empty() {
        ui::info("No recorded actions");
        return Ok(());
    }

    for action in &actions {
        let started = action.started.map_or_else(
            || "-".to_string(),
            |t| t.with_timezone(&chrono::Local).format(TIME_FORMAT).to_string(),
        );
        let duration = action
            .duration()
            .map(ui::format_duration)
            .unwrap_or_default();
        println!(
            "  {}  {:>6}  {}  {}",
            started.dimmed(),
            format!("v{}", action.resource_version_id.version),
            ui::status_label(action.status),
            duration.dimmed()
        );

        let show_messages = ctx.verbose > 0
            || matches!(action.status, ActionStatus::Failed | ActionStatus::Unavailable);
        if show_messages {
            for message in &action.messages {
                ui::dim(&format!("    {message}"));
            }
        }
    }
    Ok(())
}
