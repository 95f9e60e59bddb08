use super::open_ledger;
use crate::Context;
use crate::ui;
use anyhow::{Context as _, Result};
use deploykit::ResourceId;

pub fn run(ctx: &Context, resource: Option<&str>) -> Result<()> {
    let ledger = open_ledger(ctx)?;

    let Some(resource) = resource else {
        let counts = ledger.status_counts()?;
        ui::header("Resource status");
        ui::kv("Compliant", &counts.compliant.to_string());
        ui::kv("Has update", &counts.has_update.to_string());
        ui::kv("Non-compliant", &counts.non_compliant.to_string());
        ui::kv("Undefined", &counts.undefined.to_string());
        ui::kv("Total", &counts.total().to_string());
        return Ok(());
    };

    let id: ResourceId = resource
        .parse()
        .with_context(|| format!("Invalid resource id '{resource}'"))?;
    ui::header(id.as_str());
    match ledger.resource_status(&id)? {
        Some(status) => {
            ui::kv("Version", &status.version.to_string());
            ui::kv("Compliance", &format!("{:?}", status.compliance));
            ui::kv("Last result", &format!("{:?}", status.last_deploy_result));
            ui::kv("Blocked", &format!("{:?}", status.blocked));
            if let Some(at) = status.last_deployed {
                ui::kv("Last deployed", &at.with_timezone(&chrono::Local).to_rfc2822());
            }
        }
        None => ui::info("No recorded status"),
    }

    let facts = ledger.facts_for(&id)?;
    if !facts.is_empty() {
        ui::section("Facts");
        for (name, value) in &facts {
            ui::kv(name, &value.to_string());
        }
    }
    Ok(())
}
