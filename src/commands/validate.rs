use crate::Context;
use crate::ui;
use crate::version_file::{Intake, VersionFile};
use anyhow::Result;
use std::path::Path;

pub fn run(_ctx: &Context, file: &Path) -> Result<()> {
    let intake = VersionFile::load(file)?.into_intake()?;
    let model = intake.resources();

    ui::header(&format!("Version {}", intake.version()));
    let kind = match &intake {
        Intake::Full(_) => "full",
        Intake::Partial(_) => "partial",
    };
    ui::kv("Kind", kind);
    ui::kv("Resources", &model.len().to_string());
    ui::kv(
        "Requires edges",
        &model.requires.values().map(|r| r.len()).sum::<usize>().to_string(),
    );
    if !model.undefined.is_empty() {
        ui::kv("Undefined", &model.undefined.len().to_string());
    }

    let sets = model.sets();
    if !sets.is_empty() {
        ui::section("Resource sets");
        for (name, members) in &sets {
            ui::kv(name, &members.len().to_string());
        }
    }
    if let Intake::Partial(partial) = &intake {
        for name in &partial.removed_sets {
            ui::dim(&format!("removes set {name}"));
        }
    }

    println!();
    ui::success("Version file is valid");
    Ok(())
}
