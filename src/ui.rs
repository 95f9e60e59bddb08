use colored::{ColoredString, Colorize};
use deploykit::DeploySummary;
use ledger::ActionStatus;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Deploy output
// ============================================================================

/// Print deploy outcome counts, omitting zero rows
pub fn summary(summary: &DeploySummary) {
    section("Summary");
    let rows = [
        ("Deployed", summary.deployed, "green"),
        ("Failed", summary.failed, "red"),
        ("Skipped", summary.skipped, "yellow"),
        ("Skipped (undefined)", summary.skipped_for_undefined, "yellow"),
        ("Cancelled", summary.cancelled, "dimmed"),
        ("Stale", summary.stale, "dimmed"),
    ];
    for (label, count, color) in rows {
        if count == 0 {
            continue;
        }
        let value = count.to_string();
        let value = match color {
            "green" => value.green(),
            "red" => value.red(),
            "yellow" => value.yellow(),
            _ => value.dimmed(),
        };
        println!("  {}: {}", label.dimmed(), value);
    }
    if summary.total() == 0 {
        dim("Nothing to do");
    }
}

/// Colored label for a recorded action status
pub fn status_label(status: ActionStatus) -> ColoredString {
    match status {
        ActionStatus::InProgress => "in progress".blue(),
        ActionStatus::Deployed => "deployed".green(),
        ActionStatus::Skipped => "skipped".yellow(),
        ActionStatus::SkippedForDependency => "skipped (dependency)".yellow(),
        ActionStatus::Failed => "failed".red(),
        ActionStatus::Unavailable => "unavailable".red(),
    }
}

/// Format a duration compactly: `850ms`, `12.3s`, `4m05s`
pub fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1000.0)
    } else {
        let secs = millis / 1000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// Truncate a string for display, keeping the end
pub fn truncate_start(text: &str, max_len: usize) -> String {
    let len = text.chars().count();
    if len <= max_len {
        text.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let tail: String = text.chars().skip(len - (max_len - 3)).collect();
        format!("...{tail}")
    }
}

// ============================================================================
// Tests
// ============================================================================
