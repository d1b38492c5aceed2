//! Final run report rendering.

use crate::dag::RunReport;
use crate::ui::icons::{CHECK, CROSS, HINT, REUSED, SKIP};
use crate::ui::progress::{UiMode, format_duration};
use console::style;
use std::fmt::Write;

/// Render the report for the terminal. In JSON mode this is the report
/// itself on one line, following the streamed events.
pub fn render_report(report: &RunReport, mode: UiMode) -> String {
    if mode == UiMode::Json {
        return serde_json::to_string(report).unwrap_or_default();
    }

    let mut out = String::new();
    let root_cause = report.root_cause().map(|e| e.id.as_str());

    for entry in &report.entries {
        let line = match entry.outcome.as_failure() {
            None if entry.reused => format!("{}{} {}", REUSED, entry.id, style("(reused)").dim()),
            None => format!(
                "{}{} {}",
                CHECK,
                entry.id,
                style(format_duration(entry.duration)).dim()
            ),
            Some(failure) if !entry.is_root_cause() => {
                format!("{}{} {}", SKIP, entry.id, style(&failure.message).dim())
            }
            Some(failure) => {
                let marker = if root_cause == Some(entry.id.as_str()) {
                    format!(" {}", style("<- root cause").red().bold())
                } else {
                    String::new()
                };
                format!(
                    "{}{} {}: {}{}",
                    CROSS,
                    style(&entry.id).red().bold(),
                    failure.kind,
                    failure.message,
                    marker
                )
            }
        };
        let _ = writeln!(out, "{}", line);

        if let Some(failure) = entry.outcome.as_failure() {
            if let Some(cause) = &failure.cause {
                let _ = writeln!(out, "     caused by: {}", cause);
            }
            if let Some(hint) = failure.kind.remediation() {
                let _ = writeln!(out, "     {}{}", HINT, hint);
            }
        }
    }

    let summary = report.summary();
    let _ = writeln!(
        out,
        "\n{} succeeded, {} failed, {} skipped, {} reused in {}",
        summary.succeeded,
        summary.failed,
        summary.dependency_failed,
        summary.reused,
        format_duration(report.duration)
    );
    if mode == UiMode::Full
        && let Some(root) = report.root_cause()
        && let Some(failure) = root.outcome.as_failure()
    {
        let _ = writeln!(out, "First failure: {} ({})", root.id, failure.kind);
    }
    out
}
