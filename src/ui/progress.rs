//! Task graph progress UI.
//!
//! Renders [`GraphEvent`]s from a running graph. Three output modes:
//! - `full`: progress bars and colors
//! - `minimal`: one line per settled task
//! - `json`: one JSON event per line for machine consumption

use crate::dag::{GraphEvent, RunSummary};
use crate::task::{Outcome, TaskId};
use crate::ui::icons::{CHECK, CLOCK, CROSS, REUSED, RETRY, RUNNING, SKIP, SPARKLE, WAVE};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Progress bars and colors
    #[default]
    Full,
    /// One line per settled task
    Minimal,
    /// JSON events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

/// Progress display for one graph run.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    task_bars: Mutex<HashMap<TaskId, ProgressBar>>,
    verbose: bool,
    term: Term,
}

impl RunUI {
    pub fn new(title: &str, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_bar = if mode == UiMode::Full {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(bar_style("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}"));
            bar.set_prefix(title.to_string());
            bar.set_message("Starting...");
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            mode,
            multi,
            header_bar,
            task_bars: Mutex::new(HashMap::new()),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    /// Render events until the sender side is dropped.
    pub async fn consume(&self, mut rx: mpsc::Receiver<GraphEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(&event);
        }
    }

    pub fn handle_event(&self, event: &GraphEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &GraphEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &GraphEvent) {
        match event {
            GraphEvent::TaskCompleted { task, outcome, .. } => {
                let _ = writeln!(&self.term, "{}", minimal_line(task, outcome));
            }
            GraphEvent::TaskRetrying { task, attempt, reason } => {
                let _ = writeln!(&self.term, "retry {} (attempt {}): {}", task, attempt + 1, reason);
            }
            GraphEvent::RunCompleted { success, summary } => {
                let _ = writeln!(
                    &self.term,
                    "Done: {}/{} {}",
                    summary.succeeded,
                    summary.total,
                    if *success { "ok" } else { "failed" }
                );
            }
            _ => {}
        }
    }

    fn handle_full(&self, event: &GraphEvent) {
        match event {
            GraphEvent::RunStarted {
                tasks,
                waves,
                incremental,
                ..
            } => self.on_run_started(tasks.len(), *waves, *incremental),
            GraphEvent::TaskStarted { task, attempt } => self.on_task_started(task, *attempt),
            GraphEvent::TaskRetrying { task, attempt, reason } => {
                self.on_task_retrying(task, *attempt, reason)
            }
            GraphEvent::TaskCompleted {
                task,
                outcome,
                executed,
                duration,
            } => self.on_task_completed(task, outcome, *executed, *duration),
            GraphEvent::TaskReused { task } => {
                self.header_bar.inc(1);
                if self.verbose {
                    self.multi
                        .println(format!("  {} {} {}", REUSED, task, style("(unchanged)").dim()))
                        .ok();
                }
            }
            GraphEvent::RunCompleted { success, summary } => self.on_run_completed(*success, summary),
        }
    }

    fn on_run_started(&self, tasks: usize, waves: usize, incremental: bool) {
        self.header_bar.set_length(tasks as u64);
        let kind = if incremental { "incremental run" } else { "run" };
        self.header_bar
            .set_message(format!("{} ({} tasks, {} waves)", kind, tasks, waves));
    }

    fn on_task_started(&self, task: &str, attempt: u32) {
        let mut bars = self.task_bars.lock().unwrap_or_else(|p| p.into_inner());
        let bar = bars.entry(task.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("  {spinner} {prefix:.bold} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_prefix(task.to_string());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        if attempt > 1 {
            bar.set_message(format!("{}attempt {}", RUNNING, attempt));
        } else {
            bar.set_message(format!("{}running", RUNNING));
        }
    }

    fn on_task_retrying(&self, task: &str, attempt: u32, reason: &str) {
        self.multi
            .println(format!(
                "  {} {} failed on attempt {}, retrying: {}",
                RETRY,
                style(task).yellow(),
                attempt,
                style(reason).dim()
            ))
            .ok();
    }

    fn on_task_completed(&self, task: &str, outcome: &Outcome, executed: bool, duration: Duration) {
        let bar = self
            .task_bars
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(task);
        self.header_bar.inc(1);

        let line = match outcome.as_failure() {
            None => format!(
                "  {} {} {}",
                CHECK,
                style(task).green().bold(),
                style(format_duration(duration)).dim()
            ),
            Some(_) if !executed => format!(
                "  {} {} {}",
                SKIP,
                style(task).yellow(),
                style("skipped: dependency failed").dim()
            ),
            Some(failure) => format!(
                "  {} {} {}: {}",
                CROSS,
                style(task).red().bold(),
                style(failure.kind).red(),
                failure.message
            ),
        };

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        self.multi.println(line).ok();
    }

    fn on_run_completed(&self, success: bool, summary: &RunSummary) {
        self.header_bar.finish_and_clear();
        self.multi.println("").ok();
        if success {
            self.multi
                .println(format!("{} Run {} {}", SPARKLE, style("COMPLETE").green().bold(), SPARKLE))
                .ok();
        } else {
            self.multi
                .println(format!("{} Run {}", CROSS, style("FAILED").red().bold()))
                .ok();
        }
        self.multi
            .println(format!(
                "{} Tasks: {}/{} succeeded",
                CLOCK,
                style(summary.succeeded).green().bold(),
                summary.total
            ))
            .ok();
        if summary.failed > 0 {
            self.multi
                .println(format!("     {} failed", style(summary.failed).red().bold()))
                .ok();
        }
        if summary.dependency_failed > 0 {
            self.multi
                .println(format!(
                    "     {} skipped after a failed dependency",
                    style(summary.dependency_failed).yellow()
                ))
                .ok();
        }
        if summary.reused > 0 {
            self.multi
                .println(format!("     {} reused from the previous run", style(summary.reused).dim()))
                .ok();
        }
    }

    /// Print the wave layout before execution starts.
    pub fn print_waves(&self, waves: &[Vec<TaskId>]) {
        if self.mode != UiMode::Full {
            return;
        }
        for (i, wave) in waves.iter().enumerate() {
            let parallel = if wave.len() > 1 {
                format!(" {}", style("(parallel)").dim())
            } else {
                String::new()
            };
            self.multi
                .println(format!(
                    "{} Wave {}: [{}]{}",
                    WAVE,
                    style(i).cyan(),
                    style(wave.join(", ")).yellow(),
                    parallel
                ))
                .ok();
        }
    }
}

fn minimal_line(task: &str, outcome: &Outcome) -> String {
    match outcome.as_failure() {
        None => format!("ok   {}", task),
        Some(failure) => format!("FAIL {} ({}: {})", task, failure.kind, failure.message),
    }
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
