//! Schedule reporting and result output.
//!
//! Reporters receive events while a schedule runs. The final
//! [`ScheduleReport`] is printed with [`print_summary`] and written as JSON
//! with [`write_results`].

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::orchestrator::ScheduleReport;
use crate::schedule::{EntryResult, EntryState, TestSchedule};

/// Receives events during a schedule run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once, before any guest is requested.
    async fn on_schedule_start(&self, schedule: &TestSchedule);

    /// Called when a barrier group is finished, whatever its outcome.
    async fn on_group_complete(&self, results: &[EntryResult]);

    /// Called when every group is finished.
    async fn on_run_complete(&self, report: &ScheduleReport);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_schedule_start(&self, _schedule: &TestSchedule) {}
    async fn on_group_complete(&self, _results: &[EntryResult]) {}
    async fn on_run_complete(&self, _report: &ScheduleReport) {}
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_schedule_start(&self, schedule: &TestSchedule) {
        println!("Scheduled {} entries", schedule.len());

        let pb = indicatif::ProgressBar::new(schedule.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_group_complete(&self, results: &[EntryResult]) {
        let Ok(progress) = self.progress.lock() else {
            return;
        };
        let Some(pb) = progress.as_ref() else {
            return;
        };

        for result in results {
            pb.inc(1);

            let status = if result.passed() {
                console::style("PASS").green()
            } else {
                match result.state {
                    EntryState::Aborted => console::style("ABRT").yellow(),
                    EntryState::Failed => console::style("ERR ").red().bold(),
                    _ => console::style("FAIL").red(),
                }
            };

            if self.verbose || !result.passed() {
                pb.println(format!("{} {} ({})", status, result.entry_id, result.environment));
            }
        }
    }

    async fn on_run_complete(&self, report: &ScheduleReport) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        print_summary(report);
    }
}

/// Prints a summary of the schedule results to the console.
pub fn print_summary(report: &ScheduleReport) {
    println!();
    println!("Schedule Results:");
    println!("  Entries: {}", report.total);
    println!("  Passed:  {}", console::style(report.passed).green());
    println!("  Failed:  {}", console::style(report.failed).red());
    if report.aborted > 0 {
        println!("  Aborted: {}", console::style(report.aborted).yellow());
    }
    println!("  Duration: {:?}", report.duration);

    if report.success() {
        println!();
        println!("{}", console::style("All entries passed!").green().bold());
        return;
    }

    println!();
    println!("{}", console::style("Some entries did not pass.").red().bold());
    println!();
    for result in report.results.iter().filter(|r| !r.passed()) {
        let kind = result
            .error_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "TestFailure".to_string());
        println!("  - {} [{}] {}", result.entry_id, result.state, kind);
        if let Some(reason) = &result.reason {
            println!("    {}", console::style(reason).dim());
        }
    }
}

/// Renders entries as a plain-text table, one row per entry.
///
/// Rows of entries that had a guest end with an SSH hint.
pub fn schedule_table(results: &[EntryResult]) -> String {
    let rows: Vec<[String; 4]> = results
        .iter()
        .map(|r| {
            let guest = r
                .guest
                .as_ref()
                .map(|g| match g.ssh_hint() {
                    Some(hint) => format!("{} ({})", g.guestname, hint),
                    None => g.guestname.clone(),
                })
                .unwrap_or_else(|| "-".to_string());
            let state = match (r.error_kind, &r.reason) {
                (Some(kind), Some(reason)) => format!("{}: {} {}", r.state, kind, reason),
                _ => r.state.to_string(),
            };
            [r.entry_id.clone(), state, r.environment.clone(), guest]
        })
        .collect();

    let header = ["entry", "state", "environment", "guest"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: [&str; 4]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut table = vec![line(header)];
    for row in &rows {
        table.push(line([&row[0], &row[1], &row[2], &row[3]]));
    }
    table.join("\n")
}

/// Writes the report as pretty-printed JSON, creating parent directories.
pub fn write_results(report: &ScheduleReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(report).context("Failed to encode results")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write results to {}", path.display()))?;
    Ok(())
}
