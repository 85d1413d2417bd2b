use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nfw_core::{DateWindow, ReportType};
use nfw_upstream::EmptyReason;
use nfw_warehouse::{RejectedRow, RunMode, RunStatus};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

/// Rejected cells listed individually; the rest are only counted.
pub const MAX_LISTED_REJECTIONS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    Fetching,
    Reshaping,
    Loading,
}

#[derive(Debug, Clone, Serialize)]
pub struct TupleFailure {
    pub tuple: String,
    pub stage: FailedStage,
    /// Orchestrator passes that ran this tuple.
    pub passes: usize,
    /// HTTP attempts made in the last pass.
    pub http_attempts: usize,
    pub retryable: bool,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmptyTuple {
    pub tuple: String,
    pub reason: EmptyReason,
}

/// Outcome of one run; the only artifact handed to notification collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub report_type: ReportType,
    pub window: DateWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub tuples_planned: usize,
    pub tuples_attempted: usize,
    pub tuples_done: usize,
    pub tuples_empty: usize,
    pub tuples_failed: usize,
    pub tuples_not_started: usize,
    pub retry_passes: usize,
    pub payloads_fetched: usize,
    pub drafts: usize,
    pub missing_cells: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub rejections: Vec<RejectedRow>,
    pub failures: Vec<TupleFailure>,
    pub empty: Vec<EmptyTuple>,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        mode: RunMode,
        report_type: ReportType,
        window: DateWindow,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            mode,
            report_type,
            window,
            started_at,
            finished_at: started_at,
            cancelled: false,
            tuples_planned: 0,
            tuples_attempted: 0,
            tuples_done: 0,
            tuples_empty: 0,
            tuples_failed: 0,
            tuples_not_started: 0,
            retry_passes: 0,
            payloads_fetched: 0,
            drafts: 0,
            missing_cells: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            rejected: 0,
            rejections: Vec::new(),
            failures: Vec::new(),
            empty: Vec::new(),
        }
    }

    pub fn record_rejections(&mut self, rows: impl IntoIterator<Item = RejectedRow>) {
        for row in rows {
            self.rejected += 1;
            if self.rejections.len() < MAX_LISTED_REJECTIONS {
                self.rejections.push(row);
            }
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.tuples_failed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        }
    }

    /// Every planned tuple ended done or empty.
    pub fn is_clean(&self) -> bool {
        self.status() == RunStatus::Succeeded
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# NFW Run Brief".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!(
                "- Mode: {} ({}) over {}",
                self.mode.as_str(),
                self.report_type,
                self.window
            ),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Status: {}", self.status().as_str()),
            String::new(),
            "## Tuples".to_string(),
            format!("- planned: {}", self.tuples_planned),
            format!("- attempted: {}", self.tuples_attempted),
            format!("- done: {}", self.tuples_done),
            format!("- empty: {}", self.tuples_empty),
            format!("- failed: {}", self.tuples_failed),
            format!("- not started: {}", self.tuples_not_started),
            String::new(),
            "## Rows".to_string(),
            format!("- inserted: {}", self.inserted),
            format!("- updated: {}", self.updated),
            format!("- unchanged: {}", self.unchanged),
            format!("- rejected: {}", self.rejected),
        ];

        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Needs Re-run".to_string());
            for failure in &self.failures {
                lines.push(format!(
                    "- `{}` failed while {:?} after {} pass(es): {}",
                    failure.tuple, failure.stage, failure.passes, failure.error
                ));
            }
        }
        if !self.rejections.is_empty() {
            lines.push(String::new());
            lines.push("## Rejected Cells".to_string());
            for row in &self.rejections {
                lines.push(format!("- {}: {}", row.cell, row.reason));
            }
            if self.rejected > self.rejections.len() {
                lines.push(format!(
                    "- ... and {} more",
                    self.rejected - self.rejections.len()
                ));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Consumer of finished run reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &RunReport) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopReportSink;

#[async_trait]
impl ReportSink for NoopReportSink {
    async fn publish(&self, _report: &RunReport) -> Result<()> {
        Ok(())
    }
}

/// Writes `<reports_dir>/<run_id>/run_report.json` and `run_brief.md`.
#[derive(Debug, Clone)]
pub struct FileReportSink {
    reports_dir: PathBuf,
}

impl FileReportSink {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.reports_dir.join(run_id.to_string())
    }
}

#[async_trait]
impl ReportSink for FileReportSink {
    async fn publish(&self, report: &RunReport) -> Result<()> {
        let run_dir = self.run_dir(report.run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(run_dir.join("run_report.json"), json)
            .await
            .context("writing run_report.json")?;
        fs::write(run_dir.join("run_brief.md"), report.to_markdown())
            .await
            .context("writing run_brief.md")?;
        Ok(())
    }
}

/// Markdown digest of the `runs` most recent report directories.
pub fn report_recent_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_report.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# NFW Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let report_path = dir.path().join("run_report.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        let field = |key: &str| value.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        let text = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };
        let cancelled = value
            .get("cancelled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let status = if cancelled {
            "cancelled"
        } else if field("tuples_failed") > 0 {
            "partial"
        } else {
            "succeeded"
        };

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!(
            "- {} {} ({status}), started {}",
            text("mode"),
            text("report_type"),
            text("started_at")
        ));
        lines.push(format!(
            "- tuples: {} done, {} empty, {} failed",
            field("tuples_done"),
            field("tuples_empty"),
            field("tuples_failed")
        ));
        lines.push(format!(
            "- rows: {} inserted, {} updated, {} rejected",
            field("inserted"),
            field("updated"),
            field("rejected")
        ));
        lines.push(format!("- report: `{}`", report_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use nfw_core::CellRef;
    use nfw_warehouse::LoadFailure;
    use tempfile::tempdir;

    fn report() -> RunReport {
        let day = NaiveDate::from_ymd_opt(2025, 11, 20).unwrap();
        RunReport::new(
            Uuid::new_v4(),
            RunMode::Incremental,
            ReportType::Daily,
            DateWindow::single_day(day),
            Utc::now(),
        )
    }

    #[test]
    fn status_reflects_failures_and_cancellation() {
        let mut report = report();
        assert_eq!(report.status(), RunStatus::Succeeded);
        report.tuples_failed = 1;
        assert_eq!(report.status(), RunStatus::Partial);
        report.cancelled = true;
        assert_eq!(report.status(), RunStatus::Cancelled);
        assert!(!report.is_clean());
    }

    #[test]
    fn rejection_listing_is_capped() {
        let mut report = report();
        let rows = (0..MAX_LISTED_REJECTIONS + 5).map(|i| RejectedRow {
            cell: CellRef {
                province: "Aceh".into(),
                column: format!("col{i}"),
                subcategory: None,
            },
            reason: LoadFailure::Write("boom".into()),
        });
        report.record_rejections(rows);

        assert_eq!(report.rejected, MAX_LISTED_REJECTIONS + 5);
        assert_eq!(report.rejections.len(), MAX_LISTED_REJECTIONS);
        assert!(report.to_markdown().contains("and 5 more"));
    }

    #[tokio::test]
    async fn file_sink_writes_report_and_brief() {
        let dir = tempdir().unwrap();
        let sink = FileReportSink::new(dir.path());
        let mut report = report();
        report.tuples_done = 3;
        report.inserted = 42;
        sink.publish(&report).await.unwrap();

        let run_dir = sink.run_dir(report.run_id);
        assert!(run_dir.join("run_report.json").exists());
        assert!(run_dir.join("run_brief.md").exists());

        let digest = report_recent_markdown(5, dir.path()).unwrap();
        assert!(digest.contains(&report.run_id.to_string()));
        assert!(digest.contains("3 done"));
        assert!(digest.contains("42 inserted"));
    }
}
