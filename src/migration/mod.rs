//! The migration job orchestrator and its collaborators.
//!
//! One job at a time moves a database from a source profile to a target
//! profile through a supervised dump/restore pipeline. Everything observable
//! about a running job (log lines, stat snapshots, state changes) flows
//! through the per-job telemetry channel as it happens.

pub mod guard;
pub mod orchestrator;
pub mod runner;
pub mod stats;
pub mod telemetry;
pub mod tools;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::util::now_ms;
use crate::AppError;

pub use guard::StartRequest;
pub use orchestrator::MigrationOrchestrator;
pub use runner::{ProcessResult, ProcessRunner};
pub use stats::StatsReconciler;
pub use telemetry::{JobEvent, TelemetryHub};
pub use tools::ToolSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum JobState {
    Pending,
    Confirmed,
    Exporting,
    ExportComplete,
    Importing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Confirmed => "confirmed",
            JobState::Exporting => "exporting",
            JobState::ExportComplete => "export_complete",
            JobState::Importing => "importing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum LogSource {
    Export,
    Import,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct LogLine {
    /// Monotonic per job, starting at 1.
    #[ts(type = "number")]
    pub seq: u64,
    pub source: LogSource,
    #[ts(type = "number")]
    pub at_ms: i64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum StatsSide {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum StatsPhase {
    Before,
    After,
}

/// Point-in-time collection/document counts for one side of the transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StatsSnapshot {
    pub side: StatsSide,
    pub phase: StatsPhase,
    #[ts(type = "number")]
    pub collections: i64,
    #[ts(type = "number")]
    pub objects: i64,
    #[ts(type = "number")]
    pub data_size_bytes: i64,
    #[ts(type = "number")]
    pub storage_size_bytes: i64,
    #[ts(type = "number")]
    pub captured_at_ms: i64,
}

/// One end-to-end migration attempt. Owned exclusively by the orchestrator;
/// everyone else sees cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MigrationJob {
    pub id: String,
    #[ts(type = "number")]
    pub source_id: i64,
    #[ts(type = "number")]
    pub target_id: i64,
    pub state: JobState,
    #[ts(type = "number")]
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional, type = "number")]
    pub started_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional, type = "number")]
    pub finished_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub pre_stats: Option<StatsSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub post_stats: Option<StatsSnapshot>,
    pub log: Vec<LogLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub error: Option<AppError>,
}

impl MigrationJob {
    pub fn new(id: String, source_id: i64, target_id: i64) -> Self {
        MigrationJob {
            id,
            source_id,
            target_id,
            state: JobState::Pending,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            pre_stats: None,
            post_stats: None,
            log: Vec::new(),
            error: None,
        }
    }

    /// Append a line, assigning the next sequence number.
    pub(crate) fn push_line(&mut self, source: LogSource, text: String) -> LogLine {
        let line = LogLine {
            seq: self.log.len() as u64 + 1,
            source,
            at_ms: now_ms(),
            text,
        };
        self.log.push(line.clone());
        line
    }

    /// Last `n` log lines, newest last, for terminal error context.
    pub fn log_tail(&self, n: usize) -> Vec<String> {
        let start = self.log.len().saturating_sub(n);
        self.log[start..].iter().map(|l| l.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_three_states_are_terminal() {
        let terminal: Vec<JobState> = [
            JobState::Pending,
            JobState::Confirmed,
            JobState::Exporting,
            JobState::ExportComplete,
            JobState::Importing,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ]
        .into_iter()
        .filter(JobState::is_terminal)
        .collect();
        assert_eq!(
            terminal,
            vec![JobState::Completed, JobState::Failed, JobState::Cancelled]
        );
    }

    #[test]
    fn log_sequence_is_monotonic_from_one() {
        let mut job = MigrationJob::new("j".into(), 1, 2);
        let a = job.push_line(LogSource::System, "first".into());
        let b = job.push_line(LogSource::Export, "second".into());
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(job.log_tail(1), vec!["second".to_string()]);
        assert_eq!(job.log_tail(10).len(), 2);
    }
}
