//! Before/after database statistics and connectivity probes.
//!
//! Counts come from `db.stats()` evaluated through the shell tool, under a
//! bounded timeout. Snapshots are advisory: collection counts can legitimately
//! diverge across a transfer (capped collections, TTL expiry, replication
//! lag), so a comparison is surfaced to the operator, never enforced.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;
use ts_rs::TS;

use super::tools::{self, ToolCommand, ToolSet};
use super::{StatsPhase, StatsSide, StatsSnapshot};
use crate::registry::ConnectionProfile;
use crate::util::now_ms;
use crate::{redact, AppError, AppResult};

pub const UNAVAILABLE_CODE: &str = "STATS/UNAVAILABLE";

pub const STATS_TIMEOUT_MS_ENV: &str = "DROVER_STATS_TIMEOUT_MS";
pub const DEFAULT_STATS_TIMEOUT_MS: u64 = 10_000;
const MIN_STATS_TIMEOUT_MS: u64 = 1_000;
const MAX_STATS_TIMEOUT_MS: u64 = 120_000;

/// The connectivity probe keeps the original tool's 5s server selection
/// window.
const PING_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PreflightCheck {
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct StatsReconciler {
    tools: ToolSet,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct DbStatsPayload {
    #[serde(default)]
    collections: f64,
    #[serde(default)]
    objects: f64,
    #[serde(default, rename = "dataSize")]
    data_size: f64,
    #[serde(default, rename = "storageSize")]
    storage_size: f64,
}

#[derive(Debug, Deserialize)]
struct PingPayload {
    #[serde(default)]
    ok: f64,
    #[serde(default)]
    version: String,
}

impl StatsReconciler {
    pub fn new(tools: ToolSet, timeout: Duration) -> Self {
        StatsReconciler { tools, timeout }
    }

    pub fn from_env(tools: ToolSet) -> Self {
        let ms = std::env::var(STATS_TIMEOUT_MS_ENV)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(|value| value.clamp(MIN_STATS_TIMEOUT_MS, MAX_STATS_TIMEOUT_MS))
            .unwrap_or(DEFAULT_STATS_TIMEOUT_MS);
        StatsReconciler::new(tools, Duration::from_millis(ms))
    }

    /// Collection and object counts for the profile's database.
    pub async fn snapshot(
        &self,
        profile: &ConnectionProfile,
        side: StatsSide,
        phase: StatsPhase,
    ) -> AppResult<StatsSnapshot> {
        let command = tools::db_stats_command(&self.tools, profile);
        let stdout = capture_stdout(&command, self.timeout).await?;
        let payload: DbStatsPayload = parse_last_json_line(&stdout)?;

        let snapshot = StatsSnapshot {
            side,
            phase,
            collections: payload.collections as i64,
            objects: payload.objects as i64,
            data_size_bytes: payload.data_size as i64,
            storage_size_bytes: payload.storage_size as i64,
            captured_at_ms: now_ms(),
        };
        info!(
            target: "drover",
            event = "stats_snapshot",
            side = ?side,
            phase = ?phase,
            collections = snapshot.collections,
            objects = snapshot.objects
        );
        Ok(snapshot)
    }

    /// Connectivity probe; returns the server version on success.
    pub async fn ping(&self, profile: &ConnectionProfile) -> AppResult<String> {
        let command = tools::ping_command(&self.tools, profile);
        let stdout = capture_stdout(&command, PING_TIMEOUT).await?;
        let payload: PingPayload = parse_last_json_line(&stdout)?;
        if payload.ok as i64 != 1 {
            return Err(
                AppError::new(UNAVAILABLE_CODE, "Server did not acknowledge ping")
                    .with_context("profile", profile.name.clone()),
            );
        }
        Ok(format!("MongoDB {}", payload.version))
    }

    /// Ordered connectivity checks ahead of a migration: source first, and
    /// a source failure short-circuits (there is no point probing the target
    /// for a transfer that cannot start).
    pub async fn preflight(
        &self,
        source: &ConnectionProfile,
        target: &ConnectionProfile,
    ) -> Vec<PreflightCheck> {
        let mut checks = Vec::with_capacity(2);

        match self.ping(source).await {
            Ok(version) => checks.push(PreflightCheck {
                passed: true,
                detail: format!("Source connected: {version}"),
            }),
            Err(err) => {
                checks.push(PreflightCheck {
                    passed: false,
                    detail: format!("Source failed: {}", err.message()),
                });
                return checks;
            }
        }

        match self.ping(target).await {
            Ok(version) => checks.push(PreflightCheck {
                passed: true,
                detail: format!("Target connected: {version}"),
            }),
            Err(err) => checks.push(PreflightCheck {
                passed: false,
                detail: format!("Target failed: {}", err.message()),
            }),
        }

        checks
    }
}

async fn capture_stdout(command: &ToolCommand, timeout: Duration) -> AppResult<String> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(
                AppError::new(UNAVAILABLE_CODE, "Statistics query timed out")
                    .with_context("timeout_ms", timeout.as_millis().to_string())
                    .with_context("command", command.display_line()),
            )
        }
        Ok(Err(err)) => {
            return Err(AppError::new(
                UNAVAILABLE_CODE,
                format!("Failed to launch {}", command.program),
            )
            .with_cause(AppError::from(err)))
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
        return Err(
            AppError::new(UNAVAILABLE_CODE, "Statistics query failed")
                .with_context("exit_code", output.status.code().unwrap_or(-1).to_string())
                .with_context(
                    "stderr_tail",
                    redact::uri_credentials(&tail.join(" | ")).into_owned(),
                ),
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The shell prints connection banners on some configurations even with
/// `--quiet`; the eval result is the last line that parses as JSON.
fn parse_last_json_line<T: serde::de::DeserializeOwned>(stdout: &str) -> AppResult<T> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<T>(trimmed) {
                return Ok(value);
            }
        }
    }
    Err(
        AppError::new(UNAVAILABLE_CODE, "No JSON payload in shell output").with_context(
            "stdout_tail",
            stdout.lines().rev().take(3).collect::<Vec<_>>().join(" | "),
        ),
    )
}
