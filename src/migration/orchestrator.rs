//! The migration state machine.
//!
//! `Pending → Confirmed → Exporting → ExportComplete → Importing →
//! Completed`, with `Failed` and `Cancelled` reachable from any non-terminal
//! state. One job owns the process-wide active slot for its entire lifetime;
//! competing starts are rejected, never queued. Terminal states are final —
//! retrying means a fresh request through the confirmation guard.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use super::guard::{self, StartRequest, JOB_IN_PROGRESS};
use super::runner::{LineHandler, ProcessResult, ProcessRunner};
use super::stats::StatsReconciler;
use super::telemetry::{JobEvent, TelemetryHub};
use super::tools::{self, ToolSet};
use super::{JobState, LogSource, MigrationJob, StatsPhase, StatsSide, StatsSnapshot};
use crate::registry::{self, ConnectionProfile};
use crate::{id, util, AppError, AppResult};

/// Terminal reason codes surfaced on failed jobs.
pub const EXPORT_FAILED: &str = "export_failed";
pub const IMPORT_FAILED: &str = "import_failed";
/// Cancelling a job that is not the active one.
pub const NOT_ACTIVE_CODE: &str = "MIGRATION/NOT_ACTIVE";

/// How many trailing log lines ride along on a terminal error.
const ERROR_LOG_TAIL: usize = 10;

const ARCHIVE_FILE_NAME: &str = "dump.archive.gz";

#[derive(Clone)]
pub struct MigrationOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    telemetry: Arc<TelemetryHub>,
    runner: ProcessRunner,
    reconciler: StatsReconciler,
    tools: ToolSet,
    slot: Arc<AtomicBool>,
    jobs: Mutex<HashMap<String, Arc<Mutex<MigrationJob>>>>,
    active: Mutex<Option<ActiveHandle>>,
}

struct ActiveHandle {
    job_id: String,
    cancel: watch::Sender<bool>,
}

/// Exclusive claim on the single active-job slot. Acquired by
/// compare-and-set so two racing starts cannot both win; released on drop
/// when the job task finishes, whatever the outcome.
#[derive(Debug)]
struct JobSlotGuard {
    flag: Arc<AtomicBool>,
}

impl JobSlotGuard {
    fn acquire(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                JOB_IN_PROGRESS,
                "A migration job is already running.",
            ));
        }
        Ok(Self { flag })
    }
}

impl Drop for JobSlotGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(AppError),
}

impl MigrationOrchestrator {
    pub fn new(
        pool: SqlitePool,
        telemetry: Arc<TelemetryHub>,
        tools: ToolSet,
        runner: ProcessRunner,
        reconciler: StatsReconciler,
    ) -> Self {
        MigrationOrchestrator {
            inner: Arc::new(Inner {
                pool,
                telemetry,
                runner,
                reconciler,
                tools,
                slot: Arc::new(AtomicBool::new(false)),
                jobs: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Everything tunable resolved from the environment.
    pub fn from_env(pool: SqlitePool, telemetry: Arc<TelemetryHub>) -> Self {
        let tools = ToolSet::from_env();
        let reconciler = StatsReconciler::from_env(tools.clone());
        MigrationOrchestrator::new(
            pool,
            telemetry,
            tools,
            ProcessRunner::from_env(),
            reconciler,
        )
    }

    pub fn job_active(&self) -> bool {
        self.inner.slot.load(Ordering::SeqCst)
    }

    /// Validate the request, claim the job slot and launch the pipeline.
    ///
    /// Returns the new job id; the job itself runs on a background task.
    /// No job object exists unless authorization succeeded.
    pub async fn start(&self, request: StartRequest) -> AppResult<String> {
        let source = registry::get_profile(&self.inner.pool, request.source_id).await?;
        let target = registry::get_profile(&self.inner.pool, request.target_id).await?;

        guard::authorize(&request, &target)?;
        let slot = JobSlotGuard::acquire(self.inner.slot.clone())?;

        let job_id = id::new_uuid_v7();
        let job = Arc::new(Mutex::new(MigrationJob::new(
            job_id.clone(),
            source.id,
            target.id,
        )));

        self.inner.telemetry.open(&job_id);
        lock(&self.inner.jobs).insert(job_id.clone(), job.clone());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *lock(&self.inner.active) = Some(ActiveHandle {
            job_id: job_id.clone(),
            cancel: cancel_tx,
        });

        info!(
            target: "drover",
            event = "job_created",
            job_id = %job_id,
            source = %source.name,
            dest = %target.name,
            environment = %target.environment.as_str()
        );
        self.transition(&job, JobState::Confirmed, None);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(job, source, target, cancel_rx, slot).await;
        });

        Ok(job_id)
    }

    /// Request cancellation of the active job. The job reaches `Cancelled`
    /// once the runner has confirmed the process is gone.
    pub fn cancel(&self, job_id: &str) -> AppResult<()> {
        let guard = lock(&self.inner.active);
        match guard.as_ref() {
            Some(handle) if handle.job_id == job_id => {
                info!(target: "drover", event = "job_cancel_requested", job_id = %job_id);
                let _ = handle.cancel.send(true);
                Ok(())
            }
            _ => Err(
                AppError::new(NOT_ACTIVE_CODE, "Job is not active").with_context("job_id", job_id)
            ),
        }
    }

    /// Point-in-time copy of a job, terminal or not.
    pub fn job_snapshot(&self, job_id: &str) -> Option<MigrationJob> {
        lock(&self.inner.jobs)
            .get(job_id)
            .map(|job| lock(job).clone())
    }

    /// Attach to a live job's event stream.
    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<JobEvent>> {
        self.inner.telemetry.subscribe(job_id)
    }

    async fn run_job(
        self,
        job: Arc<Mutex<MigrationJob>>,
        source: ConnectionProfile,
        target: ConnectionProfile,
        mut cancel_rx: watch::Receiver<bool>,
        slot: JobSlotGuard,
    ) {
        let outcome = match TempDir::new() {
            Err(err) => Outcome::Failed(
                AppError::new(EXPORT_FAILED, "Could not create temporary workspace")
                    .with_cause(AppError::from(err)),
            ),
            Ok(workdir) => {
                let archive = workdir.path().join(ARCHIVE_FILE_NAME);
                let outcome = self
                    .execute(&job, &source, &target, &archive, &mut cancel_rx)
                    .await;
                match workdir.close() {
                    Ok(()) => {
                        self.push_log(&job, LogSource::System, "Cleaned up temporary workspace.")
                    }
                    Err(err) => {
                        warn!(target: "drover", event = "workdir_cleanup_failed", error = %err)
                    }
                }
                outcome
            }
        };

        let job_id = lock(&job).id.clone();
        let (state, job_error) = match outcome {
            Outcome::Completed => {
                self.push_log(&job, LogSource::System, "Migration completed successfully.");
                (JobState::Completed, None)
            }
            Outcome::Cancelled => {
                self.push_log(&job, LogSource::System, "Migration cancelled by operator.");
                (JobState::Cancelled, None)
            }
            Outcome::Failed(err) => {
                error!(
                    target: "drover",
                    event = "job_failed",
                    job_id = %job_id,
                    code = %err.code(),
                    message = %err.message()
                );
                self.push_log(
                    &job,
                    LogSource::System,
                    format!("Migration failed: {}", err.message()),
                );
                (JobState::Failed, Some(err))
            }
        };

        self.transition(&job, state, job_error);
        *lock(&self.inner.active) = None;
        self.inner.telemetry.close(&job_id);
        drop(slot);
    }

    async fn execute(
        &self,
        job: &Arc<Mutex<MigrationJob>>,
        source: &ConnectionProfile,
        target: &ConnectionProfile,
        archive: &Path,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Outcome {
        if *cancel_rx.borrow() {
            return Outcome::Cancelled;
        }

        self.transition(job, JobState::Exporting, None);
        self.push_log(
            job,
            LogSource::System,
            format!(
                "Starting export from '{}' (database '{}').",
                source.name, source.database
            ),
        );

        match self
            .inner
            .reconciler
            .snapshot(source, StatsSide::Source, StatsPhase::Before)
            .await
        {
            Ok(snapshot) => self.record_stats(job, snapshot),
            Err(err) => {
                warn!(
                    target: "drover",
                    event = "stats_unavailable",
                    side = "source",
                    error = %err
                );
                self.push_log(
                    job,
                    LogSource::System,
                    format!("Source statistics unavailable: {}", err.message()),
                );
            }
        }
        if *cancel_rx.borrow() {
            return Outcome::Cancelled;
        }

        let dump = tools::dump_command(&self.inner.tools, source, archive);
        self.push_log(job, LogSource::System, format!("$ {}", dump.display_line()));
        let handler = self.line_handler(job.clone(), LogSource::Export);
        let result = self.inner.runner.run(&dump, handler, cancel_rx).await;
        match self.check_phase(job, result, cancel_rx, EXPORT_FAILED, "Export failed") {
            Ok(result) => self.push_log(
                job,
                LogSource::System,
                format!("Export completed in {} ms.", result.duration_ms),
            ),
            Err(outcome) => return outcome,
        }

        self.transition(job, JobState::ExportComplete, None);
        if let Ok(meta) = std::fs::metadata(archive) {
            self.push_log(
                job,
                LogSource::System,
                format!("Archive ready ({} bytes).", meta.len()),
            );
        }

        if *cancel_rx.borrow() {
            return Outcome::Cancelled;
        }

        self.transition(job, JobState::Importing, None);
        self.push_log(
            job,
            LogSource::System,
            format!(
                "Starting import into '{}' (database '{}').",
                target.name, target.database
            ),
        );
        let restore = tools::restore_command(&self.inner.tools, &source.database, target, archive);
        self.push_log(
            job,
            LogSource::System,
            format!("$ {}", restore.display_line()),
        );
        let handler = self.line_handler(job.clone(), LogSource::Import);
        let result = self.inner.runner.run(&restore, handler, cancel_rx).await;
        match self.check_phase(job, result, cancel_rx, IMPORT_FAILED, "Import failed") {
            Ok(result) => self.push_log(
                job,
                LogSource::System,
                format!("Import completed in {} ms.", result.duration_ms),
            ),
            Err(outcome) => return outcome,
        }

        match self
            .inner
            .reconciler
            .snapshot(target, StatsSide::Target, StatsPhase::After)
            .await
        {
            Ok(snapshot) => self.record_stats(job, snapshot),
            Err(err) => {
                warn!(
                    target: "drover",
                    event = "stats_unavailable",
                    side = "target",
                    error = %err
                );
                self.push_log(
                    job,
                    LogSource::System,
                    format!("Target statistics unavailable: {}", err.message()),
                );
            }
        }

        // A cancel that lands after the restore finished still wins; the job
        // never reports success once the operator asked it to stop.
        if *cancel_rx.borrow() {
            return Outcome::Cancelled;
        }

        Outcome::Completed
    }

    /// Fold a phase's runner result into the state machine: cancellation
    /// always wins over whatever exit the process reported, and a non-zero
    /// exit becomes a terminal failure carrying the log tail.
    fn check_phase(
        &self,
        job: &Arc<Mutex<MigrationJob>>,
        result: AppResult<ProcessResult>,
        cancel_rx: &watch::Receiver<bool>,
        reason: &str,
        message: &str,
    ) -> Result<ProcessResult, Outcome> {
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                if *cancel_rx.borrow() {
                    return Err(Outcome::Cancelled);
                }
                return Err(Outcome::Failed(
                    AppError::new(reason, message)
                        .with_context("log_tail", self.log_tail(job))
                        .with_cause(err),
                ));
            }
        };

        if result.signaled || *cancel_rx.borrow() {
            return Err(Outcome::Cancelled);
        }
        if !result.success() {
            let exit = result
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(Outcome::Failed(
                AppError::new(reason, format!("{message} (exit code {exit})"))
                    .with_context("exit_code", exit)
                    .with_context("log_tail", self.log_tail(job)),
            ));
        }
        Ok(result)
    }

    fn line_handler(&self, job: Arc<Mutex<MigrationJob>>, source: LogSource) -> LineHandler {
        let this = self.clone();
        Arc::new(move |text| this.push_log(&job, source, text))
    }

    fn push_log(
        &self,
        job: &Arc<Mutex<MigrationJob>>,
        source: LogSource,
        text: impl Into<String>,
    ) {
        let event = {
            let mut job = lock(job);
            let line = job.push_line(source, text.into());
            JobEvent::Log {
                job_id: job.id.clone(),
                line,
            }
        };
        self.inner.telemetry.publish(event);
    }

    fn record_stats(&self, job: &Arc<Mutex<MigrationJob>>, snapshot: StatsSnapshot) {
        let event = {
            let mut job = lock(job);
            match snapshot.phase {
                StatsPhase::Before => job.pre_stats = Some(snapshot.clone()),
                StatsPhase::After => job.post_stats = Some(snapshot.clone()),
            }
            JobEvent::Stats {
                job_id: job.id.clone(),
                snapshot: snapshot.clone(),
            }
        };
        self.push_log(
            job,
            LogSource::System,
            format!(
                "{} {} transfer: {} collections, {} objects.",
                match snapshot.side {
                    StatsSide::Source => "Source",
                    StatsSide::Target => "Target",
                },
                match snapshot.phase {
                    StatsPhase::Before => "before",
                    StatsPhase::After => "after",
                },
                snapshot.collections, snapshot.objects
            ),
        );
        self.inner.telemetry.publish(event);
    }

    fn log_tail(&self, job: &Arc<Mutex<MigrationJob>>) -> String {
        lock(job).log_tail(ERROR_LOG_TAIL).join("\n")
    }

    fn transition(&self, job: &Arc<Mutex<MigrationJob>>, state: JobState, error: Option<AppError>) {
        let event = {
            let mut job = lock(job);
            if job.state.is_terminal() {
                warn!(
                    target: "drover",
                    event = "transition_after_terminal_ignored",
                    job_id = %job.id,
                    from = job.state.as_str(),
                    to = state.as_str()
                );
                return;
            }
            let now = util::now_ms();
            job.state = state;
            if state != JobState::Pending && job.started_at_ms.is_none() {
                job.started_at_ms = Some(now);
            }
            if state.is_terminal() {
                job.finished_at_ms = Some(now);
                job.error = error.clone();
            }
            info!(
                target: "drover",
                event = "job_state",
                job_id = %job.id,
                state = state.as_str()
            );
            JobEvent::State {
                job_id: job.id.clone(),
                state,
                error,
            }
        };
        self.inner.telemetry.publish(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
