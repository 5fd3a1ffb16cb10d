//! Supervision of one external tool process.
//!
//! Exactly one process per [`ProcessRunner::run`] call. Stdout and stderr
//! are merged into a single ordered line stream and handed to the caller as
//! they arrive; nothing is buffered until completion. Cancellation signals
//! the process group and escalates to a forced kill after the grace period.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::tools::ToolCommand;
use crate::redact;
use crate::{AppError, AppResult};

pub const SPAWN_FAILED_CODE: &str = "PROCESS/SPAWN";

pub const KILL_GRACE_MS_ENV: &str = "DROVER_KILL_GRACE_MS";
pub const DEFAULT_KILL_GRACE_MS: u64 = 5_000;
const MIN_KILL_GRACE_MS: u64 = 100;
const MAX_KILL_GRACE_MS: u64 = 60_000;

/// How long to keep draining buffered output after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback invoked with each (already redacted) output line.
pub type LineHandler = Arc<dyn Fn(String) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code when the process exited normally; `None` when it was
    /// terminated by a signal.
    pub exit_code: Option<i32>,
    /// True when termination was requested through cancellation (either the
    /// graceful signal or the escalated kill).
    pub signaled: bool,
    pub duration_ms: u64,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        !self.signaled && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
}

impl ProcessRunner {
    pub fn new(grace: Duration) -> Self {
        ProcessRunner { grace }
    }

    /// Grace period from `DROVER_KILL_GRACE_MS`, clamped to a testable range.
    pub fn from_env() -> Self {
        let ms = std::env::var(KILL_GRACE_MS_ENV)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(|value| value.clamp(MIN_KILL_GRACE_MS, MAX_KILL_GRACE_MS))
            .unwrap_or(DEFAULT_KILL_GRACE_MS);
        ProcessRunner::new(Duration::from_millis(ms))
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Run the command to completion, forwarding each output line to
    /// `lines`. The sequence is finite and the call is not restartable:
    /// one invocation, one process, one result.
    pub async fn run(
        &self,
        command: &ToolCommand,
        lines: LineHandler,
        cancel: &mut watch::Receiver<bool>,
    ) -> AppResult<ProcessResult> {
        let started = Instant::now();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::new(
                SPAWN_FAILED_CODE,
                format!("Failed to launch {}", command.program),
            )
            .with_context("program", command.program.clone())
            .with_cause(AppError::from(err))
        })?;

        info!(
            target: "drover",
            event = "process_spawned",
            command = %command.display_line()
        );

        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, tx.clone());
        }
        drop(tx);

        let mut signaled = false;
        let mut escalated = false;
        let mut cancel_closed = false;
        let mut streams_open = true;
        let mut kill_deadline = tokio::time::Instant::now();

        // Cancellation may predate the spawn; honor it immediately.
        if *cancel.borrow_and_update() {
            signaled = true;
            kill_deadline = tokio::time::Instant::now() + self.grace;
            terminate_group(&child);
        }

        let status = loop {
            // Signal sends happen outside the select! so the `wait` future's
            // borrow of the child has been dropped by then.
            let mut send_term = false;
            let mut send_kill = false;

            tokio::select! {
                line = rx.recv(), if streams_open => {
                    match line {
                        Some(text) => lines(redact::uri_credentials(&text).into_owned()),
                        None => streams_open = false,
                    }
                }
                status = child.wait() => {
                    break status.map_err(|err| {
                        AppError::from(err).with_context("operation", "wait_for_process")
                    })?;
                }
                changed = cancel.changed(), if !signaled && !cancel_closed => {
                    match changed {
                        Ok(()) if *cancel.borrow_and_update() => {
                            signaled = true;
                            kill_deadline = tokio::time::Instant::now() + self.grace;
                            send_term = true;
                        }
                        Ok(()) => {}
                        Err(_) => cancel_closed = true,
                    }
                }
                _ = tokio::time::sleep_until(kill_deadline), if signaled && !escalated => {
                    escalated = true;
                    send_kill = true;
                }
            }

            if send_term {
                info!(
                    target: "drover",
                    event = "process_terminate_requested",
                    grace_ms = self.grace.as_millis() as u64
                );
                terminate_group(&child);
            }
            if send_kill {
                warn!(target: "drover", event = "process_kill_escalated");
                child.start_kill().ok();
            }
        };

        // The pumps finish at pipe EOF; give any straggling buffered output
        // a bounded window to land before reporting the result.
        let drain = async {
            while let Some(text) = rx.recv().await {
                lines(redact::uri_credentials(&text).into_owned());
            }
        };
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;

        let signaled = signaled || status.code().is_none();
        let result = ProcessResult {
            exit_code: status.code(),
            signaled,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            target: "drover",
            event = "process_exited",
            exit_code = ?result.exit_code,
            signaled = result.signaled,
            duration_ms = result.duration_ms
        );
        Ok(result)
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        ProcessRunner::new(Duration::from_millis(DEFAULT_KILL_GRACE_MS))
    }
}

fn spawn_line_pump<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "drover", event = "stream_read_failed", error = %err);
                    break;
                }
            }
        }
    });
}

/// Graceful half of the escalation: SIGTERM to the whole process group so
/// tool children (mongodump forks a dumper per collection under some
/// configurations) stop with their parent.
#[cfg(unix)]
fn terminate_group(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_child: &Child) {
    // No graceful signal on this platform; the grace timer escalates to a
    // hard kill.
}
