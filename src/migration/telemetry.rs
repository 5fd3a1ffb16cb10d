//! Per-job fan-out of live events to any number of observers.
//!
//! One broadcast channel per job: the orchestrator publishes, subscribers
//! drain independently. A subscriber that falls more than
//! [`SUBSCRIBER_BUFFER`] events behind loses its oldest backlog (broadcast
//! lag) instead of stalling the pipeline. After the terminal state event the
//! channel is closed, so every subscriber's stream ends.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use ts_rs::TS;

use super::{JobState, LogLine, StatsSnapshot};
use crate::AppError;

/// Per-subscriber backlog. Chosen to absorb a chatty mongodump burst while
/// keeping a stalled dashboard tab from pinning job history in memory.
pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export)]
pub enum JobEvent {
    Log {
        job_id: String,
        line: LogLine,
    },
    Stats {
        job_id: String,
        snapshot: StatsSnapshot,
    },
    State {
        job_id: String,
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[ts(optional)]
        error: Option<AppError>,
    },
}

impl JobEvent {
    fn job_id(&self) -> &str {
        match self {
            JobEvent::Log { job_id, .. }
            | JobEvent::Stats { job_id, .. }
            | JobEvent::State { job_id, .. } => job_id,
        }
    }
}

#[derive(Default)]
pub struct TelemetryHub {
    channels: Mutex<HashMap<String, broadcast::Sender<JobEvent>>>,
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the channel for a job. Called once by the orchestrator before
    /// the job's first event.
    pub(crate) fn open(&self, job_id: &str) {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string(), tx);
    }

    /// Attach to a live job. `None` when the job is unknown or already
    /// finished; events before the subscription are not replayed.
    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<JobEvent>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .map(|tx| tx.subscribe())
    }

    /// Publish without blocking. An event with no listeners is dropped.
    pub(crate) fn publish(&self, event: JobEvent) {
        let guard = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.get(event.job_id()) {
            let _ = tx.send(event);
        }
    }

    /// Drop the job's sender; subscribers drain their backlog and then see
    /// the stream end.
    pub(crate) fn close(&self, job_id: &str) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        debug!(target: "drover", event = "telemetry_closed", job_id = %job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::LogSource;
    use tokio::sync::broadcast::error::RecvError;

    fn log_event(job_id: &str, seq: u64) -> JobEvent {
        JobEvent::Log {
            job_id: job_id.to_string(),
            line: LogLine {
                seq,
                source: LogSource::Export,
                at_ms: 0,
                text: format!("line {seq}"),
            },
        }
    }

    #[tokio::test]
    async fn each_subscriber_receives_every_event_in_order() {
        let hub = TelemetryHub::new();
        hub.open("job");
        let mut a = hub.subscribe("job").expect("channel open");
        let mut b = hub.subscribe("job").expect("channel open");

        hub.publish(log_event("job", 1));
        hub.publish(log_event("job", 2));

        for rx in [&mut a, &mut b] {
            for expected in 1..=2u64 {
                match rx.recv().await.expect("event delivered") {
                    JobEvent::Log { line, .. } => assert_eq!(line.seq, expected),
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_producer() {
        let hub = TelemetryHub::new();
        hub.open("job");
        let mut rx = hub.subscribe("job").expect("channel open");

        for seq in 0..(SUBSCRIBER_BUFFER as u64 + 8) {
            hub.publish(log_event("job", seq));
        }

        match rx.recv().await {
            Err(RecvError::Lagged(skipped)) => assert!(skipped >= 8),
            other => panic!("expected lag, got {other:?}"),
        }
        // After the lag report, delivery resumes with newer events.
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn close_makes_the_stream_finite() {
        let hub = TelemetryHub::new();
        hub.open("job");
        let mut rx = hub.subscribe("job").expect("channel open");
        hub.publish(log_event("job", 1));
        hub.close("job");

        assert!(matches!(rx.recv().await, Ok(JobEvent::Log { .. })));
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(hub.subscribe("job").is_none());
    }

    #[test]
    fn unknown_job_yields_no_subscription() {
        let hub = TelemetryHub::new();
        assert!(hub.subscribe("nope").is_none());
    }
}
