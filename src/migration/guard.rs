//! Two-factor confirmation gating every migration start.
//!
//! A restore with `--drop` destroys whatever the target database currently
//! holds, so a start request must carry an explicit risk acknowledgement and
//! the target's database name retyped exactly. The check is a pure
//! precondition: no side effects, no network, cheap to retry.
//!
//! Reason codes are part of the job surface contract:
//! [`CONFIRMATION_MISMATCH`] and [`JOB_IN_PROGRESS`].

use serde::{Deserialize, Serialize};
use tracing::warn;
use ts_rs::TS;

use crate::registry::ConnectionProfile;
use crate::{AppError, AppResult};

pub const CONFIRMATION_MISMATCH: &str = "confirmation_mismatch";
pub const JOB_IN_PROGRESS: &str = "job_in_progress";

/// An operator's request to start a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StartRequest {
    #[ts(type = "number")]
    pub source_id: i64,
    #[ts(type = "number")]
    pub target_id: i64,
    /// The "I understand this overwrites the target" checkbox.
    pub acknowledged: bool,
    /// Must equal the target profile's database name byte-for-byte. No
    /// trimming, no case folding: `orders_Prod` does not confirm
    /// `orders_prod`, and neither does `orders_prod `.
    pub confirm_database: String,
}

/// Validate the confirmation gesture against the resolved target profile.
///
/// The single-active-job rule is enforced separately by the orchestrator's
/// atomic slot, so that check-then-act races are impossible; see
/// [`super::orchestrator::MigrationOrchestrator::start`].
pub fn authorize(request: &StartRequest, target: &ConnectionProfile) -> AppResult<()> {
    if !request.acknowledged || request.confirm_database != target.database {
        warn!(
            target: "drover",
            event = "confirmation_rejected",
            target_profile = %target.name,
            acknowledged = request.acknowledged
        );
        return Err(AppError::new(
            CONFIRMATION_MISMATCH,
            "Confirmation failed: acknowledge the risk and retype the target database name exactly",
        )
        .with_context("target_profile", target.name.clone()));
    }
    Ok(())
}
