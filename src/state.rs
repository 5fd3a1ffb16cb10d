use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::SqlitePool;

use crate::migration::{MigrationOrchestrator, TelemetryHub};
use crate::{registry, AppError, AppResult};

pub const DATA_DIR_ENV: &str = "DROVER_DATA_DIR";
const REGISTRY_FILE_NAME: &str = "drover.sqlite3";

/// Shared handles the embedding surface (CLI today, the dashboard API
/// collaborator tomorrow) hangs on to.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub telemetry: Arc<TelemetryHub>,
    pub orchestrator: MigrationOrchestrator,
    pub data_dir: Arc<PathBuf>,
}

impl AppState {
    pub async fn init() -> AppResult<Self> {
        let data_dir = default_data_dir()?;
        AppState::init_at(&data_dir).await
    }

    pub async fn init_at(data_dir: &Path) -> AppResult<Self> {
        let pool = registry::open_pool(&data_dir.join(REGISTRY_FILE_NAME)).await?;
        let telemetry = Arc::new(TelemetryHub::new());
        let orchestrator = MigrationOrchestrator::from_env(pool.clone(), telemetry.clone());
        Ok(AppState {
            pool,
            telemetry,
            orchestrator,
            data_dir: Arc::new(data_dir.to_path_buf()),
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

pub fn default_data_dir() -> AppResult<PathBuf> {
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let base = dirs::data_dir()
        .or_else(|| env::current_dir().ok())
        .ok_or_else(|| {
            AppError::new(
                "APP/DATA_DIR",
                "Failed to resolve an application data directory",
            )
        })?;
    Ok(base.join("drover"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_registry_in_data_dir() {
        let tmp = tempdir().expect("tempdir");
        let state = AppState::init_at(tmp.path()).await.expect("init");
        assert!(tmp.path().join(REGISTRY_FILE_NAME).exists());
        assert!(!state.orchestrator.job_active());
        assert_eq!(state.log_dir(), tmp.path().join("logs"));
    }
}
