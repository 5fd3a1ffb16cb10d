//! Connection Registry: named MongoDB connection profiles in SQLite.
//!
//! The registry is deliberately plain CRUD. The orchestrator only ever reads
//! it (`get_profile`) and copies the profile into the job, so a profile is
//! effectively immutable for as long as any job references it.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Row, SqlitePool};
use tracing::info;
use ts_rs::TS;

use crate::{AppError, AppResult};

pub const NOT_FOUND_CODE: &str = "REGISTRY/NOT_FOUND";
pub const DUPLICATE_NAME_CODE: &str = "REGISTRY/DUPLICATE_NAME";
pub const BAD_ENVIRONMENT_CODE: &str = "REGISTRY/BAD_ENVIRONMENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
        }
    }

    /// Lenient decode for rows written by earlier versions that stored
    /// capitalised tags. Unknown tags degrade to `Production`, the
    /// conservative default for a destructive tool.
    fn parse_lossy(value: &str) -> Self {
        Environment::from_str(value).unwrap_or(Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "production" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "development" => Ok(Environment::Development),
            other => Err(AppError::new(
                BAD_ENVIRONMENT_CODE,
                format!("Unknown environment tag: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConnectionProfile {
    #[ts(type = "number")]
    pub id: i64,
    pub name: String,
    /// Full connection URI, credentials included. Never logged raw.
    pub uri: String,
    /// Logical database name; the string the operator must retype to
    /// confirm a migration into this profile.
    pub database: String,
    pub environment: Environment,
}

/// Open the registry database, creating it if missing.
pub async fn open_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_registry_dir")
                .with_context("path", parent.display().to_string())
        })?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await?;

    info!(
        target: "drover",
        event = "registry_open",
        path = %db_path.display()
    );

    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            environment TEXT NOT NULL DEFAULT 'production',
            uri TEXT NOT NULL,
            dbname TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save_profile(
    pool: &SqlitePool,
    name: &str,
    uri: &str,
    database: &str,
    environment: Environment,
) -> AppResult<ConnectionProfile> {
    let result = sqlx::query(
        "INSERT INTO connections (name, environment, uri, dbname) VALUES (?, ?, ?, ?)",
    )
    .bind(name)
    .bind(environment.as_str())
    .bind(uri)
    .bind(database)
    .execute(pool)
    .await;

    match result {
        Ok(done) => {
            info!(
                target: "drover",
                event = "profile_saved",
                name = %name,
                environment = %environment.as_str()
            );
            Ok(ConnectionProfile {
                id: done.last_insert_rowid(),
                name: name.to_string(),
                uri: uri.to_string(),
                database: database.to_string(),
                environment,
            })
        }
        Err(sqlx::Error::Database(db))
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
        {
            Err(
                AppError::new(DUPLICATE_NAME_CODE, "Connection name already exists")
                    .with_context("name", name),
            )
        }
        Err(err) => Err(AppError::from(err).with_context("operation", "save_profile")),
    }
}

pub async fn get_profile(pool: &SqlitePool, id: i64) -> AppResult<ConnectionProfile> {
    let row = sqlx::query(
        "SELECT id, name, environment, uri, dbname FROM connections WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or_else(|| {
        AppError::new(NOT_FOUND_CODE, "Connection profile not found")
            .with_context("id", id.to_string())
    })?;
    profile_from_row(&row)
}

/// Profiles ordered by environment then name, the grouping the dashboard
/// renders.
pub async fn list_profiles(pool: &SqlitePool) -> AppResult<Vec<ConnectionProfile>> {
    let rows = sqlx::query(
        "SELECT id, name, environment, uri, dbname FROM connections ORDER BY environment, name",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(profile_from_row).collect()
}

pub async fn delete_profile(pool: &SqlitePool, id: i64) -> AppResult<()> {
    let done = sqlx::query("DELETE FROM connections WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(AppError::new(NOT_FOUND_CODE, "Connection profile not found")
            .with_context("id", id.to_string()));
    }
    info!(target: "drover", event = "profile_deleted", id = id);
    Ok(())
}

fn profile_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<ConnectionProfile> {
    let environment: String = row.try_get("environment")?;
    Ok(ConnectionProfile {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        uri: row.try_get("uri")?,
        database: row.try_get("dbname")?,
        environment: Environment::parse_lossy(&environment),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_round_trips_and_is_case_insensitive() {
        assert_eq!(
            "Production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            "staging".parse::<Environment>().unwrap(),
            Environment::Staging
        );
        assert_eq!(
            "DEVELOPMENT".parse::<Environment>().unwrap(),
            Environment::Development
        );
        assert_eq!(
            "qa".parse::<Environment>().unwrap_err().code(),
            BAD_ENVIRONMENT_CODE
        );
    }

    #[test]
    fn unknown_stored_tag_degrades_to_production() {
        assert_eq!(Environment::parse_lossy("qa"), Environment::Production);
    }
}
