use std::process;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use drover_lib::migration::guard::{CONFIRMATION_MISMATCH, JOB_IN_PROGRESS};
use drover_lib::migration::{
    JobEvent, JobState, LogSource, StartRequest, StatsPhase, StatsReconciler, StatsSide,
    StatsSnapshot, ToolSet,
};
use drover_lib::registry::{self, ConnectionProfile, Environment};
use drover_lib::{format_ms, redact, AppState};

/// Exit status when a migration job ends in `Failed`.
const EXIT_FAILED: i32 = 1;
/// Exit status when a start request is rejected before a job exists.
const EXIT_REJECTED: i32 = 2;
/// Exit status when the job was cancelled (operator-initiated stop).
const EXIT_CANCELLED: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "drover", about = "Guarded MongoDB migration tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage saved connection profiles.
    #[command(subcommand)]
    Connections(ConnectionsCommand),
    /// Show live collection/object counts for a saved profile.
    Stats {
        /// Profile id (see `drover connections list`).
        id: i64,
        /// Emit the raw JSON snapshot instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Probe source and target connectivity ahead of a migration.
    Preflight {
        #[arg(long)]
        source: i64,
        #[arg(long)]
        target: i64,
    },
    /// Run a migration from one profile to another.
    Migrate {
        #[arg(long)]
        source: i64,
        #[arg(long)]
        target: i64,
        /// Acknowledge that existing data in the target database will be
        /// dropped and replaced.
        #[arg(long)]
        acknowledge_risk: bool,
        /// Retype the target's database name exactly to confirm.
        #[arg(long, value_name = "NAME")]
        confirm_database: String,
    },
}

#[derive(Debug, Subcommand)]
enum ConnectionsCommand {
    /// Save a new connection profile.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        uri: String,
        /// Logical database name on this server.
        #[arg(long)]
        db: String,
        /// production | staging | development
        #[arg(long, default_value = "production")]
        environment: String,
    },
    /// List saved profiles grouped by environment.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete a profile by id.
    Remove { id: i64 },
    /// Check connectivity and report the server version.
    Test { id: i64 },
}

#[tokio::main]
async fn main() {
    let _log_guard = init_logging_for_cli();

    let cli = Cli::parse();
    match handle_cli(cli.command).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

/// Terminal diagnostics plus a JSON file sink under the data directory;
/// falls back to terminal-only when the data dir cannot be resolved.
fn init_logging_for_cli() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if let Ok(data_dir) = drover_lib::state::default_data_dir() {
        if let Ok(guard) = drover_lib::logging::init_with_file(&data_dir.join("logs")) {
            return Some(guard);
        }
    }
    drover_lib::init_logging();
    None
}

async fn handle_cli(command: Commands) -> Result<i32> {
    let state = AppState::init().await.context("initialize drover state")?;

    match command {
        Commands::Connections(cmd) => handle_connections(&state, cmd).await,
        Commands::Stats { id, json } => handle_stats(&state, id, json).await,
        Commands::Preflight { source, target } => handle_preflight(&state, source, target).await,
        Commands::Migrate {
            source,
            target,
            acknowledge_risk,
            confirm_database,
        } => {
            handle_migrate(
                &state,
                StartRequest {
                    source_id: source,
                    target_id: target,
                    acknowledged: acknowledge_risk,
                    confirm_database,
                },
            )
            .await
        }
    }
}

async fn handle_connections(state: &AppState, command: ConnectionsCommand) -> Result<i32> {
    match command {
        ConnectionsCommand::Add {
            name,
            uri,
            db,
            environment,
        } => {
            let environment =
                Environment::from_str(&environment).context("parse --environment")?;
            let profile = registry::save_profile(&state.pool, &name, &uri, &db, environment)
                .await
                .context("save connection profile")?;
            println!("Saved profile {} (id {}).", profile.name, profile.id);
            Ok(0)
        }
        ConnectionsCommand::List { json } => {
            let profiles = registry::list_profiles(&state.pool)
                .await
                .context("list connection profiles")?;
            if json {
                let serialized = serde_json::to_string_pretty(&profiles)
                    .context("serialize connection profiles")?;
                println!("{serialized}");
            } else {
                print_profiles_table(&profiles);
            }
            Ok(0)
        }
        ConnectionsCommand::Remove { id } => {
            registry::delete_profile(&state.pool, id)
                .await
                .context("delete connection profile")?;
            println!("Deleted profile {id}.");
            Ok(0)
        }
        ConnectionsCommand::Test { id } => {
            let profile = registry::get_profile(&state.pool, id)
                .await
                .context("load connection profile")?;
            let reconciler = StatsReconciler::from_env(ToolSet::from_env());
            match reconciler.ping(&profile).await {
                Ok(version) => {
                    println!("Connected: {version}");
                    Ok(0)
                }
                Err(err) => {
                    eprintln!("Connection failed: {}", err.message());
                    Ok(EXIT_FAILED)
                }
            }
        }
    }
}

async fn handle_stats(state: &AppState, id: i64, json: bool) -> Result<i32> {
    let profile = registry::get_profile(&state.pool, id)
        .await
        .context("load connection profile")?;
    let reconciler = StatsReconciler::from_env(ToolSet::from_env());
    let snapshot = reconciler
        .snapshot(&profile, StatsSide::Source, StatsPhase::Before)
        .await;
    match snapshot {
        Ok(snapshot) => {
            if json {
                let serialized =
                    serde_json::to_string_pretty(&snapshot).context("serialize stats snapshot")?;
                println!("{serialized}");
            } else {
                print_stats_table(&profile, &snapshot);
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("Statistics unavailable: {}", err.message());
            Ok(EXIT_FAILED)
        }
    }
}

async fn handle_preflight(state: &AppState, source: i64, target: i64) -> Result<i32> {
    let source = registry::get_profile(&state.pool, source)
        .await
        .context("load source profile")?;
    let target = registry::get_profile(&state.pool, target)
        .await
        .context("load target profile")?;
    let reconciler = StatsReconciler::from_env(ToolSet::from_env());

    let checks = reconciler.preflight(&source, &target).await;
    let mut all_passed = true;
    for check in &checks {
        let status = if check.passed { "pass" } else { "fail" };
        println!("{status:<5} {}", check.detail);
        all_passed &= check.passed;
    }
    Ok(if all_passed { 0 } else { EXIT_FAILED })
}

async fn handle_migrate(state: &AppState, request: StartRequest) -> Result<i32> {
    let job_id = match state.orchestrator.start(request).await {
        Ok(job_id) => job_id,
        Err(err) if err.code() == CONFIRMATION_MISMATCH || err.code() == JOB_IN_PROGRESS => {
            eprintln!("Rejected ({}): {}", err.code(), err.message());
            return Ok(EXIT_REJECTED);
        }
        Err(err) => return Err(err.into()),
    };
    println!("Job {job_id} started. Press Ctrl-C to cancel.");

    if let Some(mut rx) = state.orchestrator.subscribe(&job_id) {
        let mut cancel_armed = false;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        eprintln!("(fell behind; {skipped} events skipped)");
                    }
                    Err(RecvError::Closed) => break,
                },
                signal = tokio::signal::ctrl_c(), if !cancel_armed => {
                    signal.context("listen for ctrl-c")?;
                    cancel_armed = true;
                    eprintln!("Cancellation requested; waiting for the job to stop...");
                    let _ = state.orchestrator.cancel(&job_id);
                }
            }
        }
    }

    let job = state
        .orchestrator
        .job_snapshot(&job_id)
        .context("job snapshot after completion")?;

    println!();
    print_outcome(&job.pre_stats, &job.post_stats);
    match job.state {
        JobState::Completed => {
            println!("Migration completed successfully.");
            Ok(0)
        }
        JobState::Cancelled => {
            println!("Migration cancelled.");
            Ok(EXIT_CANCELLED)
        }
        other => {
            if let Some(err) = &job.error {
                println!("Migration failed ({}): {}", err.code(), err.message());
            } else {
                println!("Migration ended in state {}.", other.as_str());
            }
            Ok(EXIT_FAILED)
        }
    }
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::Log { line, .. } => {
            let tag = match line.source {
                LogSource::Export => "export",
                LogSource::Import => "import",
                LogSource::System => "system",
            };
            println!("[{tag:<6}] {}", line.text);
        }
        JobEvent::State { state, .. } => {
            println!("== {}", state.as_str());
        }
        JobEvent::Stats { snapshot, .. } => {
            println!(
                "== stats: {} collections, {} objects",
                snapshot.collections, snapshot.objects
            );
        }
    }
}

fn print_outcome(pre: &Option<StatsSnapshot>, post: &Option<StatsSnapshot>) {
    let describe = |snapshot: &Option<StatsSnapshot>| match snapshot {
        Some(s) => format!("{} collections / {} objects", s.collections, s.objects),
        None => "unavailable".to_string(),
    };
    println!("Source before : {}", describe(pre));
    println!("Target after  : {}", describe(post));
    if let (Some(pre), Some(post)) = (pre, post) {
        if pre.objects != post.objects || pre.collections != post.collections {
            println!("Counts differ; review before trusting the copy (lag, capped collections and TTL expiry all shift counts).");
        }
    }
}

fn print_profiles_table(profiles: &[ConnectionProfile]) {
    if profiles.is_empty() {
        println!("No saved connections.");
        return;
    }
    println!(
        "{:<5} {:<12} {:<20} {:<16} URI",
        "ID", "Environment", "Name", "Database"
    );
    for profile in profiles {
        println!(
            "{:<5} {:<12} {:<20} {:<16} {}",
            profile.id,
            profile.environment.as_str(),
            profile.name,
            profile.database,
            redact::uri_credentials(&profile.uri)
        );
    }
}

fn print_stats_table(profile: &ConnectionProfile, snapshot: &StatsSnapshot) {
    println!("Database statistics for '{}'", profile.name);
    println!("Database     : {}", profile.database);
    println!("Collections  : {}", snapshot.collections);
    println!("Objects      : {}", snapshot.objects);
    println!("Data size    : {} bytes", snapshot.data_size_bytes);
    println!("Storage size : {} bytes", snapshot.storage_size_bytes);
    println!("Captured at  : {}", format_ms(snapshot.captured_at_ms));
}
