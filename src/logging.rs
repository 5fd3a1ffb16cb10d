use std::path::Path;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("drover=info"))
}

/// Install the tracing subscriber with a terminal layer.
///
/// Diagnostics go to stderr so stdout stays clean for the CLI's
/// machine-readable output. Safe to call more than once; only the first
/// call installs anything.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_log::LogTracer::init();
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init();
    });
}

/// Install the subscriber with both the terminal layer and a daily-rolling
/// JSON file sink under `log_dir`. The returned guard must be held for the
/// life of the process or buffered lines are lost on exit.
pub fn init_with_file(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, "drover.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    INIT.call_once(|| {
        let _ = tracing_log::LogTracer::init();
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(fmt::layer().json().with_ansi(false).with_writer(writer))
            .try_init();
    });

    Ok(guard)
}
