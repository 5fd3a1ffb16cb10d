pub mod error;
pub mod logging;
pub mod migration;
pub mod redact;
pub mod registry;
pub mod state;

mod id;
mod util;

pub use error::{AppError, AppResult};
pub use state::AppState;

pub use util::format_ms;

/// Install the tracing subscriber (stdout only). See [`logging`] for the
/// file-sink variant.
pub fn init_logging() {
    logging::init();
}
