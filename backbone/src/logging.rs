use tracing::debug;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSettings;

/// Initialize structured logging for the process.
///
/// `RUST_LOG` wins over the configured level when it is set. Calling this
/// more than once is harmless; only the first subscriber is installed.
pub fn init_logging(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_directive()));

    let installed = fmt()
        .with_env_filter(filter)
        .with_ansi(settings.colorize)
        .with_timer(ChronoLocal::new(settings.time_format.clone()))
        .with_target(false)
        .try_init();

    if installed.is_ok() {
        debug!(level = settings.level.as_directive(), "logging initialized");
    }
}
