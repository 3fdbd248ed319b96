use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use super::config::LogLevel;

static INIT: Once = Once::new();

/// Installs the global tracing subscriber once. `RUST_LOG` wins over the
/// configured level; repeated calls (tests, embedded use) are no-ops.
pub fn setup_logging(level: LogLevel) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str()));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).compact());
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("tracing subscriber was already installed");
        }
    });
}

