//! # Structured Logging
//!
//! Installs a `tracing` subscriber configured from [`LoggingConfig`].
//!
//! `RUST_LOG` overrides the configured level when set, using the usual
//! `EnvFilter` directive syntax, e.g. `RUST_LOG=votifier_protocol=debug`.
//! Output goes to stderr, plain or JSON lines.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Returns an error instead of panicking when a global subscriber is
/// already installed, so hosts and tests can call it unconditionally.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let installed = if config.json_format {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(
        app = %config.app_name,
        json = config.json_format,
        "logging initialized"
    );
    Ok(())
}
