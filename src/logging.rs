//! Logging setup.
//!
//! Installs a `tracing-subscriber` formatter driven by [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when set.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Initialize the global tracing subscriber.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case the existing one is kept.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    match result {
        Ok(()) => {
            tracing::debug!("Logging initialized at {:?}", config.level);
            true
        }
        Err(_) => {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
            false
        }
    }
}
