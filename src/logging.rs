//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::defaults::LOG_ENV_VAR;
use crate::error::{FrameBatchError, Result};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Builds the log filter: `FRAMEBATCH_LOG` overrides the configured level.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directive = config
        .level
        .as_directive()
        .parse::<Directive>()
        .map_err(|e| FrameBatchError::ConfigInvalidValue {
            key: "logging.level".to_string(),
            message: e.to_string(),
        })?;

    EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(directive)
        .from_env()
        .map_err(|e| FrameBatchError::ConfigInvalidValue {
            key: LOG_ENV_VAR.to_string(),
            message: e.to_string(),
        })
}

/// Installs a global fmt subscriber.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter(config)?)
        .try_init()
        .is_ok();
    Ok(installed)
}
