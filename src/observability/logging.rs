//! # Structured Logging
//!
//! Installs the global `tracing` subscriber from the `logging` section. `RUST_LOG`, when
//! set, replaces the configured level entirely.

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config_error;
use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::GatewayResult;

/// Filter directives for a configured level
pub fn default_directives(level: &str) -> GatewayResult<String> {
    let level: Level = level
        .trim()
        .parse()
        .map_err(|_| config_error!("Invalid log level '{}' (expected trace, debug, info, warn or error)", level))?;
    let level = level.to_string().to_ascii_lowercase();
    Ok(format!("policy_gateway={},tower_http=info", level))
}

pub fn build_filter(config: &LoggingConfig) -> GatewayResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = default_directives(&config.level)?;
    EnvFilter::try_new(&directives).map_err(|e| config_error!("Invalid log filter '{}': {}", directives, e))
}

/// Install the global subscriber; a second call keeps the first subscriber
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<()> {
    let filter = build_filter(config)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(())
}
