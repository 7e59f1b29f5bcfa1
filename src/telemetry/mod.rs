//! Structured logging setup
//!
//! Every component logs through `tracing`; this module installs the
//! subscriber once at startup. Output is compact text by default and JSON
//! lines when `LOG_JSON` is set.
//!
//! # Configuration
//!
//! - `RUST_LOG` / `LOG_LEVEL`: filter directives (default `info`)
//! - `LOG_JSON`: `true`/`1` for JSON output
//! - `LOG_CONSOLE`: `false`/`0` to silence output entirely

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::infra::{Result, SyncError};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub enable_console: bool,
    pub json_format: bool,
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "df-middleware".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            enable_console: true,
            json_format: false,
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "df-middleware".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            enable_console: std::env::var("LOG_CONSOLE")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            json_format: std::env::var("LOG_JSON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            log_level: std::env::var("LOG_LEVEL")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    let installed = if !config.enable_console {
        subscriber.try_init()
    } else if config.json_format {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        subscriber.with(fmt_layer).try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .compact();
        subscriber.with(fmt_layer).try_init()
    };

    installed.map_err(|e| SyncError::Configuration(format!("tracing init failed: {e}")))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        json = config.json_format,
        "Logging initialized"
    );
    Ok(())
}
