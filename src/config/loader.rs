//! Configuration loader

use config::{Config, Environment, File};
use std::path::Path;

use super::types::{AppConfig, BrokerMode};
use crate::common::errors::{Result, TraderError};

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with TRADER__, `__` between sections)
/// 2. Configuration file (TOML format)
/// 3. Default values
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("TRADER")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| TraderError::Configuration(e.to_string()))?;

    let app: AppConfig = config
        .try_deserialize()
        .map_err(|e| TraderError::Configuration(e.to_string()))?;
    app.validate()?;
    Ok(app)
}

/// Load configuration from environment variables only
///
/// Reads broker credentials from `BROKER_APP_KEY` / `BROKER_APP_SECRET`;
/// everything else keeps its default.
pub fn load_from_env() -> Result<AppConfig> {
    dotenvy::dotenv().ok();

    let mut app = AppConfig::default();
    app.broker.app_key = std::env::var("BROKER_APP_KEY").ok();
    app.broker.app_secret = std::env::var("BROKER_APP_SECRET").ok();
    if let Ok(url) = std::env::var("BROKER_REST_URL") {
        app.broker.rest_url = url;
    }
    if let Ok(url) = std::env::var("BROKER_WS_URL") {
        app.feed.websocket_url = url;
    }
    if app.broker.app_key.is_some() && app.broker.app_secret.is_some() {
        app.broker.mode = BrokerMode::Rest;
    }
    app.validate()?;
    Ok(app)
}
