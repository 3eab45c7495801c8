// In crates/app-config/src/lib.rs

use config::{Config, Environment, File};

pub mod error;
pub mod types;

// Re-export the most important types for easy access.
pub use error::{Error, Result};
pub use types::{AppSettings, BybitSettings, EngineSettings, RiskSettings, Settings};

/// Loads the engine's settings from layered sources.
///
/// `config/base.toml` holds shared defaults, an optional per-environment file
/// (selected by `APP_ENVIRONMENT`, default "development") overrides them, and
/// `APP__`-prefixed environment variables override both. Secrets (API keys)
/// are expected to arrive through the environment layer, never from files.
pub fn load_settings() -> Result<Settings> {
    let environment = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".into());

    let settings = Config::builder()
        .add_source(File::with_name("config/base"))
        .add_source(File::with_name(&format!("config/{}", environment)).required(false))
        // e.g. APP_BYBIT__API_KEY maps to settings.bybit.api_key.
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    Ok(settings.try_deserialize::<Settings>()?)
}
