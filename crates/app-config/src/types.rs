// In crates/app-config/src/types.rs

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// The application's general settings.
    pub app: AppSettings,
    /// Settings for the Bybit V5 API.
    pub bybit: BybitSettings,
    /// Position sizing parameters.
    pub risk: RiskSettings,
    /// Execution and monitoring parameters.
    pub engine: EngineSettings,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppSettings {
    /// The environment the application is running in (e.g., "development", "production").
    pub environment: String,
    /// The log level for the application.
    pub log_level: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BybitSettings {
    /// The API key for Bybit.
    pub api_key: String,
    /// The secret key for Bybit.
    pub secret_key: String,
    /// The REST API base URL for Bybit.
    pub rest_base_url: String,
    /// The signed-request receive window, in milliseconds.
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
}

fn default_recv_window_ms() -> u64 {
    5_000
}

#[derive(Deserialize, Debug, Clone)]
pub struct RiskSettings {
    /// The percentage of the portfolio risked per trade (e.g., 1.0 for 1%).
    pub risk_per_trade_percent: f64,
    /// The hard leverage cap applied to every position.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
}

fn default_max_leverage() -> u32 {
    20
}

#[derive(Deserialize, Debug, Clone)]
pub struct EngineSettings {
    /// Minimum spacing between outbound exchange calls, in milliseconds.
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    /// How long to wait after placing a market order before verifying the fill.
    #[serde(default = "default_fill_settlement_delay_ms")]
    pub fill_settlement_delay_ms: u64,
    /// Maximum attempts at placing the stop-loss before rolling back.
    #[serde(default = "default_stop_loss_attempts")]
    pub stop_loss_attempts: u32,
    /// Base delay between stop-loss attempts; attempt N waits N * this value.
    #[serde(default = "default_stop_loss_retry_delay_ms")]
    pub stop_loss_retry_delay_ms: u64,
    /// Monitoring poll interval, in seconds.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Completed positions idle longer than this are dropped from the registry.
    #[serde(default = "default_cleanup_max_age_hours")]
    pub cleanup_max_age_hours: u64,
}

fn default_min_request_interval_ms() -> u64 {
    350
}

fn default_fill_settlement_delay_ms() -> u64 {
    2_000
}

fn default_stop_loss_attempts() -> u32 {
    3
}

fn default_stop_loss_retry_delay_ms() -> u64 {
    1_000
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_cleanup_max_age_hours() -> u64 {
    24
}
