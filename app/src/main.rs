// In app/src/main.rs

use anyhow::{Context, Result};
use api_client::ApiClient;
use core_types::ParsedSignal;
use dispatcher::RequestDispatcher;
use engine::{LifecycleSettings, TradingEngine};
use events::EngineEvent;
use execution::ExecutionSettings;
use risk::{PositionSizer, SizerSettings};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

// --- Main Application Entry Point ---

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a .env file, if it exists.
    dotenvy::dotenv().ok();

    let settings = app_config::load_settings().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.app.log_level.clone().into()),
        )
        .init();

    tracing::info!(environment = %settings.app.environment, "Starting trade execution engine");

    // --- Wiring ---
    // One client, one dispatcher, one event channel; every component shares
    // them so all outbound calls flow through a single rate-limited queue.
    let api = Arc::new(ApiClient::new(&settings.bybit)?);
    let dispatcher = RequestDispatcher::new(Duration::from_millis(
        settings.engine.min_request_interval_ms,
    ));
    let (events, _) = broadcast::channel::<EngineEvent>(1024);

    let sizer = PositionSizer::new(SizerSettings {
        risk_per_trade_percent: Decimal::from_f64(settings.risk.risk_per_trade_percent)
            .unwrap_or(Decimal::ONE),
        max_leverage: settings.risk.max_leverage,
    });

    let engine = Arc::new(TradingEngine::new(
        api,
        dispatcher,
        sizer,
        events,
        ExecutionSettings {
            fill_settlement_delay: Duration::from_millis(settings.engine.fill_settlement_delay_ms),
            stop_loss_attempts: settings.engine.stop_loss_attempts,
            stop_loss_retry_delay: Duration::from_millis(settings.engine.stop_loss_retry_delay_ms),
            ..ExecutionSettings::default()
        },
        LifecycleSettings {
            monitor_interval: Duration::from_secs(settings.engine.monitor_interval_secs),
            cleanup_max_age: Duration::from_secs(settings.engine.cleanup_max_age_hours * 3600),
            ..LifecycleSettings::default()
        },
    ));

    engine
        .health_check()
        .await
        .context("Exchange health check failed")?;

    engine.start().await;
    tokio::spawn(log_events(engine.subscribe()));
    tokio::spawn(read_signals(Arc::clone(&engine)));

    tracing::info!("Engine running. Send JSON signals on stdin; Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received.");
    engine.stop().await;
    Ok(())
}

/// Serializes every engine event to a JSON line at info level.
async fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(target: "engine_events", event = %json),
                Err(e) => tracing::warn!(error = %e, "Could not serialize engine event."),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger fell behind; events dropped.");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Reads line-delimited JSON signals from stdin and hands each one to the
/// engine. A malformed line or a rejected signal is logged and skipped.
async fn read_signals(engine: Arc<TradingEngine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("Signal input closed.");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not read from signal input.");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let signal: ParsedSignal = match serde_json::from_str(&line) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed signal line.");
                continue;
            }
        };

        match engine.handle_signal(signal).await {
            Ok(position) => {
                tracing::info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    "Signal handled; position open."
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Signal handling failed.");
            }
        }
    }
}
