// In crates/engine/src/lib.rs

use api_client::ExchangeApi;
use core_types::{ParsedSignal, Position, Symbol};
use dispatcher::RequestDispatcher;
use events::EngineEvent;
use execution::{ExecutionSettings, TradeExecutionCoordinator};
use risk::PositionSizer;
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod error;
pub mod manager;
pub mod trailing;

#[cfg(test)]
mod testing;

// Re-export public types
pub use error::{Error, Result};
pub use manager::{LifecycleSettings, PositionLifecycleManager, PositionStats};

/// The engine's public face: signal intake, trade execution and position
/// lifecycle behind one handle.
///
/// Construction wires the coordinator and lifecycle manager to the same
/// exchange client, request dispatcher and event channel, so every exchange
/// call in the process flows through one rate-limited queue and every
/// consumer sees one event stream.
pub struct TradingEngine {
    api: Arc<dyn ExchangeApi>,
    dispatcher: RequestDispatcher,
    coordinator: TradeExecutionCoordinator,
    positions: Arc<PositionLifecycleManager>,
    events: broadcast::Sender<EngineEvent>,
}

impl TradingEngine {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        dispatcher: RequestDispatcher,
        sizer: PositionSizer,
        events: broadcast::Sender<EngineEvent>,
        execution_settings: ExecutionSettings,
        lifecycle_settings: LifecycleSettings,
    ) -> Self {
        let coordinator = TradeExecutionCoordinator::new(
            Arc::clone(&api),
            dispatcher.clone(),
            sizer,
            events.clone(),
            execution_settings,
        );
        let positions = Arc::new(PositionLifecycleManager::new(
            Arc::clone(&api),
            dispatcher.clone(),
            events.clone(),
            lifecycle_settings,
        ));
        Self {
            api,
            dispatcher,
            coordinator,
            positions,
            events,
        }
    }

    /// A receiver for the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Verifies exchange connectivity and credentials before trading starts.
    pub async fn health_check(&self) -> Result<()> {
        let time = {
            let api = Arc::clone(&self.api);
            self.dispatcher
                .enqueue(move || async move { api.server_time().await })
                .await?
        };
        let balance = {
            let api = Arc::clone(&self.api);
            self.dispatcher
                .enqueue(move || async move { api.wallet_balance().await })
                .await?
        };
        tracing::info!(server_time = time, balance = %balance, "Exchange health check passed.");
        Ok(())
    }

    /// Handles one parsed signal end to end: validate, reject duplicates,
    /// execute against the exchange, then register the confirmed position.
    pub async fn handle_signal(&self, signal: ParsedSignal) -> Result<Position> {
        let _ = self.events.send(EngineEvent::SignalReceived(signal.clone()));

        if let Err(e) = signal.validate() {
            let _ = self.events.send(EngineEvent::SignalRejected {
                symbol: signal.symbol.clone(),
                reason: e.to_string(),
            });
            return Err(e.into());
        }

        // Checked before spending any exchange calls; create_position holds
        // the authoritative check under its own lock.
        if self
            .positions
            .active_position_for_symbol(&signal.symbol)
            .await
            .is_some()
        {
            let _ = self.events.send(EngineEvent::SignalRejected {
                symbol: signal.symbol.clone(),
                reason: "an active position already exists".to_string(),
            });
            return Err(Error::DuplicatePosition {
                symbol: signal.symbol.0.clone(),
            });
        }

        let portfolio_value = {
            let api = Arc::clone(&self.api);
            self.dispatcher
                .enqueue(move || async move { api.wallet_balance().await })
                .await?
        };

        let outcome = self.coordinator.execute_trade(&signal, portfolio_value).await?;

        let position = self
            .positions
            .create_position(
                &signal,
                &outcome.order_id,
                outcome.leverage,
                outcome.size,
                outcome.entry_price,
            )
            .await?;
        Ok(position)
    }

    /// Starts the recurring position monitoring poll.
    pub async fn start(&self) {
        self.positions.start_monitoring().await;
    }

    /// Stops monitoring. Open positions keep their exchange-side safety
    /// orders; only the local poll stops.
    pub async fn stop(&self) {
        self.positions.stop_monitoring().await;
    }

    pub async fn close_position(&self, id: &str, reason: &str) -> Result<bool> {
        self.positions.close_position(id, reason).await
    }

    pub async fn active_position_for_symbol(&self, symbol: &Symbol) -> Option<Position> {
        self.positions.active_position_for_symbol(symbol).await
    }

    pub async fn position_stats(&self) -> PositionStats {
        self.positions.get_position_stats().await
    }

    /// Direct access to the lifecycle manager, for callers that need more
    /// than the passthroughs above.
    pub fn positions(&self) -> Arc<PositionLifecycleManager> {
        Arc::clone(&self.positions)
    }
}
