// In crates/engine/src/manager.rs

use crate::trailing;
use crate::{Error, Result};
use api_client::ExchangeApi;
use chrono::Utc;
use core_types::{ParsedSignal, Position, PositionStatus, Symbol, TakeProfitLevel};
use dispatcher::RequestDispatcher;
use events::{EngineEvent, StatusSnapshot};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Tunables for the monitoring loop and registry hygiene.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub monitor_interval: Duration,
    /// Completed positions idle longer than this are dropped.
    pub cleanup_max_age: Duration,
    /// Opportunistic cleanup runs every this many monitoring cycles.
    pub cleanup_every_cycles: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(10),
            cleanup_max_age: Duration::from_secs(24 * 60 * 60),
            cleanup_every_cycles: 60,
        }
    }
}

/// Aggregate registry counts. A pure read; see `get_position_stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionStats {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub total_pnl: Decimal,
    pub active_pnl: Decimal,
}

/// Owns the in-memory position registry and its lifecycle.
///
/// Positions are created only after a trade is confirmed filled, mutated
/// only by the monitoring poll or an explicit manual close, and removed only
/// by age-based cleanup once completed. The monitoring poll refreshes mark
/// price and PnL for every active position and drives the stop-loss-trailing
/// state machine keyed on take-profit hits.
pub struct PositionLifecycleManager {
    api: Arc<dyn ExchangeApi>,
    dispatcher: RequestDispatcher,
    events: broadcast::Sender<EngineEvent>,
    settings: LifecycleSettings,
    positions: Mutex<HashMap<String, Position>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PositionLifecycleManager {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        dispatcher: RequestDispatcher,
        events: broadcast::Sender<EngineEvent>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            api,
            dispatcher,
            events,
            settings,
            positions: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Registers a confirmed fill as a new ACTIVE position.
    ///
    /// The take-profit ladder is copied from the signal with every level
    /// unfilled. At most one active position may exist per symbol.
    pub async fn create_position(
        &self,
        signal: &ParsedSignal,
        order_id: &str,
        leverage: u32,
        size: Decimal,
        entry_price: Decimal,
    ) -> Result<Position> {
        let mut positions = self.positions.lock().await;

        let duplicate = positions
            .values()
            .any(|p| p.status == PositionStatus::Active && p.symbol == signal.symbol);
        if duplicate {
            return Err(Error::DuplicatePosition {
                symbol: signal.symbol.0.clone(),
            });
        }

        let now = Utc::now();
        let id = format!("{}_{}", signal.symbol.0, now.timestamp_millis());
        let position = Position {
            id: id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            size,
            entry_price,
            current_price: entry_price,
            stop_loss: signal.stop_loss,
            take_profits: signal
                .take_profits
                .iter()
                .map(|tp| TakeProfitLevel {
                    level: tp.level,
                    price: tp.price,
                    filled: false,
                })
                .collect(),
            leverage,
            unrealized_pnl: Decimal::ZERO,
            status: PositionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        positions.insert(id.clone(), position.clone());

        tracing::info!(
            position_id = %id,
            symbol = %signal.symbol,
            order_id,
            size = %size,
            entry_price = %entry_price,
            leverage,
            "Position registered."
        );
        let _ = self.events.send(EngineEvent::PositionCreated(position.clone()));

        Ok(position)
    }

    /// The active position for `symbol`, if any.
    pub async fn active_position_for_symbol(&self, symbol: &Symbol) -> Option<Position> {
        self.positions
            .lock()
            .await
            .values()
            .find(|p| p.status == PositionStatus::Active && &p.symbol == symbol)
            .cloned()
    }

    pub async fn get_position(&self, id: &str) -> Option<Position> {
        self.positions.lock().await.get(id).cloned()
    }

    /// Starts the recurring monitoring poll. A no-op when already running.
    pub async fn start_monitoring(self: &Arc<Self>) {
        let mut guard = self.monitor.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                tracing::debug!("Monitoring is already running; ignoring start request.");
                return;
            }
        }

        let manager = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = interval(manager.settings.monitor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cycles: u64 = 0;
            loop {
                ticker.tick().await;
                manager.poll_once().await;

                cycles += 1;
                if manager.settings.cleanup_every_cycles > 0
                    && cycles % manager.settings.cleanup_every_cycles == 0
                {
                    let removed = manager
                        .cleanup_old_positions(manager.settings.cleanup_max_age)
                        .await;
                    if removed > 0 {
                        tracing::info!(removed, "Cleaned up stale completed positions.");
                    }
                }

                let stats = manager.get_position_stats().await;
                let _ = manager.events.send(EngineEvent::StatusSnapshot(StatusSnapshot {
                    timestamp: Utc::now(),
                    total_positions: stats.total,
                    active_positions: stats.active,
                    total_pnl: stats.total_pnl,
                }));
            }
        }));
        tracing::info!("Position monitoring started.");
    }

    /// Stops the monitoring poll. Cancels future polls only; a poll already
    /// in flight is not interrupted mid-update. A no-op when not running.
    pub async fn stop_monitoring(&self) {
        let mut guard = self.monitor.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            tracing::info!("Position monitoring stopped.");
        }
    }

    /// One monitoring pass over every active position. Errors are logged per
    /// position and never halt the pass.
    pub async fn poll_once(&self) {
        let snapshot: Vec<(String, Symbol)> = {
            let positions = self.positions.lock().await;
            positions
                .values()
                .filter(|p| p.status == PositionStatus::Active)
                .map(|p| (p.id.clone(), p.symbol.clone()))
                .collect()
        };

        for (id, symbol) in snapshot {
            if let Err(e) = self.poll_position(&id, &symbol).await {
                tracing::warn!(position_id = %id, error = %e, "Monitoring update failed.");
            }
        }
    }

    async fn poll_position(&self, id: &str, symbol: &Symbol) -> Result<()> {
        let live = {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            self.dispatcher
                .enqueue(move || async move { api.position(&sym).await })
                .await?
        };

        // No live position means it was closed on the exchange (stop-loss or
        // final take-profit filled, or a manual close outside the engine).
        let Some(live) = live else {
            let mut positions = self.positions.lock().await;
            if let Some(position) = positions.get_mut(id) {
                position.status = PositionStatus::Completed;
                position.updated_at = Utc::now();
                tracing::info!(position_id = %id, pnl = %position.unrealized_pnl, "Position closed on exchange.");
                let _ = self.events.send(EngineEvent::PositionClosed {
                    position_id: id.to_string(),
                    reason: "no longer on exchange".to_string(),
                    pnl: position.unrealized_pnl,
                });
            }
            return Ok(());
        };

        // Refresh price/PnL and detect freshly crossed take-profit levels.
        let pending_stop = {
            let mut positions = self.positions.lock().await;
            let Some(position) = positions.get_mut(id) else {
                return Ok(());
            };

            let previous = position.current_price;
            let current = live.mark_price.unwrap_or(previous);
            position.current_price = current;
            position.unrealized_pnl = live
                .unrealised_pnl
                .unwrap_or_else(|| position.pnl_at(current));
            position.updated_at = Utc::now();

            for i in 0..position.take_profits.len() {
                let tp = position.take_profits[i];
                if tp.filled {
                    continue;
                }
                if trailing::crossed(position.side, previous, current, tp.price) {
                    position.take_profits[i].filled = true;
                    tracing::info!(
                        position_id = %id,
                        level = tp.level,
                        price = %tp.price,
                        "Take-profit level hit."
                    );
                    let _ = self.events.send(EngineEvent::TakeProfitHit {
                        position_id: id.to_string(),
                        level: tp.level,
                        price: tp.price,
                    });
                }
            }

            // The stop target is re-derived from the highest filled level on
            // every poll, not just on a fresh crossing. A trading-stop call
            // that failed last cycle is retried until it lands; the
            // favorability guard keeps a landed stop from being re-sent.
            let highest_filled = position
                .take_profits
                .iter()
                .filter(|tp| tp.filled)
                .map(|tp| tp.level)
                .max();
            highest_filled
                .and_then(|level| trailing::stop_after_level(position, level))
                .filter(|c| trailing::is_more_favorable(position.side, position.stop_loss, *c))
                .map(|c| (position.stop_loss, c))
        };

        if let Some((from, to)) = pending_stop {
            {
                let api = Arc::clone(&self.api);
                let sym = symbol.clone();
                self.dispatcher
                    .enqueue(move || async move { api.set_stop_loss(&sym, to).await })
                    .await?;
            }

            let mut positions = self.positions.lock().await;
            if let Some(position) = positions.get_mut(id) {
                position.stop_loss = to;
                position.updated_at = Utc::now();
            }
            tracing::info!(position_id = %id, from = %from, to = %to, "Stop-loss trailed.");
            let _ = self.events.send(EngineEvent::StopLossAdjusted {
                position_id: id.to_string(),
                from,
                to,
            });
        }

        Ok(())
    }

    /// Manually terminates an active position.
    ///
    /// Cancels outstanding orders for the symbol, flattens at the live size
    /// and marks the record completed. Returns `false` when the position was
    /// not active (already closed, unknown, or still pending).
    pub async fn close_position(&self, id: &str, reason: &str) -> Result<bool> {
        let (symbol, side) = {
            let positions = self.positions.lock().await;
            match positions.get(id) {
                Some(p) if p.status == PositionStatus::Active => (p.symbol.clone(), p.side),
                _ => return Ok(false),
            }
        };

        // Best-effort cancellation of the remaining safety orders; a failure
        // here must not prevent the flatten.
        let orders = {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            self.dispatcher
                .enqueue(move || async move { api.open_orders(&sym).await })
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(position_id = %id, error = %e, "Could not list open orders.");
                    Vec::new()
                })
        };
        for order in orders {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            let order_id = order.order_id.clone();
            let result = self
                .dispatcher
                .enqueue(move || async move { api.cancel_order(&sym, &order_id).await })
                .await;
            if let Err(e) = result {
                tracing::warn!(order_id = %order.order_id, error = %e, "Order cancellation failed.");
            }
        }

        // Flatten at the exchange-confirmed remaining size, not our record.
        let live = {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            self.dispatcher
                .enqueue(move || async move { api.position(&sym).await })
                .await?
        };
        if let Some(live) = live {
            if live.size > Decimal::ZERO {
                let api = Arc::clone(&self.api);
                let sym = symbol.clone();
                let flatten_side = live.position_side().unwrap_or(side).opposite();
                let size = live.size;
                self.dispatcher
                    .enqueue(move || async move {
                        api.place_market_order(&sym, flatten_side, size, true).await
                    })
                    .await?;
            }
        }

        let pnl = {
            let mut positions = self.positions.lock().await;
            match positions.get_mut(id) {
                Some(position) => {
                    position.status = PositionStatus::Completed;
                    position.updated_at = Utc::now();
                    position.unrealized_pnl
                }
                None => Decimal::ZERO,
            }
        };

        tracing::info!(position_id = %id, reason, %pnl, "Position closed.");
        let _ = self.events.send(EngineEvent::PositionClosed {
            position_id: id.to_string(),
            reason: reason.to_string(),
            pnl,
        });
        Ok(true)
    }

    /// Drops completed positions whose last update is older than `max_age`.
    /// Returns the number of records removed.
    pub async fn cleanup_old_positions(&self, max_age: Duration) -> usize {
        let age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = Utc::now() - age;

        let mut positions = self.positions.lock().await;
        let before = positions.len();
        positions.retain(|_, p| !(p.status == PositionStatus::Completed && p.updated_at < cutoff));
        before - positions.len()
    }

    /// Aggregate counts and summed PnL. A pure read.
    pub async fn get_position_stats(&self) -> PositionStats {
        let positions = self.positions.lock().await;
        let mut stats = PositionStats {
            total: positions.len(),
            active: 0,
            completed: 0,
            total_pnl: Decimal::ZERO,
            active_pnl: Decimal::ZERO,
        };
        for position in positions.values() {
            stats.total_pnl += position.unrealized_pnl;
            match position.status {
                PositionStatus::Active => {
                    stats.active += 1;
                    stats.active_pnl += position.unrealized_pnl;
                }
                PositionStatus::Completed => stats.completed += 1,
                _ => {}
            }
        }
        stats
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, position: Position) {
        self.positions
            .lock()
            .await
            .insert(position.id.clone(), position);
    }
}
