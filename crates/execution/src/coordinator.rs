// In crates/execution/src/coordinator.rs

use crate::types::{ExecutionSettings, ExecutionState, TakeProfitFailurePolicy, TradeOutcome};
use crate::{Error, Result};
use api_client::ExchangeApi;
use core_types::{EntryPrice, ParsedSignal, Side, Symbol};
use dispatcher::RequestDispatcher;
use events::EngineEvent;
use risk::PositionSizer;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Orchestrates one trade as a single logical transaction.
///
/// The exchange has no transaction primitive, so the coordinator composes
/// leverage -> order -> fill confirmation -> stop-loss -> take-profit as an
/// explicit state machine and, on any failure at or after order placement,
/// rolls back by flattening whatever actually filled. All exchange calls
/// route through the shared `RequestDispatcher`.
///
/// The coordinator holds no lock; the caller must not run two concurrent
/// executions for the same symbol (the engine facade enforces one active
/// position per symbol).
pub struct TradeExecutionCoordinator {
    api: Arc<dyn ExchangeApi>,
    dispatcher: RequestDispatcher,
    sizer: PositionSizer,
    events: broadcast::Sender<EngineEvent>,
    settings: ExecutionSettings,
}

impl TradeExecutionCoordinator {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        dispatcher: RequestDispatcher,
        sizer: PositionSizer,
        events: broadcast::Sender<EngineEvent>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            api,
            dispatcher,
            sizer,
            events,
            settings,
        }
    }

    /// Executes a validated signal against the exchange.
    ///
    /// On success returns the confirmed order id, leverage, filled size and
    /// actual entry price. On failure the error of the step that broke the
    /// sequence is returned; if an order had already been placed, a rollback
    /// is attempted first and its outcome reported through events.
    pub async fn execute_trade(
        &self,
        signal: &ParsedSignal,
        portfolio_value: Decimal,
    ) -> Result<TradeOutcome> {
        let _ = self.events.send(EngineEvent::TradeStarted {
            symbol: signal.symbol.clone(),
            side: signal.side,
        });

        let mut state = ExecutionState::Sizing;
        match self.run_sequence(signal, portfolio_value, &mut state).await {
            Ok(outcome) => {
                let _ = self.events.send(EngineEvent::TradeExecuted {
                    symbol: signal.symbol.clone(),
                    order_id: outcome.order_id.clone(),
                    size: outcome.size,
                    entry_price: outcome.entry_price,
                    leverage: outcome.leverage,
                });
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(
                    symbol = %signal.symbol,
                    ?state,
                    error = %err,
                    "Trade execution failed."
                );
                if state.rollback_required() {
                    self.rollback(&signal.symbol, signal.side, &err).await;
                }
                let _ = self.events.send(EngineEvent::TradeFailed {
                    symbol: signal.symbol.clone(),
                    reason: err.to_string(),
                });
                // The original error is always what the caller sees, even
                // when the rollback itself failed.
                Err(err)
            }
        }
    }

    async fn run_sequence(
        &self,
        signal: &ParsedSignal,
        portfolio_value: Decimal,
        state: &mut ExecutionState,
    ) -> Result<TradeOutcome> {
        let symbol = &signal.symbol;

        // --- Step 1: Resolve Entry Price ---
        let entry_price = match signal.entry {
            EntryPrice::Limit(price) => price,
            EntryPrice::Market => {
                let api = Arc::clone(&self.api);
                let sym = symbol.clone();
                self.dispatcher
                    .enqueue(move || async move { api.mark_price(&sym).await })
                    .await?
            }
        };

        // --- Step 2: Compute Size and Leverage ---
        let sized = self
            .sizer
            .size_position(portfolio_value, entry_price, signal.stop_loss)?;
        tracing::info!(
            symbol = %symbol,
            size = %sized.size,
            leverage = sized.leverage,
            "Position sized."
        );

        // --- Step 3: Set Leverage ---
        // An "already at this leverage" response is remapped to success by
        // the api-client layer, so retries and repeats are safe here.
        {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            let leverage = sized.leverage;
            self.dispatcher
                .enqueue(move || async move { api.set_leverage(&sym, leverage).await })
                .await?;
        }
        *state = ExecutionState::LeverageSet;

        // --- Step 4: Place the Market Order ---
        // The traded instruments only accept whole-unit quantities.
        let quantity = sized.size.floor();
        if quantity <= Decimal::ZERO {
            return Err(Error::QuantityTooSmall { qty: sized.size });
        }

        let order = {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            let side = signal.side;
            self.dispatcher
                .enqueue(move || async move {
                    api.place_market_order(&sym, side, quantity, false).await
                })
                .await?
        };
        *state = ExecutionState::OrderPlaced;
        tracing::info!(symbol = %symbol, order_id = %order.order_id, "Market order placed.");

        // --- Step 5: Confirm the Fill ---
        // Last point before committing to stop-loss/take-profit placement.
        tokio::time::sleep(self.settings.fill_settlement_delay).await;

        let live = {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            self.dispatcher
                .enqueue(move || async move { api.position(&sym).await })
                .await?
        };
        let (filled_size, actual_entry) = match live {
            Some(position) if position.size > Decimal::ZERO => {
                (position.size, position.avg_price.unwrap_or(entry_price))
            }
            _ => {
                return Err(Error::FillVerificationFailed {
                    symbol: symbol.0.clone(),
                });
            }
        };
        *state = ExecutionState::FillConfirmed;

        // --- Step 6: Set the Stop-Loss (with retries) ---
        self.set_stop_loss_with_retries(symbol, signal.stop_loss)
            .await?;
        *state = ExecutionState::StopLossSet;

        // --- Step 7: Place the Take-Profit Ladder ---
        self.place_take_profits(signal, filled_size).await?;
        *state = ExecutionState::TakeProfitSet;

        *state = ExecutionState::Done;
        Ok(TradeOutcome {
            order_id: order.order_id,
            leverage: sized.leverage,
            size: filled_size,
            entry_price: actual_entry,
        })
    }

    /// Attempts the trading-stop call up to the configured number of times,
    /// backing off `attempt * retry_delay` between attempts.
    async fn set_stop_loss_with_retries(&self, symbol: &Symbol, stop_loss: Decimal) -> Result<()> {
        let attempts = self.settings.stop_loss_attempts.max(1);
        for attempt in 1..=attempts {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            let result = self
                .dispatcher
                .enqueue(move || async move { api.set_stop_loss(&sym, stop_loss).await })
                .await;

            match result {
                Ok(()) => {
                    tracing::info!(symbol = %symbol, stop_loss = %stop_loss, "Stop-loss set.");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        symbol = %symbol,
                        attempt,
                        error = %e,
                        "Stop-loss placement attempt failed."
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.stop_loss_retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(Error::StopLossSetFailed { attempts })
    }

    /// Splits the filled size evenly across the ladder (remainder to the last
    /// level, each rung floored to whole units) and places reduce-only limit
    /// orders.
    async fn place_take_profits(&self, signal: &ParsedSignal, filled_size: Decimal) -> Result<()> {
        let levels = &signal.take_profits;
        let per_level = (filled_size / Decimal::from(levels.len())).floor();

        let mut remaining = filled_size.floor();
        for (i, target) in levels.iter().enumerate() {
            let is_last = i + 1 == levels.len();
            let qty = if is_last { remaining } else { per_level };
            if qty <= Decimal::ZERO {
                continue;
            }

            let result = {
                let api = Arc::clone(&self.api);
                let sym = signal.symbol.clone();
                let side = signal.side.opposite();
                let price = target.price;
                self.dispatcher
                    .enqueue(move || async move {
                        api.place_reduce_only_limit(&sym, side, qty, price).await
                    })
                    .await
            };

            match result {
                Ok(ack) => {
                    tracing::info!(
                        symbol = %signal.symbol,
                        level = target.level,
                        price = %target.price,
                        qty = %qty,
                        order_id = %ack.order_id,
                        "Take-profit order placed."
                    );
                    remaining -= qty;
                }
                Err(e) => match self.settings.take_profit_failure_policy {
                    TakeProfitFailurePolicy::Rollback => {
                        return Err(Error::TakeProfitSetFailed { source: e });
                    }
                    TakeProfitFailurePolicy::Tolerate => {
                        tracing::warn!(
                            symbol = %signal.symbol,
                            level = target.level,
                            error = %e,
                            "Take-profit placement failed; continuing without remaining levels."
                        );
                        return Ok(());
                    }
                },
            }
        }
        Ok(())
    }

    /// Flattens whatever actually filled after a failed sequence.
    ///
    /// The live size is re-queried immediately before the flattening order;
    /// the attempt's own bookkeeping is never trusted for this. A rollback
    /// failure leaves a position on the exchange with no safety orders and
    /// no local tracking record, so it is reported as loudly as possible.
    async fn rollback(&self, symbol: &Symbol, side: Side, trigger: &Error) {
        let _ = self.events.send(EngineEvent::RollbackInitiated {
            symbol: symbol.clone(),
            reason: trigger.to_string(),
        });
        tracing::warn!(symbol = %symbol, trigger = %trigger, "Rolling back trade.");

        let live = {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            self.dispatcher
                .enqueue(move || async move { api.position(&sym).await })
                .await
        };

        let (flatten_size, flatten_side) = match live {
            Ok(Some(position)) if position.size > Decimal::ZERO => {
                let side = position.position_side().unwrap_or(side);
                (position.size, side.opposite())
            }
            Ok(_) => {
                // Nothing filled; there is nothing to undo.
                let _ = self.events.send(EngineEvent::RollbackCompleted {
                    symbol: symbol.clone(),
                    flattened_size: Decimal::ZERO,
                });
                return;
            }
            Err(e) => {
                self.report_rollback_failure(symbol, &e);
                return;
            }
        };

        let result = {
            let api = Arc::clone(&self.api);
            let sym = symbol.clone();
            self.dispatcher
                .enqueue(move || async move {
                    api.place_market_order(&sym, flatten_side, flatten_size, true).await
                })
                .await
        };

        match result {
            Ok(_) => {
                tracing::info!(symbol = %symbol, size = %flatten_size, "Rollback order filled.");
                let _ = self.events.send(EngineEvent::RollbackCompleted {
                    symbol: symbol.clone(),
                    flattened_size: flatten_size,
                });
            }
            Err(e) => self.report_rollback_failure(symbol, &e),
        }
    }

    fn report_rollback_failure(&self, symbol: &Symbol, error: &api_client::Error) {
        tracing::error!(
            symbol = %symbol,
            error = %error,
            "ROLLBACK FAILED. The position may be open on the exchange with no \
             safety orders and no local tracking. Manual intervention required."
        );
        let _ = self.events.send(EngineEvent::RollbackFailed {
            symbol: symbol.clone(),
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::{Error as ApiError, LivePosition, OpenOrder, OrderAck};
    use async_trait::async_trait;
    use core_types::TakeProfitTarget;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use std::time::Duration;

    /// A scriptable mock exchange recording every call in order.
    #[derive(Default)]
    struct MockExchange {
        calls: Mutex<Vec<String>>,
        fail_set_leverage: bool,
        fail_stop_loss: bool,
        fail_take_profit: bool,
        /// Size reported by the position query; `None` means flat.
        live_size: Mutex<Option<Decimal>>,
        live_side: Mutex<String>,
    }

    impl MockExchange {
        fn with_live_position(size: Decimal, side: &str) -> Self {
            Self {
                live_size: Mutex::new(Some(size)),
                live_side: Mutex::new(side.to_string()),
                ..Self::default()
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn rejected() -> ApiError {
            ApiError::ApiError {
                code: 110007,
                msg: "rejected".to_string(),
            }
        }
    }

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn server_time(&self) -> api_client::Result<i64> {
            self.record("server_time".to_string());
            Ok(1_700_000_000)
        }

        async fn wallet_balance(&self) -> api_client::Result<Decimal> {
            self.record("wallet_balance".to_string());
            Ok(dec!(1000))
        }

        async fn position(&self, symbol: &Symbol) -> api_client::Result<Option<LivePosition>> {
            self.record(format!("position {}", symbol.0));
            let size = *self.live_size.lock().unwrap();
            Ok(size.map(|size| LivePosition {
                symbol: symbol.0.clone(),
                side: self.live_side.lock().unwrap().clone(),
                size,
                avg_price: Some(dec!(100.5)),
                mark_price: Some(dec!(100.5)),
                unrealised_pnl: Some(Decimal::ZERO),
                leverage: Some(dec!(20)),
                stop_loss: None,
            }))
        }

        async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> api_client::Result<()> {
            self.record(format!("set_leverage {} {}", symbol.0, leverage));
            if self.fail_set_leverage {
                return Err(Self::rejected());
            }
            Ok(())
        }

        async fn place_market_order(
            &self,
            symbol: &Symbol,
            side: Side,
            qty: Decimal,
            reduce_only: bool,
        ) -> api_client::Result<OrderAck> {
            self.record(format!(
                "market {} {:?} {} reduce_only={}",
                symbol.0, side, qty, reduce_only
            ));
            if reduce_only {
                *self.live_size.lock().unwrap() = None;
            }
            Ok(OrderAck {
                order_id: "ORDER_1".to_string(),
                order_link_id: String::new(),
            })
        }

        async fn place_reduce_only_limit(
            &self,
            symbol: &Symbol,
            side: Side,
            qty: Decimal,
            price: Decimal,
        ) -> api_client::Result<OrderAck> {
            self.record(format!("tp {} {:?} {} @ {}", symbol.0, side, qty, price));
            if self.fail_take_profit {
                return Err(Self::rejected());
            }
            Ok(OrderAck {
                order_id: "TP_1".to_string(),
                order_link_id: String::new(),
            })
        }

        async fn set_stop_loss(&self, symbol: &Symbol, price: Decimal) -> api_client::Result<()> {
            self.record(format!("stop_loss {} @ {}", symbol.0, price));
            if self.fail_stop_loss {
                return Err(Self::rejected());
            }
            Ok(())
        }

        async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> api_client::Result<()> {
            self.record(format!("cancel {} {}", symbol.0, order_id));
            Ok(())
        }

        async fn open_orders(&self, symbol: &Symbol) -> api_client::Result<Vec<OpenOrder>> {
            self.record(format!("open_orders {}", symbol.0));
            Ok(vec![])
        }

        async fn mark_price(&self, symbol: &Symbol) -> api_client::Result<Decimal> {
            self.record(format!("mark_price {}", symbol.0));
            Ok(dec!(100))
        }
    }

    fn long_signal() -> ParsedSignal {
        ParsedSignal {
            symbol: Symbol("BTCUSDT".to_string()),
            side: Side::Long,
            entry: EntryPrice::Limit(dec!(100)),
            stop_loss: dec!(98),
            take_profits: vec![
                TakeProfitTarget { level: 1, price: dec!(102) },
                TakeProfitTarget { level: 2, price: dec!(104) },
                TakeProfitTarget { level: 3, price: dec!(106) },
            ],
            confidence: 0.9,
        }
    }

    fn coordinator(api: Arc<MockExchange>, settings: ExecutionSettings) -> TradeExecutionCoordinator {
        let (events, _) = broadcast::channel(64);
        TradeExecutionCoordinator::new(
            api,
            RequestDispatcher::new(Duration::from_millis(10)),
            PositionSizer::new(risk::SizerSettings::default()),
            events,
            settings,
        )
    }

    fn fast_settings() -> ExecutionSettings {
        ExecutionSettings {
            fill_settlement_delay: Duration::from_millis(50),
            stop_loss_retry_delay: Duration::from_millis(50),
            ..ExecutionSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_runs_the_full_sequence() {
        let api = Arc::new(MockExchange::with_live_position(dec!(100), "Buy"));
        let coordinator = coordinator(Arc::clone(&api), fast_settings());

        let outcome = coordinator
            .execute_trade(&long_signal(), dec!(1000))
            .await
            .unwrap();

        assert_eq!(outcome.order_id, "ORDER_1");
        assert_eq!(outcome.leverage, 20);
        assert_eq!(outcome.size, dec!(100));
        assert_eq!(outcome.entry_price, dec!(100.5));

        let calls = api.calls();
        // leverage -> entry order -> fill query -> stop-loss -> 3 TP rungs.
        assert_eq!(calls[0], "set_leverage BTCUSDT 20");
        assert!(calls[1].starts_with("market BTCUSDT Long"));
        assert!(calls[1].ends_with("reduce_only=false"));
        assert_eq!(calls[2], "position BTCUSDT");
        assert_eq!(calls[3], "stop_loss BTCUSDT @ 98");
        // 100 units across 3 levels: 33 + 33 + 34, opposite side.
        assert_eq!(calls[4], "tp BTCUSDT Short 33 @ 102");
        assert_eq!(calls[5], "tp BTCUSDT Short 33 @ 104");
        assert_eq!(calls[6], "tp BTCUSDT Short 34 @ 106");
        assert_eq!(calls.len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn market_entry_resolves_mark_price_first() {
        let api = Arc::new(MockExchange::with_live_position(dec!(100), "Buy"));
        let coordinator = coordinator(Arc::clone(&api), fast_settings());

        let mut signal = long_signal();
        signal.entry = EntryPrice::Market;
        coordinator.execute_trade(&signal, dec!(1000)).await.unwrap();

        assert_eq!(api.calls()[0], "mark_price BTCUSDT");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_loss_exhaustion_triggers_exactly_one_rollback() {
        let api = Arc::new(MockExchange {
            fail_stop_loss: true,
            ..MockExchange::with_live_position(dec!(100), "Buy")
        });
        let coordinator = coordinator(Arc::clone(&api), fast_settings());

        let err = coordinator
            .execute_trade(&long_signal(), dec!(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StopLossSetFailed { attempts: 3 }));

        let calls = api.calls();
        let sl_attempts = calls.iter().filter(|c| c.starts_with("stop_loss")).count();
        assert_eq!(sl_attempts, 3);

        let flattens: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("market") && c.ends_with("reduce_only=true"))
            .collect();
        assert_eq!(flattens.len(), 1);
        // Flattened at the re-queried live size, opposite side.
        assert_eq!(*flattens[0], "market BTCUSDT Short 100 reduce_only=true");
    }

    #[tokio::test(start_paused = true)]
    async fn pre_order_failure_does_not_roll_back() {
        let api = Arc::new(MockExchange {
            fail_set_leverage: true,
            ..MockExchange::default()
        });
        let coordinator = coordinator(Arc::clone(&api), fast_settings());

        let err = coordinator
            .execute_trade(&long_signal(), dec!(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApiClient(_)));

        let calls = api.calls();
        assert_eq!(calls, vec!["set_leverage BTCUSDT 20".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_fill_fails_verification() {
        // The order is accepted but the position query stays flat.
        let api = Arc::new(MockExchange::default());
        let coordinator = coordinator(Arc::clone(&api), fast_settings());

        let err = coordinator
            .execute_trade(&long_signal(), dec!(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FillVerificationFailed { .. }));

        // Rollback re-queried and found nothing to flatten.
        let calls = api.calls();
        assert!(!calls.iter().any(|c| c.ends_with("reduce_only=true")));
    }

    #[tokio::test(start_paused = true)]
    async fn take_profit_failure_rolls_back_by_default() {
        let api = Arc::new(MockExchange {
            fail_take_profit: true,
            ..MockExchange::with_live_position(dec!(100), "Buy")
        });
        let coordinator = coordinator(Arc::clone(&api), fast_settings());

        let err = coordinator
            .execute_trade(&long_signal(), dec!(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TakeProfitSetFailed { .. }));

        let calls = api.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| c.ends_with("reduce_only=true"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tolerate_policy_keeps_the_position_on_tp_failure() {
        let api = Arc::new(MockExchange {
            fail_take_profit: true,
            ..MockExchange::with_live_position(dec!(100), "Buy")
        });
        let settings = ExecutionSettings {
            take_profit_failure_policy: TakeProfitFailurePolicy::Tolerate,
            ..fast_settings()
        };
        let coordinator = coordinator(Arc::clone(&api), settings);

        let outcome = coordinator.execute_trade(&long_signal(), dec!(1000)).await;
        assert!(outcome.is_ok());
        assert!(!api.calls().iter().any(|c| c.ends_with("reduce_only=true")));
    }

    #[tokio::test(start_paused = true)]
    async fn short_signal_places_a_sell_entry() {
        let api = Arc::new(MockExchange::with_live_position(dec!(100), "Sell"));
        let coordinator = coordinator(Arc::clone(&api), fast_settings());

        let signal = ParsedSignal {
            symbol: Symbol("ETHUSDT".to_string()),
            side: Side::Short,
            entry: EntryPrice::Limit(dec!(100)),
            stop_loss: dec!(102),
            take_profits: vec![TakeProfitTarget { level: 1, price: dec!(98) }],
            confidence: 0.8,
        };
        coordinator.execute_trade(&signal, dec!(1000)).await.unwrap();

        let calls = api.calls();
        assert!(calls.iter().any(|c| c.starts_with("market ETHUSDT Short")));
        // The TP rung closes the short with a buy.
        assert!(calls.iter().any(|c| c.starts_with("tp ETHUSDT Long")));
    }
}
