// In crates/execution/src/types.rs

use rust_decimal::Decimal;
use std::time::Duration;

/// The states of one trade-execution sequence, in order.
///
/// Rollback is keyed on the last state reached: once an order has been
/// placed, any failure must attempt to flatten whatever filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionState {
    Sizing,
    LeverageSet,
    OrderPlaced,
    FillConfirmed,
    StopLossSet,
    TakeProfitSet,
    Done,
}

impl ExecutionState {
    /// Whether a failure in this state leaves exchange-side exposure that
    /// must be rolled back.
    pub fn rollback_required(&self) -> bool {
        *self >= ExecutionState::OrderPlaced && *self != ExecutionState::Done
    }
}

/// What to do when a take-profit order cannot be placed after the fill.
///
/// `Rollback` (the default) refuses to hold a position without take-profit
/// coverage and flattens it. `Tolerate` keeps the position and leaves
/// profit-taking to the monitoring poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeProfitFailurePolicy {
    Rollback,
    Tolerate,
}

/// Tunables for the execution sequence.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// How long to wait after the market order before verifying the fill.
    pub fill_settlement_delay: Duration,
    /// Maximum stop-loss placement attempts.
    pub stop_loss_attempts: u32,
    /// Base retry delay; attempt N waits N times this value.
    pub stop_loss_retry_delay: Duration,
    pub take_profit_failure_policy: TakeProfitFailurePolicy,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            fill_settlement_delay: Duration::from_secs(2),
            stop_loss_attempts: 3,
            stop_loss_retry_delay: Duration::from_secs(1),
            take_profit_failure_policy: TakeProfitFailurePolicy::Rollback,
        }
    }
}

/// The confirmed result of a successful trade execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeOutcome {
    pub order_id: String,
    pub leverage: u32,
    /// The exchange-confirmed position size, not the requested quantity.
    pub size: Decimal,
    /// The actual average entry price reported by the exchange.
    pub entry_price: Decimal,
}
