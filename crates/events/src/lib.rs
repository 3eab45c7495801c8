// In crates/events/src/lib.rs

// --- Engine Event Structures ---

use chrono::{DateTime, Utc};
use core_types::{ParsedSignal, Position, Side, Symbol};
use rust_decimal::Decimal;
use serde::Serialize;

/// A periodic snapshot of the engine's tracked positions.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_positions: usize,
    pub active_positions: usize,
    pub total_pnl: Decimal,
}

/// The top-level engine event enum, consumed by an external observer.
/// `tag` and `content` are used by serde for clean JSON representation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    SignalReceived(ParsedSignal),
    SignalRejected { symbol: Symbol, reason: String },
    TradeStarted { symbol: Symbol, side: Side },
    TradeExecuted { symbol: Symbol, order_id: String, size: Decimal, entry_price: Decimal, leverage: u32 },
    TradeFailed { symbol: Symbol, reason: String },
    StopLossAdjusted { position_id: String, from: Decimal, to: Decimal },
    TakeProfitHit { position_id: String, level: u8, price: Decimal },
    RollbackInitiated { symbol: Symbol, reason: String },
    RollbackCompleted { symbol: Symbol, flattened_size: Decimal },
    /// The position may exist on the exchange with no safety orders and no
    /// local tracking record. Manual intervention required.
    RollbackFailed { symbol: Symbol, reason: String },
    PositionCreated(Position),
    PositionClosed { position_id: String, reason: String, pnl: Decimal },
    StatusSnapshot(StatusSnapshot),
}
