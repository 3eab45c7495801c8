// In crates/core-types/src/types.rs

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A trading pair symbol (e.g., "BTCUSDT").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The direction of a trade or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The flattening side for this position side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

/// The requested entry price of a signal.
///
/// `Market` means "enter at the current mark price", resolved by the
/// execution coordinator immediately before sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EntryPrice {
    Market,
    Limit(Decimal),
}

/// One rung of a signal's take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    /// The ladder level, a dense sequence starting at 1.
    pub level: u8,
    pub price: Decimal,
}

/// A validated trading intent, produced by the (external) signal source.
///
/// The engine consumes this value as-is; parsing and message-source
/// connectivity are collaborator concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSignal {
    pub symbol: Symbol,
    pub side: Side,
    pub entry: EntryPrice,
    pub stop_loss: Decimal,
    /// Ordered ascending by level.
    pub take_profits: Vec<TakeProfitTarget>,
    /// Parser confidence in [0, 1].
    pub confidence: f64,
}

impl ParsedSignal {
    /// Checks the structural invariants of the signal.
    ///
    /// The ladder must be a dense sequence of levels starting at 1 with
    /// strictly monotone prices: increasing for `Long`, decreasing for
    /// `Short`. When the entry is a limit price, every take-profit must sit
    /// on the favorable side of it and the stop-loss on the adverse side.
    pub fn validate(&self) -> Result<()> {
        if self.take_profits.is_empty() {
            return Err(Error::InvalidSignal {
                reason: "take-profit ladder is empty".to_string(),
            });
        }

        for (i, tp) in self.take_profits.iter().enumerate() {
            let expected = (i + 1) as u8;
            if tp.level != expected {
                return Err(Error::InvalidSignal {
                    reason: format!(
                        "take-profit levels must be dense starting at 1 (found {} at index {})",
                        tp.level, i
                    ),
                });
            }
        }

        for pair in self.take_profits.windows(2) {
            let ordered = match self.side {
                Side::Long => pair[1].price > pair[0].price,
                Side::Short => pair[1].price < pair[0].price,
            };
            if !ordered {
                return Err(Error::InvalidSignal {
                    reason: format!(
                        "take-profit prices must be strictly {} for {:?} (level {} -> level {})",
                        if self.side == Side::Long { "increasing" } else { "decreasing" },
                        self.side,
                        pair[0].level,
                        pair[1].level
                    ),
                });
            }
        }

        if let EntryPrice::Limit(entry) = self.entry {
            let first_tp = self.take_profits[0].price;
            let tp_favorable = match self.side {
                Side::Long => first_tp > entry,
                Side::Short => first_tp < entry,
            };
            if !tp_favorable {
                return Err(Error::InvalidSignal {
                    reason: "first take-profit must be beyond the entry price".to_string(),
                });
            }

            let sl_adverse = match self.side {
                Side::Long => self.stop_loss < entry,
                Side::Short => self.stop_loss > entry,
            };
            if !sl_adverse {
                return Err(Error::InvalidSignal {
                    reason: "stop-loss must be on the adverse side of the entry price".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// One rung of a position's take-profit ladder, with fill tracking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub level: u8,
    pub price: Decimal,
    pub filled: bool,
}

/// The lifecycle status of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    Error,
}

/// A position tracked by the lifecycle manager.
///
/// Created only after a trade is confirmed filled; mutated only by the
/// monitoring poll or by an explicit manual close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Derived from symbol + creation timestamp.
    pub id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profits: Vec<TakeProfitLevel>,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Unrealized PnL at `price`: `(price - entry) * size`, sign-flipped for shorts.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        let raw = (price - self.entry_price) * self.size;
        match self.side {
            Side::Long => raw,
            Side::Short => -raw,
        }
    }
}
