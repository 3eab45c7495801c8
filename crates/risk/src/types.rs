// In crates/risk/src/types.rs

use rust_decimal::Decimal;
use serde::Deserialize;

/// The configuration for the position sizer.
#[derive(Deserialize, Debug, Clone)]
pub struct SizerSettings {
    /// The percentage of portfolio value risked per trade (e.g., 1.0 for 1%).
    pub risk_per_trade_percent: Decimal,
    /// The hard leverage cap. Defaults to 20.
    pub max_leverage: u32,
}

impl Default for SizerSettings {
    fn default() -> Self {
        Self {
            risk_per_trade_percent: Decimal::ONE,
            max_leverage: 20,
        }
    }
}

/// The output of a sizing computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSize {
    /// Base-asset quantity, rounded to 6 decimal places.
    pub size: Decimal,
    /// Integer leverage in [1, max_leverage].
    pub leverage: u32,
}
