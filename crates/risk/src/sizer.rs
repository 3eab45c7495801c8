// In crates/risk/src/sizer.rs

use crate::types::{PositionSize, SizerSettings};
use crate::{Error, Result};
use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Fraction of the portfolio that may be committed as margin for one trade.
const MARGIN_CAP_FRACTION: Decimal = dec!(0.8);

/// Decimal places the exchange accepts for base-asset quantities.
const SIZE_PRECISION: u32 = 6;

/// A fixed-fractional position sizer with independent leverage and margin caps.
///
/// Size is derived from the distance between entry and stop-loss so that a
/// stop-out loses exactly the configured risk percentage of the portfolio.
/// The margin cap bounds exposure independently of the stop distance, so a
/// very tight stop cannot produce an arbitrarily large position.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    settings: SizerSettings,
}

impl PositionSizer {
    pub fn new(settings: SizerSettings) -> Self {
        Self { settings }
    }

    /// Computes position size and leverage for one trade.
    ///
    /// # Arguments
    ///
    /// * `portfolio_value`: The total account value in the quote currency.
    /// * `entry_price`: The resolved entry price (never the market sentinel).
    /// * `stop_loss`: The signal's stop-loss price.
    ///
    /// # Returns
    ///
    /// A `PositionSize` with an integer leverage in `[1, max_leverage]` and a
    /// positive size rounded to 6 decimal places, or an error when the inputs
    /// cannot produce one.
    pub fn size_position(
        &self,
        portfolio_value: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
    ) -> Result<PositionSize> {
        if portfolio_value <= Decimal::ZERO {
            return Err(Error::Rejected {
                reason: "portfolio value must be positive".to_string(),
            });
        }
        if entry_price <= Decimal::ZERO {
            return Err(Error::Rejected {
                reason: "entry price must be positive".to_string(),
            });
        }

        let risk_per_unit = (entry_price - stop_loss).abs();
        if risk_per_unit.is_zero() {
            return Err(Error::InvalidRiskDistance);
        }

        let risk_amount = portfolio_value * self.settings.risk_per_trade_percent / dec!(100);
        let raw_units = risk_amount / risk_per_unit;
        let position_value = raw_units * entry_price;

        let max_leverage = Decimal::from(self.settings.max_leverage);
        let required_margin = position_value / max_leverage;
        let margin_cap = portfolio_value * MARGIN_CAP_FRACTION;
        let actual_margin = required_margin.min(margin_cap);
        if actual_margin <= Decimal::ZERO {
            return Err(Error::Rejected {
                reason: "computed margin is zero; check the risk percentage".to_string(),
            });
        }

        // round_dp(8) before flooring absorbs division artifacts a few
        // ulps below a whole number.
        let leverage_raw = (position_value / actual_margin).round_dp(8).floor();
        let leverage_dec = leverage_raw.clamp(Decimal::ONE, max_leverage);
        let leverage = leverage_dec.to_u32().unwrap_or(1);

        let size = (actual_margin * leverage_dec / entry_price).round_dp(SIZE_PRECISION);
        if size <= Decimal::ZERO {
            return Err(Error::Rejected {
                reason: "computed size rounds to zero".to_string(),
            });
        }

        Ok(PositionSize { size, leverage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer(risk_pct: Decimal) -> PositionSizer {
        PositionSizer::new(SizerSettings {
            risk_per_trade_percent: risk_pct,
            max_leverage: 20,
        })
    }

    #[test]
    fn worked_example_from_low_priced_pair() {
        // portfolio 1000, risk 1%, entry 0.300, stop 0.297:
        // riskAmount=10, riskPerUnit=0.003, positionValue~1000,
        // requiredMargin=50, marginCap=800 -> margin 50, leverage 20.
        let result = sizer(dec!(1))
            .size_position(dec!(1000), dec!(0.300), dec!(0.297))
            .unwrap();
        assert_eq!(result.leverage, 20);
        assert_eq!(result.size, dec!(3333.333333));
    }

    #[test]
    fn zero_risk_distance_is_rejected() {
        let result = sizer(dec!(1)).size_position(dec!(1000), dec!(100), dec!(100));
        assert!(matches!(result, Err(Error::InvalidRiskDistance)));
    }

    #[test]
    fn tight_stop_is_bounded_by_the_margin_cap() {
        // Without the cap this stop distance would ask for 100k of notional
        // on a 1k account. Margin is capped at 800, leverage at 20.
        let result = sizer(dec!(1))
            .size_position(dec!(1000), dec!(100), dec!(99.99))
            .unwrap();
        assert_eq!(result.leverage, 20);
        assert_eq!(result.size, dec!(160)); // 800 * 20 / 100
    }

    #[test]
    fn leverage_stays_within_bounds_across_inputs() {
        let cases = [
            (dec!(1000), dec!(100), dec!(98)),
            (dec!(1000), dec!(100), dec!(50)),
            (dec!(50), dec!(0.002), dec!(0.0019)),
            (dec!(250000), dec!(30000), dec!(29100)),
        ];
        for (portfolio, entry, stop) in cases {
            let result = sizer(dec!(2)).size_position(portfolio, entry, stop).unwrap();
            assert!(result.leverage >= 1 && result.leverage <= 20);
            assert!(result.size > Decimal::ZERO);
        }
    }

    #[test]
    fn short_direction_uses_absolute_distance() {
        let long = sizer(dec!(1))
            .size_position(dec!(1000), dec!(100), dec!(98))
            .unwrap();
        let short = sizer(dec!(1))
            .size_position(dec!(1000), dec!(100), dec!(102))
            .unwrap();
        assert_eq!(long.size, short.size);
        assert_eq!(long.leverage, short.leverage);
    }

    #[test]
    fn non_positive_portfolio_is_rejected() {
        let result = sizer(dec!(1)).size_position(Decimal::ZERO, dec!(100), dec!(98));
        assert!(matches!(result, Err(Error::Rejected { .. })));
    }
}
