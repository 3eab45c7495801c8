// In crates/engine/src/trailing.rs

use core_types::{Position, Side};
use rust_decimal::Decimal;

/// Whether the move from `previous` to `current` crossed a take-profit level.
///
/// Both the previous and new observed prices are required: a level counts as
/// hit only when the previous price was still on the unfavorable side and the
/// new price is at or beyond the level. Comparing only the latest tick would
/// re-trigger already-passed levels on every poll.
pub fn crossed(side: Side, previous: Decimal, current: Decimal, level_price: Decimal) -> bool {
    match side {
        Side::Long => previous < level_price && current >= level_price,
        Side::Short => previous > level_price && current <= level_price,
    }
}

/// The stop-loss target after `level` fills: level 1 moves the stop to the
/// entry price, level k (k >= 2) to the price of level k-1.
pub fn stop_after_level(position: &Position, level: u8) -> Option<Decimal> {
    if level <= 1 {
        return Some(position.entry_price);
    }
    position
        .take_profits
        .iter()
        .find(|tp| tp.level == level - 1)
        .map(|tp| tp.price)
}

/// Whether `candidate` is a strict improvement over the current stop-loss.
///
/// The trailing stop must never move backward, even if polling observes
/// levels out of order.
pub fn is_more_favorable(side: Side, current_stop: Decimal, candidate: Decimal) -> bool {
    match side {
        Side::Long => candidate > current_stop,
        Side::Short => candidate < current_stop,
    }
}
