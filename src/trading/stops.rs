//! Stop-loss / take-profit placement and the broker minimum-distance clamp.

use rust_decimal::Decimal;

use crate::models::{Direction, SymbolInfo};

/// Stop level assumed when the broker reports none, in points.
pub const DEFAULT_STOPS_LEVEL: u32 = 10;

/// Protective levels for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stops {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Minimum distance between entry and any stop, in price units.
pub fn min_stop_distance(symbol: &SymbolInfo) -> Decimal {
    let level = if symbol.stops_level == 0 {
        DEFAULT_STOPS_LEVEL
    } else {
        symbol.stops_level
    };
    symbol.point * Decimal::from(level)
}

/// Move a stop-loss that is closer than `min_distance` to exactly `min_distance` away.
pub fn clamp_stop(direction: Direction, entry: Decimal, stop: Decimal, min_distance: Decimal) -> Decimal {
    match direction {
        Direction::Buy if entry - stop < min_distance => entry - min_distance,
        Direction::Sell if stop - entry < min_distance => entry + min_distance,
        _ => stop,
    }
}

/// Move a take-profit that is closer than `min_distance` to exactly `min_distance` away.
pub fn clamp_target(direction: Direction, entry: Decimal, target: Decimal, min_distance: Decimal) -> Decimal {
    match direction {
        Direction::Buy if target - entry < min_distance => entry + min_distance,
        Direction::Sell if entry - target < min_distance => entry - min_distance,
        _ => target,
    }
}

/// Stops `stop_loss_pips` / `take_profit_pips` points from `entry`, clamped
/// to the broker minimum and rounded to the symbol's digits.
///
/// A `None` distance means no level on that side.
pub fn compute_stops(
    direction: Direction,
    entry: Decimal,
    stop_loss_pips: Option<u32>,
    take_profit_pips: Option<u32>,
    symbol: &SymbolInfo,
) -> Stops {
    let min_distance = min_stop_distance(symbol);
    let offset = |pips: u32| symbol.point * Decimal::from(pips);

    let stop_loss = stop_loss_pips.map(|pips| {
        let raw = match direction {
            Direction::Buy => entry - offset(pips),
            Direction::Sell => entry + offset(pips),
        };
        symbol.normalize(clamp_stop(direction, entry, raw, min_distance))
    });

    let take_profit = take_profit_pips.map(|pips| {
        let raw = match direction {
            Direction::Buy => entry + offset(pips),
            Direction::Sell => entry - offset(pips),
        };
        symbol.normalize(clamp_target(direction, entry, raw, min_distance))
    });

    Stops { stop_loss, take_profit }
}
