//! Open position as reported by a mirror account.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Open position owned by the account it lives on.
///
/// The engine never edits one of these; changes go through the account's
/// close/order operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Ticket assigned by the terminal
    pub ticket: u64,

    /// Broker symbol name
    pub symbol: String,

    /// Side of the position
    pub direction: Direction,

    /// Size in lots
    pub volume: Decimal,

    /// Fill price
    pub open_price: Decimal,

    /// Stop-loss level, if any
    #[serde(default)]
    pub stop_loss: Option<Decimal>,

    /// Take-profit level, if any
    #[serde(default)]
    pub take_profit: Option<Decimal>,

    /// Floating profit in account currency
    #[serde(default)]
    pub profit: Decimal,
}

impl Position {
    /// Whether the given price has crossed the stop-loss.
    pub fn stop_hit(&self, price: Decimal) -> bool {
        match (self.stop_loss, self.direction) {
            (Some(sl), Direction::Buy) => price <= sl,
            (Some(sl), Direction::Sell) => price >= sl,
            (None, _) => false,
        }
    }

    /// Whether the given price has crossed the take-profit.
    pub fn target_hit(&self, price: Decimal) -> bool {
        match (self.take_profit, self.direction) {
            (Some(tp), Direction::Buy) => price >= tp,
            (Some(tp), Direction::Sell) => price <= tp,
            (None, _) => false,
        }
    }
}
