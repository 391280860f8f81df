//! Account-level data exchanged with a trading terminal.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Balance snapshot of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: u64,
    pub balance: Decimal,
    pub equity: Decimal,
    #[serde(default)]
    pub margin: Decimal,
    #[serde(default)]
    pub currency: String,
}

/// Contract specification of a symbol on one broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,

    /// Smallest price increment
    pub point: Decimal,

    /// Decimal places quoted by the broker
    pub digits: u32,

    /// Minimum distance between price and stops, in points
    #[serde(default)]
    pub stops_level: u32,

    /// Current spread, in points
    #[serde(default)]
    pub spread: u32,
}

impl SymbolInfo {
    /// Round a price to the symbol's quoted precision.
    pub fn normalize(&self, price: Decimal) -> Decimal {
        price.round_dp(self.digits)
    }

    /// Whether the terminal returned a usable specification.
    pub fn is_valid(&self) -> bool {
        self.point > Decimal::ZERO && self.digits > 0
    }
}

/// Top of book for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Tick {
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO || self.ask > Decimal::ZERO
    }

    /// Price at which a market order in `direction` fills.
    pub fn entry_price(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Buy => self.ask,
            Direction::Sell => self.bid,
        }
    }
}

/// Market order submitted to a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Maximum accepted slippage, in points
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
}

/// Terminal acknowledgement of a filled order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub ticket: u64,
}

/// Login material for one terminal.
///
/// The password stays encrypted; the bridge in front of the terminal owns
/// decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredentials {
    pub login: u64,
    pub server: String,
    pub password_enc: String,
    pub key_version: String,
}
