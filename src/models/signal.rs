//! Signal model: one newly opened position observed on the source account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    /// The other side of the book.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record appended to the remote log by the source adapter.
///
/// Field names on the wire follow the log table: `ts`, `ticket`, `symbol`, `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Detection time on the source; strictly increasing per source
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// Ticket of the position on the source account
    pub ticket: u64,

    /// Symbol name as the source broker spells it
    pub symbol: String,

    /// Direction opened on the source
    #[serde(rename = "type")]
    pub direction: Direction,
}

impl Signal {
    pub fn new(timestamp: DateTime<Utc>, ticket: u64, symbol: impl Into<String>, direction: Direction) -> Self {
        Self {
            timestamp,
            ticket,
            symbol: symbol.into(),
            direction,
        }
    }
}
