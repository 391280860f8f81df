//! Tenant identity, evaluation phase and profile loaded from the directory.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::AccountCredentials;

/// Stage of the multi-phase evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phase {
    One,
    Two,
    Three,
    Four,
}

impl Phase {
    pub fn number(&self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
            Phase::Three => 3,
            Phase::Four => 4,
        }
    }

    /// Phase a tenant moves to after passing this one.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::One => Some(Phase::Two),
            Phase::Two => Some(Phase::Three),
            Phase::Three => Some(Phase::Four),
            Phase::Four => None,
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Phase::One),
            2 => Ok(Phase::Two),
            3 => Ok(Phase::Three),
            4 => Ok(Phase::Four),
            other => Err(format!("unknown phase {}", other)),
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> Self {
        phase.number()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "phase {}", self.number())
    }
}

/// Tenant assigned to this deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub user_id: String,
}

/// Everything needed to start a trading session, reloaded on every start.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantProfile {
    pub user_id: String,

    /// Stable per-tenant identifier; seeds the stagger delay
    pub seed: u64,

    pub phase: Phase,

    /// Nominal size of the evaluated account
    pub account_size: Decimal,

    pub mirror_a: AccountCredentials,
    pub mirror_b: AccountCredentials,
}

/// Answer of the directory to "is trading enabled for this tenant?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingStatus {
    Enabled,
    Disabled,
    /// The directory could not be asked; never read as disabled
    Unknown,
}
