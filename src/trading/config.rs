//! Copier timings and per-phase trading parameters.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::Phase;

/// Account size the phase table is defined for.
pub const NOMINAL_ACCOUNT_SIZE: Decimal = dec!(100000);

/// Sizing and stop parameters for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub phase: Phase,

    /// Stop-loss distance in points, `None` for no stop
    pub stop_loss_pips: Option<u32>,

    /// Take-profit distance in points, `None` for no target
    pub take_profit_pips: Option<u32>,

    /// Lots on the same-direction account
    pub mirror_a_lots: Decimal,

    /// Lots on the opposite-direction account
    pub mirror_b_lots: Decimal,

    pub mirror_b_enabled: bool,

    /// Profit since the phase baseline that passes the phase
    pub target_profit: Option<Decimal>,
}

impl PhaseConfig {
    fn table(phase: Phase) -> Self {
        match phase {
            Phase::One => Self {
                phase,
                stop_loss_pips: Some(1250),
                take_profit_pips: Some(1250),
                mirror_a_lots: dec!(2.0),
                mirror_b_lots: dec!(0.14),
                mirror_b_enabled: true,
                target_profit: None,
            },
            Phase::Two => Self {
                phase,
                stop_loss_pips: Some(1250),
                take_profit_pips: Some(625),
                mirror_a_lots: dec!(2.0),
                mirror_b_lots: dec!(0.30),
                mirror_b_enabled: true,
                target_profit: None,
            },
            Phase::Three => Self {
                phase,
                stop_loss_pips: None,
                take_profit_pips: None,
                mirror_a_lots: dec!(0.5),
                mirror_b_lots: Decimal::ZERO,
                mirror_b_enabled: false,
                target_profit: Some(dec!(50)),
            },
            Phase::Four => Self {
                phase,
                stop_loss_pips: Some(1250),
                take_profit_pips: Some(625),
                mirror_a_lots: dec!(2.0),
                mirror_b_lots: dec!(0.40),
                mirror_b_enabled: true,
                target_profit: None,
            },
        }
    }

    /// Parameters for `(phase, account_size)`.
    ///
    /// Only the nominal size has a table; any other size falls back to the
    /// phase-1 parameters with a warning.
    pub fn for_phase(phase: Phase, account_size: Decimal) -> Self {
        if account_size != NOMINAL_ACCOUNT_SIZE {
            warn!(
                %phase,
                size = %account_size,
                "No phase parameters for this account size, using phase 1 defaults"
            );
            return Self::table(Phase::One);
        }
        Self::table(phase)
    }

    /// Every phase at the nominal size.
    pub fn all() -> Vec<Self> {
        [Phase::One, Phase::Two, Phase::Three, Phase::Four]
            .into_iter()
            .map(Self::table)
            .collect()
    }
}

/// Timings and limits of the copier.
#[derive(Debug, Clone, PartialEq)]
pub struct CopierConfig {
    pub replication_period: Duration,
    pub sync_period: Duration,
    pub automation_period: Duration,
    pub connectivity_period: Duration,
    pub offline_warn_cooldown: Duration,

    /// Loop iterations between phase evaluations
    pub phase_eval_every: u64,

    /// Loop iterations between trading-enabled checks
    pub enabled_check_every: u64,

    pub start_poll: Duration,
    pub assignment_poll: Duration,

    /// Upper bound of the per-tenant stagger delay
    pub max_stagger: Duration,

    /// Starting balance the phase thresholds are relative to
    pub nominal_balance: Decimal,

    pub remediation_attempts: u32,
    pub rollback_attempts: u32,

    /// Attempts per round at persisting a halt in the directory
    pub halt_attempts: u32,

    /// Consecutive failed login rounds before the operator is alerted
    pub login_alert_after: u32,

    /// First retry delay for rollback closes and market-data reads
    pub retry_base_delay: Duration,

    /// Polls a signal may be deferred before it is skipped
    pub deferred_attempts: u32,

    /// Oldest signal picked up when a session starts
    pub max_signal_age: Duration,

    pub login_backoff_initial: Duration,
    pub login_backoff_max: Duration,

    /// Max slippage on orders, in points
    pub deviation: u32,
    pub magic_a: u64,
    pub magic_b: u64,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            replication_period: Duration::from_millis(100),
            sync_period: Duration::from_millis(500),
            automation_period: Duration::from_secs(10),
            connectivity_period: Duration::from_secs(2),
            offline_warn_cooldown: Duration::from_secs(5),
            phase_eval_every: 100,                          // ~10s at 100ms
            enabled_check_every: 10,                        // ~1s at 100ms
            start_poll: Duration::from_secs(5),
            assignment_poll: Duration::from_secs(10),
            max_stagger: Duration::from_secs(10),
            nominal_balance: NOMINAL_ACCOUNT_SIZE,
            remediation_attempts: 3,
            rollback_attempts: 3,
            halt_attempts: 5,
            login_alert_after: 3,
            retry_base_delay: Duration::from_millis(300),
            deferred_attempts: 3,
            max_signal_age: Duration::from_secs(60),
            login_backoff_initial: Duration::from_secs(10),
            login_backoff_max: Duration::from_secs(120),
            deviation: 20,
            magic_a: 234000,
            magic_b: 234001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_table() {
        let p3 = PhaseConfig::for_phase(Phase::Three, dec!(100000));
        assert!(!p3.mirror_b_enabled);
        assert_eq!(p3.stop_loss_pips, None);
        assert_eq!(p3.target_profit, Some(dec!(50)));

        let p4 = PhaseConfig::for_phase(Phase::Four, dec!(100000));
        assert_eq!(p4.mirror_b_lots, dec!(0.40));
        assert_eq!(p4.take_profit_pips, Some(625));
    }

    #[test]
    fn test_unknown_size_falls_back_to_phase_one() {
        let config = PhaseConfig::for_phase(Phase::Two, dec!(50000));
        assert_eq!(config, PhaseConfig::for_phase(Phase::One, dec!(100000)));
    }

    #[test]
    fn test_default_cadences() {
        let config = CopierConfig::default();
        // Phase evaluation every ~10s of 100ms iterations.
        assert_eq!(config.replication_period * config.phase_eval_every as u32, Duration::from_secs(10));
        assert_eq!(config.magic_b, config.magic_a + 1);
    }
}
