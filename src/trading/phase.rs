//! Phase state machine: baseline capture, pass/fail evaluation and conclusion.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::account::{close_all, Account};
use crate::api::{Audience, Notifier};
use crate::models::{AccountInfo, Phase};

use super::session::{CloseReason, Mirror, PendingClose, SharedSession, TenantSession};
use super::PhaseConfig;

/// Result of evaluating a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseVerdict {
    Continue,
    Passed { reason: String },
    Failed { reason: String },
}

impl PhaseVerdict {
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, PhaseVerdict::Continue)
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            PhaseVerdict::Continue => "continue",
            PhaseVerdict::Passed { .. } => "passed",
            PhaseVerdict::Failed { .. } => "failed",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PhaseVerdict::Continue => "",
            PhaseVerdict::Passed { reason } | PhaseVerdict::Failed { reason } => reason,
        }
    }
}

/// Snapshot a conclusion is reported with.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseConclusion {
    pub phase: Phase,
    pub verdict: PhaseVerdict,
    pub balance_a: Decimal,
    pub equity_a: Decimal,
    pub equity_b: Decimal,
    /// Every position on both mirrors closed
    pub flattened: bool,
}

/// Evaluates phase thresholds and concludes phases.
///
/// Thresholds for phases 1, 2 and 4 are relative to a fixed nominal balance;
/// phase 3 is realized profit: mirror-A's balance against the balance
/// captured on entry. Floating profit never passes phase 3.
pub struct PhaseStateMachine {
    mirror_a: Arc<dyn Account>,
    mirror_b: Arc<dyn Account>,
    notifier: Arc<dyn Notifier>,
    nominal: Decimal,
}

impl PhaseStateMachine {
    pub fn new(
        mirror_a: Arc<dyn Account>,
        mirror_b: Arc<dyn Account>,
        notifier: Arc<dyn Notifier>,
        nominal: Decimal,
    ) -> Self {
        Self {
            mirror_a,
            mirror_b,
            notifier,
            nominal,
        }
    }

    /// Capture the phase baseline if the session has none yet.
    ///
    /// Phase 3 uses mirror-A's balance, every other phase its equity.
    /// Returns whether a baseline was set.
    pub fn enter(session: &mut TenantSession, info_a: &AccountInfo) -> bool {
        if session.phase_baseline_equity.is_some() {
            return false;
        }
        let baseline = match session.phase_config.phase {
            Phase::Three => info_a.balance,
            _ => info_a.equity,
        };
        session.phase_baseline_equity = Some(baseline);
        info!(phase = %session.phase_config.phase, baseline = %baseline, "Phase baseline captured");
        true
    }

    /// Pure threshold check.
    pub fn evaluate(
        &self,
        phase: &PhaseConfig,
        baseline: Option<Decimal>,
        balance_a: Decimal,
        equity_a: Decimal,
        equity_b: Decimal,
    ) -> PhaseVerdict {
        let nominal = self.nominal;
        let pct = |p: Decimal| nominal * p;

        match phase.phase {
            Phase::One => {
                if equity_a >= pct(dec!(1.10)) {
                    PhaseVerdict::Passed { reason: format!("equity {} reached +10%", equity_a) }
                } else if equity_a <= pct(dec!(0.90)) {
                    PhaseVerdict::Failed { reason: format!("equity {} fell to -10%", equity_a) }
                } else {
                    PhaseVerdict::Continue
                }
            }
            Phase::Two => {
                if equity_a >= pct(dec!(1.05)) {
                    PhaseVerdict::Passed { reason: format!("equity {} reached +5%", equity_a) }
                } else if equity_a <= pct(dec!(0.90)) {
                    PhaseVerdict::Failed { reason: format!("equity {} fell to -10%", equity_a) }
                } else {
                    PhaseVerdict::Continue
                }
            }
            Phase::Three => {
                let (Some(baseline), Some(target)) = (baseline, phase.target_profit) else {
                    return PhaseVerdict::Continue;
                };
                let profit = balance_a - baseline;
                if profit >= target {
                    PhaseVerdict::Passed { reason: format!("profit {} reached target {}", profit, target) }
                } else {
                    PhaseVerdict::Continue
                }
            }
            Phase::Four => {
                if equity_b <= Decimal::ZERO {
                    PhaseVerdict::Failed { reason: format!("mirror-B equity {} is exhausted", equity_b) }
                } else if equity_a <= pct(dec!(0.90)) {
                    PhaseVerdict::Failed { reason: format!("equity {} fell to -10%", equity_a) }
                } else if equity_a >= pct(dec!(1.05)) {
                    PhaseVerdict::Passed { reason: format!("equity {} reached +5%", equity_a) }
                } else {
                    PhaseVerdict::Continue
                }
            }
        }
    }

    /// Read both accounts and evaluate the session's phase.
    ///
    /// Captures the baseline first if the phase was just entered.
    pub async fn check(&self, session: &SharedSession) -> Result<(PhaseVerdict, AccountInfo, AccountInfo)> {
        let (info_a, info_b) = futures::try_join!(self.mirror_a.account_info(), self.mirror_b.account_info())
            .context("Failed to read account info for phase evaluation")?;

        let mut session = session.lock().await;
        if Self::enter(&mut session, &info_a) {
            return Ok((PhaseVerdict::Continue, info_a, info_b));
        }

        let verdict = self.evaluate(
            &session.phase_config,
            session.phase_baseline_equity,
            info_a.balance,
            info_a.equity,
            info_b.equity,
        );
        debug!(
            phase = %session.phase_config.phase,
            balance_a = %info_a.balance,
            equity_a = %info_a.equity,
            equity_b = %info_b.equity,
            verdict = verdict.outcome(),
            "Phase evaluated"
        );

        Ok((verdict, info_a, info_b))
    }

    /// Flatten both mirrors, halt the session and notify the tenant once.
    pub async fn conclude(
        &self,
        session: &SharedSession,
        verdict: PhaseVerdict,
        info_a: &AccountInfo,
        info_b: &AccountInfo,
    ) -> PhaseConclusion {
        let mut session = session.lock().await;
        let phase = session.phase_config.phase;

        warn!(
            %phase,
            outcome = verdict.outcome(),
            reason = verdict.reason(),
            balance = %info_a.balance,
            equity = %info_a.equity,
            "Phase concluded, flattening both mirrors"
        );

        let mut flattened = true;
        for (mirror, account) in [(Mirror::A, self.mirror_a.as_ref()), (Mirror::B, self.mirror_b.as_ref())] {
            match close_all(account).await {
                Ok(report) => {
                    for (ticket, _) in &report.failed {
                        session.pending_closes.insert(PendingClose {
                            mirror,
                            ticket: *ticket,
                            reason: CloseReason::Flatten,
                        });
                    }
                    flattened &= report.is_clean();
                }
                Err(e) => {
                    warn!(%mirror, error = %e, "Could not list positions to flatten");
                    flattened = false;
                }
            }
        }

        session.clear_open_sets();
        session.phase_baseline_equity = None;
        session.running = false;
        let user_id = session.user_id.clone();
        drop(session);

        let subject = format!("Phase {} {}", phase.number(), verdict.outcome());
        let next_step = match (&verdict, phase.next()) {
            (PhaseVerdict::Passed { .. }, Some(next)) => format!("Next up: phase {}.", next.number()),
            (PhaseVerdict::Passed { .. }, None) => "All phases completed.".to_string(),
            _ => "Trading has been stopped.".to_string(),
        };
        let body = format!(
            "Phase {} {}: {}.\nBalance: {}\nEquity: {}\n{}",
            phase.number(),
            verdict.outcome(),
            verdict.reason(),
            info_a.balance.round_dp(2),
            info_a.equity.round_dp(2),
            next_step,
        );
        self.notifier.notify(Audience::Tenant(user_id), &subject, &body).await;

        PhaseConclusion {
            phase,
            verdict,
            balance_a: info_a.balance,
            equity_a: info_a.equity,
            equity_b: info_b.equity,
            flattened,
        }
    }
}
