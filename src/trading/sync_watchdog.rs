//! Position sync watchdog.
//!
//! Compares the open tickets of both mirrors with the previous cycle. When a
//! ticket disappears on one side (stop, target, manual close) the other side
//! is flattened entirely, since phase accounting is account-wide.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::account::{Account, AccountError};
use crate::models::Position;

use super::session::{CloseReason, Mirror, PendingClose, SharedSession, TenantSession};

/// What one cycle observed and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub closed_on_a: BTreeSet<u64>,
    pub closed_on_b: BTreeSet<u64>,
    /// Tickets closed by this cycle, per mirror
    pub flattened_a: Vec<u64>,
    pub flattened_b: Vec<u64>,
    /// Pending closes that completed this cycle
    pub resolved: usize,
}

/// Keeps both mirrors' open positions in lockstep.
pub struct SyncWatchdog {
    mirror_a: Arc<dyn Account>,
    mirror_b: Arc<dyn Account>,
    session: SharedSession,
}

fn tickets(positions: &[Position]) -> BTreeSet<u64> {
    positions.iter().map(|p| p.ticket).collect()
}

impl SyncWatchdog {
    pub fn new(mirror_a: Arc<dyn Account>, mirror_b: Arc<dyn Account>, session: SharedSession) -> Self {
        Self {
            mirror_a,
            mirror_b,
            session,
        }
    }

    fn account(&self, mirror: Mirror) -> &dyn Account {
        match mirror {
            Mirror::A => self.mirror_a.as_ref(),
            Mirror::B => self.mirror_b.as_ref(),
        }
    }

    /// Run cycles on a fixed period while the session is running.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_ms = period.as_millis() as u64, "Sync watchdog started");
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if !self.session.lock().await.running {
                    break;
                }
                if let Err(e) = self.run_cycle().await {
                    warn!(error = %e, "Sync cycle skipped");
                }
            }
            debug!("Sync watchdog stopped");
        })
    }

    /// One reconciliation pass, holding the session lock throughout.
    ///
    /// A failed snapshot skips the cycle and leaves the stored sets alone.
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let mut session = self.session.lock().await;

        let (positions_a, positions_b) = futures::try_join!(self.mirror_a.positions(), self.mirror_b.positions())
            .context("Failed to snapshot positions")?;
        let current_a = tickets(&positions_a);
        let current_b = tickets(&positions_b);

        // Rollback tickets are never tracked, including ones closed this cycle.
        let mut untracked_a = session.pending_tickets(Mirror::A, CloseReason::Rollback);
        let mut untracked_b = session.pending_tickets(Mirror::B, CloseReason::Rollback);

        let mut report = SyncReport::default();

        report.resolved = self.retry_pending(&mut session, &current_a, &current_b).await;

        report.closed_on_a = session.mirror_a_open.difference(&current_a).copied().collect();
        report.closed_on_b = session.mirror_b_open.difference(&current_b).copied().collect();

        if !report.closed_on_a.is_empty() {
            warn!(tickets = ?report.closed_on_a, "Positions closed on mirror-A, flattening mirror-B");
            report.flattened_b = self.flatten(&mut session, Mirror::B, &current_b).await;
        }
        if !report.closed_on_b.is_empty() {
            warn!(tickets = ?report.closed_on_b, "Positions closed on mirror-B, flattening mirror-A");
            report.flattened_a = self.flatten(&mut session, Mirror::A, &current_a).await;
        }

        // Baseline for the next cycle is the live state at the start of this
        // one. Tickets closed above therefore show up as lost next cycle and
        // flatten the other side in turn.
        untracked_a.extend(session.pending_tickets(Mirror::A, CloseReason::Rollback));
        untracked_b.extend(session.pending_tickets(Mirror::B, CloseReason::Rollback));
        session.mirror_a_open = current_a.difference(&untracked_a).copied().collect();
        session.mirror_b_open = current_b.difference(&untracked_b).copied().collect();

        Ok(report)
    }

    /// Close every ticket in `open` on `mirror`; failures become pending closes.
    async fn flatten(&self, session: &mut TenantSession, mirror: Mirror, open: &BTreeSet<u64>) -> Vec<u64> {
        let account = self.account(mirror);
        let mut closed = Vec::new();

        for &ticket in open {
            match account.close_position(ticket).await {
                Ok(()) | Err(AccountError::PositionNotFound(_)) => {
                    info!(%mirror, ticket, "Position closed to restore pair");
                    closed.push(ticket);
                }
                Err(e) => {
                    error!(%mirror, ticket, error = %e, "Close failed, will retry");
                    session.pending_closes.insert(PendingClose {
                        mirror,
                        ticket,
                        reason: CloseReason::Flatten,
                    });
                }
            }
        }

        closed
    }

    /// Retry closes left over from earlier failures. Returns how many completed.
    async fn retry_pending(
        &self,
        session: &mut TenantSession,
        current_a: &BTreeSet<u64>,
        current_b: &BTreeSet<u64>,
    ) -> usize {
        let pending: Vec<PendingClose> = session.pending_closes.iter().copied().collect();
        let mut resolved = 0;

        for close in pending {
            let still_open = match close.mirror {
                Mirror::A => current_a.contains(&close.ticket),
                Mirror::B => current_b.contains(&close.ticket),
            };

            let done = if !still_open {
                true
            } else {
                match self.account(close.mirror).close_position(close.ticket).await {
                    Ok(()) | Err(AccountError::PositionNotFound(_)) => {
                        info!(mirror = %close.mirror, ticket = close.ticket, reason = ?close.reason, "Pending close completed");
                        true
                    }
                    Err(e) => {
                        warn!(mirror = %close.mirror, ticket = close.ticket, error = %e, "Pending close failed again");
                        false
                    }
                }
            };

            if done {
                session.pending_closes.remove(&close);
                resolved += 1;
            }
        }

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PaperAccount;
    use crate::models::{Direction, Phase};
    use crate::testing::paper_pair;
    use crate::trading::{PhaseConfig, TenantSession};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<PaperAccount>, Arc<PaperAccount>, SharedSession, SyncWatchdog) {
        let (a, b) = paper_pair();
        let session = TenantSession::new("u1", PhaseConfig::for_phase(Phase::One, dec!(100000)), Utc::now()).shared();
        let watchdog = SyncWatchdog::new(a.clone(), b.clone(), session.clone());
        (a, b, session, watchdog)
    }

    #[tokio::test]
    async fn test_spawned_watchdog_stops_with_session() {
        let (a, _b, session, watchdog) = setup();
        let ticket = a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();

        let handle = Arc::new(watchdog).spawn(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.lock().await.mirror_a_open, BTreeSet::from([ticket]));

        session.lock().await.running = false;
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lost_leg_flattens_other_side_then_cascades() {
        let (a, b, session, watchdog) = setup();
        let a1 = a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        let a2 = a.open_position("GBPUSD", Direction::Buy, dec!(2)).unwrap();
        b.open_position("EURUSD", Direction::Sell, dec!(0.14)).unwrap();
        b.open_position("GBPUSD", Direction::Sell, dec!(0.14)).unwrap();

        // First cycle only records the baseline.
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(session.lock().await.mirror_a_open, BTreeSet::from([a1, a2]));

        // Stop-out on mirror-A.
        assert!(a.remove_position(a1));
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.closed_on_a, BTreeSet::from([a1]));
        assert_eq!(report.flattened_b.len(), 2);
        assert!(b.open_tickets().is_empty());
        assert_eq!(a.open_tickets(), vec![a2]);

        // Mirror-B's closures flatten what is left on mirror-A.
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.closed_on_b.len(), 2);
        assert_eq!(report.flattened_a, vec![a2]);
        assert!(a.open_tickets().is_empty());

        // The last mirror-A ticket is seen as gone; mirror-B is already flat.
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.closed_on_a, BTreeSet::from([a2]));
        assert!(report.flattened_b.is_empty());

        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn test_no_changes_no_closes() {
        let (a, b, _session, watchdog) = setup();
        a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        b.open_position("EURUSD", Direction::Sell, dec!(0.14)).unwrap();

        watchdog.run_cycle().await.unwrap();
        let report = watchdog.run_cycle().await.unwrap();

        assert_eq!(report, SyncReport::default());
        assert!(a.closed_tickets().is_empty());
        assert!(b.closed_tickets().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_ticket_is_not_a_lost_leg() {
        let (a, b, session, watchdog) = setup();
        b.open_position("EURUSD", Direction::Sell, dec!(0.14)).unwrap();
        let orphan = a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        session.lock().await.pending_closes.insert(PendingClose {
            mirror: Mirror::A,
            ticket: orphan,
            reason: CloseReason::Rollback,
        });
        a.fail_next_closes(1);

        // Close still failing: orphan stays pending and untracked.
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.resolved, 0);
        assert!(session.lock().await.mirror_a_open.is_empty());

        // Close succeeds: no lost leg, mirror-B untouched.
        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.resolved, 1);
        let report = watchdog.run_cycle().await.unwrap();
        assert!(report.closed_on_a.is_empty());
        assert_eq!(b.open_tickets().len(), 1);
        assert!(session.lock().await.pending_closes.is_empty());
    }

    #[tokio::test]
    async fn test_failed_flatten_is_retried() {
        let (a, b, session, watchdog) = setup();
        let a1 = a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        let b1 = b.open_position("EURUSD", Direction::Sell, dec!(0.14)).unwrap();
        watchdog.run_cycle().await.unwrap();

        a.remove_position(a1);
        b.fail_next_closes(1);
        let report = watchdog.run_cycle().await.unwrap();
        assert!(report.flattened_b.is_empty());
        assert_eq!(session.lock().await.pending_tickets(Mirror::B, CloseReason::Flatten), BTreeSet::from([b1]));

        let report = watchdog.run_cycle().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert!(b.open_tickets().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_previous_sets() {
        let (a, b, session, watchdog) = setup();
        let a1 = a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        b.open_position("EURUSD", Direction::Sell, dec!(0.14)).unwrap();
        watchdog.run_cycle().await.unwrap();

        a.set_offline(true);
        assert!(watchdog.run_cycle().await.is_err());
        assert_eq!(session.lock().await.mirror_a_open, BTreeSet::from([a1]));
        assert!(b.closed_tickets().is_empty());
    }
}
