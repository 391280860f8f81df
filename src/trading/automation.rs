//! Watches the terminals' algorithmic-trading permission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::api::{Audience, Notifier};

use super::session::{Mirror, SharedSession};

/// Outcome of one automation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationStatus {
    /// Both terminals permit automated trading
    Healthy,
    /// Was blocked, permitted again after this cycle
    Recovered,
    /// Still blocked on the listed mirrors
    Blocked(Vec<Mirror>),
}

/// Re-enables automated trading when a terminal turns it off, and pauses
/// replication while it stays off.
pub struct AutomationWatchdog {
    mirror_a: Arc<dyn Account>,
    mirror_b: Arc<dyn Account>,
    session: SharedSession,
    notifier: Arc<dyn Notifier>,
    attempts: u32,
    /// Operator already told about the current blocked episode
    notified: AtomicBool,
}

impl AutomationWatchdog {
    pub fn new(
        mirror_a: Arc<dyn Account>,
        mirror_b: Arc<dyn Account>,
        session: SharedSession,
        notifier: Arc<dyn Notifier>,
        attempts: u32,
    ) -> Self {
        Self {
            mirror_a,
            mirror_b,
            session,
            notifier,
            attempts: attempts.max(1),
            notified: AtomicBool::new(false),
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
            info!(period_s = period.as_secs(), "Automation watchdog started");
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if !self.session.lock().await.running {
                    break;
                }
                if let Err(e) = self.run_cycle().await {
                    warn!(error = %e, "Automation check skipped");
                }
            }
            debug!("Automation watchdog stopped");
        })
    }

    /// Check both terminals, remediate blocked ones and update the session flag.
    ///
    /// A terminal that cannot be queried skips the cycle without touching the flag.
    pub async fn run_cycle(&self) -> Result<AutomationStatus> {
        let (enabled_a, enabled_b) = futures::try_join!(
            self.mirror_a.is_automation_enabled(),
            self.mirror_b.is_automation_enabled()
        )
        .context("Failed to query automation state")?;

        let mut blocked: Vec<Mirror> = [(Mirror::A, enabled_a), (Mirror::B, enabled_b)]
            .into_iter()
            .filter(|(_, enabled)| !enabled)
            .map(|(mirror, _)| mirror)
            .collect();

        let was_healthy = self.session.lock().await.automation_healthy;
        if blocked.is_empty() {
            if !was_healthy {
                self.set_healthy(true).await;
                info!("Automated trading permitted on both mirrors, resuming");
                self.notified.store(false, Ordering::SeqCst);
                return Ok(AutomationStatus::Recovered);
            }
            return Ok(AutomationStatus::Healthy);
        }

        if was_healthy {
            warn!(mirrors = ?blocked, "Automated trading disabled, pausing replication");
            self.set_healthy(false).await;
        }

        let mut still_blocked = Vec::new();
        for mirror in blocked.drain(..) {
            if !self.remediate(mirror).await {
                still_blocked.push(mirror);
            }
        }

        if still_blocked.is_empty() {
            self.set_healthy(true).await;
            info!("Automated trading re-enabled");
            self.notified.store(false, Ordering::SeqCst);
            return Ok(AutomationStatus::Recovered);
        }

        if !self.notified.swap(true, Ordering::SeqCst) {
            let names: Vec<String> = still_blocked.iter().map(|m| m.to_string()).collect();
            let user_id = self.session.lock().await.user_id.clone();
            let body = format!(
                "Automated trading is disabled on {} for user {} and could not be re-enabled after {} attempts. Replication is paused.",
                names.join(", "),
                user_id,
                self.attempts
            );
            self.notifier
                .notify(Audience::Operator, "Automated trading disabled", &body)
                .await;
        }

        Ok(AutomationStatus::Blocked(still_blocked))
    }

    async fn set_healthy(&self, healthy: bool) {
        self.session.lock().await.automation_healthy = healthy;
    }

    /// Try to turn automation back on, up to the configured number of attempts.
    async fn remediate(&self, mirror: Mirror) -> bool {
        let account = self.account(mirror);
        for attempt in 1..=self.attempts {
            match account.try_enable_automation().await {
                Ok(true) => {
                    info!(%mirror, attempt, "Automated trading re-enabled");
                    return true;
                }
                Ok(false) => debug!(%mirror, attempt, "Automated trading still disabled"),
                Err(e) => warn!(%mirror, attempt, error = %e, "Enable attempt failed"),
            }
        }
        error!(%mirror, attempts = self.attempts, "Could not re-enable automated trading");
        false
    }
}
