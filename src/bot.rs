//! Copier runner: tenant lifecycle around the copy engine.
//!
//! Handles:
//! - Waiting for a tenant assignment and for trading to be enabled
//! - Logging both mirrors in, with back-off on failure
//! - Running the replication loop next to the sync and automation watchdogs
//! - Phase evaluation, halting and persisting state for restarts
//!
//! A concluded phase stays halted locally until the directory has recorded
//! the halt, so a lost write can never put the tenant back into trading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::account::{close_all, Account};
use crate::api::{Audience, Notifier, SignalLog, TenantDirectory};
use crate::db::Database;
use crate::models::{Signal, Tenant, TenantProfile, TradingStatus};
use crate::retry::{with_retry, RetryPolicy};
use crate::trading::{
    AutomationWatchdog, CopierConfig, EngineSettings, PhaseConclusion, PhaseConfig, PhaseStateMachine,
    PhaseVerdict, ReplicationEngine, ReplicationResult, SharedSession, SyncWatchdog, TenantSession,
};

/// How a trading session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// Trading was switched off in the directory
    Disabled,
    /// The phase passed or failed
    Concluded(PhaseConclusion),
    /// Ctrl+C or an external stop
    Shutdown,
}

/// External collaborators of the copier.
#[derive(Clone)]
pub struct CopierDeps {
    pub mirror_a: Arc<dyn Account>,
    pub mirror_b: Arc<dyn Account>,
    pub signal_log: Arc<dyn SignalLog>,
    pub directory: Arc<dyn TenantDirectory>,
    pub notifier: Arc<dyn Notifier>,
}

/// Everything the replication loop works with during one session.
struct SessionContext<'a> {
    tenant: &'a Tenant,
    phase_config: PhaseConfig,
    session: SharedSession,
    engine: ReplicationEngine,
    phase: PhaseStateMachine,
}

/// Delays between failed login rounds: doubling from the initial delay up to the cap.
fn login_backoff(config: &CopierConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.login_backoff_initial)
        .with_max_interval(config.login_backoff_max)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}

/// Main copier runner.
pub struct Copier {
    config: CopierConfig,
    db: Database,
    deps: CopierDeps,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,

    // A concluded phase whose halt has not reached the directory yet
    halt_pending: AtomicBool,
}

impl Copier {
    pub fn new(config: CopierConfig, db: Database, deps: CopierDeps) -> Self {
        Self {
            config,
            db,
            deps,
            shutdown: Arc::new(AtomicBool::new(false)),
            halt_pending: AtomicBool::new(false),
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown is requested first.
    /// Returns false on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        let step = Duration::from_millis(250);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_shutdown() {
                return false;
            }
            let nap = remaining.min(step);
            sleep(nap).await;
            remaining -= nap;
        }
        !self.is_shutdown()
    }

    /// Run until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        info!("Starting copier");

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let Some(tenant) = self.wait_for_tenant().await else {
            info!("Stopped before a tenant was assigned");
            return Ok(());
        };
        info!(user_id = %tenant.user_id, "Serving tenant");

        let mut backoff = login_backoff(&self.config);
        let mut failed_logins: u32 = 0;

        while !self.is_shutdown() {
            if !self.settle_halt(&tenant).await {
                break;
            }
            if !self.wait_until_enabled(&tenant).await {
                break;
            }

            let profile = match self.deps.directory.load_profile(&tenant).await {
                Ok(profile) => profile,
                Err(e) => {
                    error!(error = %e, "Failed to load profile");
                    self.pause(self.config.start_poll).await;
                    continue;
                }
            };

            if let Err(e) = self.login(&profile).await {
                failed_logins += 1;
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(self.config.login_backoff_max);
                error!(error = %e, attempt = failed_logins, retry_in_s = delay.as_secs(), "Login failed");
                if failed_logins == self.config.login_alert_after {
                    self.alert_login_failure(&tenant, failed_logins, &e).await;
                }
                self.pause(delay).await;
                continue;
            }
            failed_logins = 0;

            let end = self.run_session(&tenant, &profile).await;
            self.teardown().await;

            match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(end) => {
                    info!(?end, "Session ended");
                    backoff.reset();
                }
                Err(e) => error!(error = %e, "Session aborted"),
            }
        }

        info!("Copier shutdown complete");
        Ok(())
    }

    /// Poll the directory until this deployment has a tenant. `None` on shutdown.
    async fn wait_for_tenant(&self) -> Option<Tenant> {
        loop {
            if self.is_shutdown() {
                return None;
            }
            match self.deps.directory.resolve_tenant().await {
                Ok(Some(tenant)) => return Some(tenant),
                Ok(None) => info!(
                    retry_in_s = self.config.assignment_poll.as_secs(),
                    "No tenant assigned to this deployment"
                ),
                Err(e) => warn!(error = %e, "Tenant lookup failed"),
            }
            if !self.pause(self.config.assignment_poll).await {
                return None;
            }
        }
    }

    /// Block until no halt is waiting to be written to the directory.
    /// Returns false on shutdown.
    async fn settle_halt(&self, tenant: &Tenant) -> bool {
        loop {
            if self.is_shutdown() {
                return false;
            }
            let halted = match self.db.is_halted(&tenant.user_id).await {
                Ok(halted) => halted || self.halt_pending.load(Ordering::SeqCst),
                Err(e) => {
                    warn!(error = %e, "Could not read halt state");
                    true
                }
            };
            if !halted || self.persist_halt(tenant).await {
                return true;
            }
            if !self.pause(self.config.start_poll).await {
                return false;
            }
        }
    }

    /// Write the halt to the directory and clear the local marker once it lands.
    async fn persist_halt(&self, tenant: &Tenant) -> bool {
        let policy = RetryPolicy::new(self.config.halt_attempts, self.config.retry_base_delay);
        let directory = &self.deps.directory;
        let result = with_retry(policy, "disable trading", |_| true, || async move {
            directory.set_trading_enabled(tenant, false).await
        })
        .await;

        match result {
            Ok(()) => {
                self.halt_pending.store(false, Ordering::SeqCst);
                if let Err(e) = self.db.set_halted(&tenant.user_id, false).await {
                    warn!(error = %e, "Failed to clear local halt");
                }
                info!(user_id = %tenant.user_id, "Halt recorded in the directory");
                true
            }
            Err(e) => {
                error!(user_id = %tenant.user_id, error = %e, "Failed to disable trading in the directory, halt kept locally");
                false
            }
        }
    }

    async fn alert_login_failure(&self, tenant: &Tenant, attempts: u32, err: &anyhow::Error) {
        let body = format!(
            "Tenant {}: {} consecutive login failures.\nLast error: {:#}",
            tenant.user_id, attempts, err
        );
        self.deps
            .notifier
            .notify(Audience::Operator, "Mirror login failing", &body)
            .await;
    }

    /// Poll until trading is enabled. An unknown status keeps waiting.
    /// Returns false on shutdown.
    async fn wait_until_enabled(&self, tenant: &Tenant) -> bool {
        let mut announced = false;
        loop {
            if self.is_shutdown() {
                return false;
            }
            match self.deps.directory.is_trading_enabled(tenant).await {
                TradingStatus::Enabled => return true,
                TradingStatus::Disabled if !announced => {
                    info!(user_id = %tenant.user_id, "Waiting for trading to be enabled");
                    announced = true;
                }
                TradingStatus::Disabled => {}
                TradingStatus::Unknown => debug!("Trading status unknown, waiting"),
            }
            if !self.pause(self.config.start_poll).await {
                return false;
            }
        }
    }

    /// Log mirror-A in, then mirror-B. Any failure tears both mirrors down.
    async fn login(&self, profile: &TenantProfile) -> Result<()> {
        let result = self.login_pair(profile).await;
        if result.is_err() {
            self.teardown().await;
        }
        result
    }

    async fn login_pair(&self, profile: &TenantProfile) -> Result<()> {
        let info_a = self
            .deps
            .mirror_a
            .login(&profile.mirror_a)
            .await
            .context("mirror-A login failed")?;
        info!(login = info_a.login, balance = %info_a.balance, "mirror-A logged in");

        let info_b = self
            .deps
            .mirror_b
            .login(&profile.mirror_b)
            .await
            .context("mirror-B login failed")?;
        info!(login = info_b.login, balance = %info_b.balance, "mirror-B logged in");
        Ok(())
    }

    /// Flatten both mirrors and close the terminal sessions.
    async fn teardown(&self) {
        for account in [&self.deps.mirror_a, &self.deps.mirror_b] {
            match close_all(account.as_ref()).await {
                Ok(report) if report.is_clean() => {
                    if !report.closed.is_empty() {
                        info!(account = account.name(), closed = report.closed.len(), "Flattened on teardown");
                    }
                }
                Ok(report) => error!(
                    account = account.name(),
                    failed = ?report.failed.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
                    "Positions left open on teardown"
                ),
                Err(e) => error!(account = account.name(), error = %e, "Could not flatten on teardown"),
            }
            account.shutdown().await;
        }
    }

    /// Run one trading session for a logged-in tenant until it ends.
    pub async fn run_session(&self, tenant: &Tenant, profile: &TenantProfile) -> Result<SessionEnd> {
        let stored = self
            .db
            .start_session(&tenant.user_id, profile.phase.number())
            .await?;

        let phase_config = PhaseConfig::for_phase(profile.phase, profile.account_size);
        let floor = Utc::now()
            - chrono::Duration::from_std(self.config.max_signal_age).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cursor = stored.last_signal_cursor.map_or(floor, |c| c.max(floor));

        let mut session = TenantSession::new(&tenant.user_id, phase_config.clone(), cursor);
        session.phase_baseline_equity = stored.baseline();
        let session = session.shared();

        info!(
            user_id = %tenant.user_id,
            phase = %profile.phase,
            cursor = %cursor,
            "Session started"
        );

        let deps = &self.deps;
        let ctx = SessionContext {
            tenant,
            phase_config,
            session: session.clone(),
            engine: ReplicationEngine::new(
                deps.mirror_a.clone(),
                deps.mirror_b.clone(),
                deps.notifier.clone(),
                EngineSettings::from_config(&self.config, profile.seed),
            ),
            phase: PhaseStateMachine::new(
                deps.mirror_a.clone(),
                deps.mirror_b.clone(),
                deps.notifier.clone(),
                self.config.nominal_balance,
            ),
        };

        let tasks: Vec<JoinHandle<()>> = vec![
            Arc::new(SyncWatchdog::new(deps.mirror_a.clone(), deps.mirror_b.clone(), session.clone()))
                .spawn(self.config.sync_period),
            Arc::new(AutomationWatchdog::new(
                deps.mirror_a.clone(),
                deps.mirror_b.clone(),
                session.clone(),
                deps.notifier.clone(),
                self.config.remediation_attempts,
            ))
            .spawn(self.config.automation_period),
        ];

        let end = self.replication_loop(&ctx, stored.baseline()).await;

        session.lock().await.running = false;
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        if let Err(e) = self.db.set_running(&tenant.user_id, false).await {
            warn!(error = %e, "Failed to persist session stop");
        }

        end
    }

    async fn replication_loop(&self, ctx: &SessionContext<'_>, mut persisted_baseline: Option<Decimal>) -> Result<SessionEnd> {
        let mut ticker = interval(self.config.replication_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut iteration: u64 = 0;
        let mut deferrals: HashMap<(DateTime<Utc>, u64), u32> = HashMap::new();

        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                return Ok(SessionEnd::Shutdown);
            }

            if iteration % self.config.enabled_check_every.max(1) == 0 {
                match self.deps.directory.is_trading_enabled(ctx.tenant).await {
                    TradingStatus::Disabled => {
                        info!(user_id = %ctx.tenant.user_id, "Trading disabled, ending session");
                        return Ok(SessionEnd::Disabled);
                    }
                    TradingStatus::Unknown => debug!("Trading status unknown, continuing"),
                    TradingStatus::Enabled => {}
                }
            }

            if iteration % self.config.phase_eval_every.max(1) == 0 {
                if let Some(conclusion) = self.evaluate_phase(ctx, &mut persisted_baseline).await {
                    return Ok(SessionEnd::Concluded(conclusion));
                }
            }
            iteration += 1;

            let (healthy, cursor) = {
                let session = ctx.session.lock().await;
                (session.automation_healthy, session.last_signal_cursor)
            };
            if !healthy {
                continue;
            }

            let signals = match self.deps.signal_log.fetch_since(cursor).await {
                Ok(signals) => signals,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch signals");
                    continue;
                }
            };

            for signal in signals {
                if self.is_shutdown() {
                    break;
                }
                if !self.process_signal(ctx, &signal, &mut deferrals).await {
                    break;
                }
            }
        }
    }

    /// Replicate one signal and move the cursor past it if allowed.
    ///
    /// Returns false when the signal was deferred; later signals wait for it.
    async fn process_signal(
        &self,
        ctx: &SessionContext<'_>,
        signal: &Signal,
        deferrals: &mut HashMap<(DateTime<Utc>, u64), u32>,
    ) -> bool {
        info!(
            ticket = signal.ticket,
            symbol = %signal.symbol,
            direction = %signal.direction,
            "Processing signal"
        );

        let result = ctx.engine.replicate(signal, &ctx.phase_config, &ctx.session).await;
        let key = (signal.timestamp, signal.ticket);

        match &result {
            ReplicationResult::Replicated { mirror_a, mirror_b } => {
                info!(ticket = signal.ticket, mirror_a, mirror_b = ?mirror_b, "Signal replicated")
            }
            ReplicationResult::Deferred { error } => {
                let attempts = deferrals.entry(key).or_insert(0);
                *attempts += 1;
                if *attempts < self.config.deferred_attempts {
                    warn!(ticket = signal.ticket, attempt = *attempts, error = %error, "Signal deferred");
                    return false;
                }
                error!(ticket = signal.ticket, attempts = *attempts, error = %error, "Giving up on deferred signal");
            }
            other => warn!(ticket = signal.ticket, status = other.status(), error = ?other.error(), "Signal not replicated"),
        }
        deferrals.remove(&key);

        let (ticket_a, ticket_b) = match &result {
            ReplicationResult::RolledBack { mirror_a, .. } => (Some(*mirror_a), None),
            other => other.tickets(),
        };
        if let Err(e) = self
            .db
            .record_replication(&ctx.tenant.user_id, signal, result.status(), ticket_a, ticket_b, result.error())
            .await
        {
            warn!(error = %e, "Failed to record replication");
        }

        ctx.session.lock().await.advance_cursor(signal.timestamp);
        if let Err(e) = self.db.save_cursor(&ctx.tenant.user_id, signal.timestamp).await {
            warn!(error = %e, "Failed to persist cursor");
        }
        true
    }

    /// Evaluate the phase; on pass or fail conclude it and halt trading.
    async fn evaluate_phase(&self, ctx: &SessionContext<'_>, persisted_baseline: &mut Option<Decimal>) -> Option<PhaseConclusion> {
        let (verdict, info_a, info_b) = match ctx.phase.check(&ctx.session).await {
            Ok(checked) => checked,
            Err(e) => {
                warn!(error = %e, "Phase evaluation skipped");
                return None;
            }
        };

        let baseline = ctx.session.lock().await.phase_baseline_equity;
        if baseline != *persisted_baseline {
            match self.db.save_baseline(&ctx.tenant.user_id, baseline).await {
                Ok(()) => *persisted_baseline = baseline,
                Err(e) => warn!(error = %e, "Failed to persist phase baseline"),
            }
        }

        if !verdict.is_conclusive() {
            return None;
        }

        let conclusion = ctx.phase.conclude(&ctx.session, verdict, &info_a, &info_b).await;
        let user_id = &ctx.tenant.user_id;
        match &conclusion.verdict {
            PhaseVerdict::Passed { reason } => info!(%user_id, phase = %conclusion.phase, %reason, "Phase passed"),
            PhaseVerdict::Failed { reason } => warn!(%user_id, phase = %conclusion.phase, %reason, "Phase failed"),
            PhaseVerdict::Continue => {}
        }
        if !conclusion.flattened {
            error!(%user_id, "Positions left open after phase conclusion, retrying in teardown");
        }

        if let Err(e) = self
            .db
            .record_phase_event(
                user_id,
                conclusion.phase.number(),
                conclusion.verdict.outcome(),
                conclusion.verdict.reason(),
                conclusion.equity_a,
                conclusion.equity_b,
            )
            .await
        {
            warn!(error = %e, "Failed to record phase event");
        }
        if let Err(e) = self.db.save_baseline(user_id, None).await {
            warn!(error = %e, "Failed to clear phase baseline");
        }

        self.halt_pending.store(true, Ordering::SeqCst);
        if let Err(e) = self.db.set_halted(user_id, true).await {
            error!(error = %e, "Failed to persist local halt");
        }
        self.persist_halt(ctx.tenant).await;

        Some(conclusion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PaperAccount;
    use crate::models::{Direction, Phase};
    use crate::testing::{paper_pair, test_profile, MemoryDirectory, MemorySignalLog, RecordingNotifier};
    use chrono::SubsecRound;
    use rust_decimal_macros::dec;

    struct Harness {
        a: Arc<PaperAccount>,
        b: Arc<PaperAccount>,
        log: Arc<MemorySignalLog>,
        directory: Arc<MemoryDirectory>,
        notifier: Arc<RecordingNotifier>,
        copier: Copier,
    }

    fn fast_config() -> CopierConfig {
        CopierConfig {
            replication_period: Duration::from_millis(10),
            sync_period: Duration::from_millis(20),
            automation_period: Duration::from_millis(50),
            phase_eval_every: 3,
            enabled_check_every: 2,
            start_poll: Duration::from_millis(10),
            assignment_poll: Duration::from_millis(10),
            max_stagger: Duration::ZERO,
            retry_base_delay: Duration::from_millis(1),
            login_backoff_initial: Duration::from_millis(10),
            login_backoff_max: Duration::from_millis(40),
            ..CopierConfig::default()
        }
    }

    async fn harness(phase: Phase) -> Harness {
        let (a, b) = paper_pair();
        let log = Arc::new(MemorySignalLog::default());
        let directory = Arc::new(MemoryDirectory::new(test_profile(phase), TradingStatus::Enabled));
        let notifier = Arc::new(RecordingNotifier::default());
        let db = Database::new("sqlite::memory:").await.unwrap();

        let deps = CopierDeps {
            mirror_a: a.clone(),
            mirror_b: b.clone(),
            signal_log: log.clone(),
            directory: directory.clone(),
            notifier: notifier.clone(),
        };
        let copier = Copier::new(fast_config(), db, deps);
        Harness { a, b, log, directory, notifier, copier }
    }

    #[tokio::test]
    async fn test_session_replicates_and_stops_when_disabled() {
        let h = harness(Phase::One).await;
        let tenant = h.directory.tenant();
        let profile = test_profile(Phase::One);
        let ts = Utc::now().trunc_subsecs(6);
        h.log.push(Signal::new(ts, 11, "EURUSD", Direction::Buy));

        let driver = async {
            sleep(Duration::from_millis(300)).await;
            h.directory.set_status(TradingStatus::Disabled);
        };
        let (end, ()) = tokio::join!(h.copier.run_session(&tenant, &profile), driver);

        assert_eq!(end.unwrap(), SessionEnd::Disabled);
        assert_eq!(h.a.open_tickets().len(), 1);
        assert_eq!(h.b.open_tickets().len(), 1);
        assert_eq!(h.b.placed_orders()[0].direction, Direction::Sell);

        let stored = h.copier.db.load_session("u1").await.unwrap().unwrap();
        assert_eq!(stored.last_signal_cursor, Some(ts));
        assert!(!stored.running);
        assert_eq!(stored.baseline(), Some(dec!(100000)));

        let stats = h.copier.db.replication_stats().await.unwrap();
        assert_eq!(stats, vec![("replicated".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_stale_signals_are_not_replayed() {
        let h = harness(Phase::One).await;
        let tenant = h.directory.tenant();
        let profile = test_profile(Phase::One);
        h.log.push(Signal::new(Utc::now() - chrono::Duration::minutes(5), 3, "EURUSD", Direction::Buy));

        let driver = async {
            sleep(Duration::from_millis(150)).await;
            h.directory.set_status(TradingStatus::Disabled);
        };
        let (end, ()) = tokio::join!(h.copier.run_session(&tenant, &profile), driver);

        assert_eq!(end.unwrap(), SessionEnd::Disabled);
        assert!(h.a.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_phase_pass_halts_session() {
        let h = harness(Phase::One).await;
        let tenant = h.directory.tenant();
        let profile = test_profile(Phase::One);
        h.log.push(Signal::new(Utc::now(), 11, "EURUSD", Direction::Buy));

        let driver = async {
            sleep(Duration::from_millis(100)).await;
            h.a.set_equity(dec!(110000));
        };
        let (end, ()) = tokio::join!(h.copier.run_session(&tenant, &profile), driver);

        let SessionEnd::Concluded(conclusion) = end.unwrap() else {
            panic!("expected a phase conclusion");
        };
        assert!(matches!(conclusion.verdict, PhaseVerdict::Passed { .. }));
        assert!(h.a.open_tickets().is_empty());
        assert!(h.b.open_tickets().is_empty());
        assert_eq!(h.directory.updates(), vec![false]);

        let messages = h.notifier.messages();
        let tenant_messages: Vec<_> = messages.iter().filter(|m| m.0 == Audience::Tenant("u1".into())).collect();
        assert_eq!(tenant_messages.len(), 1);

        let events = h.copier.db.recent_phase_events(5).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, "passed");
        let stored = h.copier.db.load_session("u1").await.unwrap().unwrap();
        assert!(!stored.running);
        assert!(!stored.halted);
        assert_eq!(stored.baseline(), None);
    }

    #[tokio::test]
    async fn test_halt_is_kept_until_directory_records_it() {
        let h = harness(Phase::One).await;
        h.a.set_equity(dec!(110000));
        h.directory.set_fail_updates(true);
        let shutdown = h.copier.shutdown_signal();

        let driver = async {
            sleep(Duration::from_millis(300)).await;
            let events = h.copier.db.recent_phase_events(10).await.unwrap();
            assert_eq!(events.len(), 1);
            assert!(h.copier.db.is_halted("u1").await.unwrap());
            assert!(h.directory.updates().is_empty());

            h.directory.set_fail_updates(false);
            sleep(Duration::from_millis(200)).await;
            shutdown.store(true, Ordering::SeqCst);
        };
        let (result, ()) = tokio::join!(h.copier.run(), driver);
        result.unwrap();

        // One conclusion only: the bot never went back to trading.
        assert_eq!(h.copier.db.recent_phase_events(10).await.unwrap().len(), 1);
        assert_eq!(h.directory.updates(), vec![false]);
        assert!(!h.copier.db.is_halted("u1").await.unwrap());
        assert!(!h.a.is_logged_in());
    }

    #[tokio::test]
    async fn test_stored_halt_blocks_reentry_after_restart() {
        let h = harness(Phase::One).await;
        h.copier.db.set_halted("u1", true).await.unwrap();
        let tenant = h.directory.tenant();

        assert!(h.copier.settle_halt(&tenant).await);
        assert_eq!(h.directory.updates(), vec![false]);
        assert_eq!(h.directory.is_trading_enabled(&tenant).await, TradingStatus::Disabled);
        assert!(!h.copier.db.is_halted("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_does_not_replay_signals_before_persisted_cursor() {
        let h = harness(Phase::One).await;
        let tenant = h.directory.tenant();
        let profile = test_profile(Phase::One);
        let ts = Utc::now().trunc_subsecs(6);
        h.log.push(Signal::new(ts, 11, "EURUSD", Direction::Buy));

        let driver = async {
            sleep(Duration::from_millis(200)).await;
            h.directory.set_status(TradingStatus::Disabled);
        };
        let (end, ()) = tokio::join!(h.copier.run_session(&tenant, &profile), driver);
        assert_eq!(end.unwrap(), SessionEnd::Disabled);
        assert_eq!(h.a.placed_orders().len(), 1);

        // Second session on the same database: one late arrival older than
        // the cursor and one genuinely new signal.
        h.log.push(Signal::new(ts - chrono::Duration::seconds(5), 10, "EURUSD", Direction::Sell));
        h.log.push(Signal::new(ts + chrono::Duration::seconds(1), 12, "GBPUSD", Direction::Buy));
        h.directory.set_status(TradingStatus::Enabled);

        let driver = async {
            sleep(Duration::from_millis(200)).await;
            h.directory.set_status(TradingStatus::Disabled);
        };
        let (end, ()) = tokio::join!(h.copier.run_session(&tenant, &profile), driver);
        assert_eq!(end.unwrap(), SessionEnd::Disabled);

        let placed: Vec<String> = h.a.placed_orders().into_iter().map(|o| o.symbol).collect();
        assert_eq!(placed, vec!["EURUSD".to_string(), "GBPUSD".to_string()]);
        let stored = h.copier.db.load_session("u1").await.unwrap().unwrap();
        assert_eq!(stored.last_signal_cursor, Some(ts + chrono::Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_offline_store_keeps_session_running() {
        let h = harness(Phase::One).await;
        let tenant = h.directory.tenant();
        let profile = test_profile(Phase::One);
        let a1 = h.a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        let b1 = h.b.open_position("EURUSD", Direction::Sell, dec!(0.14)).unwrap();
        h.directory.set_status(TradingStatus::Unknown);
        h.log.push(Signal::new(Utc::now(), 11, "EURUSD", Direction::Buy));
        h.log.set_offline(true);
        let shutdown = h.copier.shutdown_signal();

        let driver = async {
            sleep(Duration::from_millis(300)).await;
            shutdown.store(true, Ordering::SeqCst);
        };
        let (end, ()) = tokio::join!(h.copier.run_session(&tenant, &profile), driver);

        assert_eq!(end.unwrap(), SessionEnd::Shutdown);
        assert!(h.a.placed_orders().is_empty());
        assert_eq!(h.a.open_tickets(), vec![a1]);
        assert_eq!(h.b.open_tickets(), vec![b1]);
        assert!(h.directory.updates().is_empty());
        assert!(h.copier.db.recent_phase_events(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_signal_is_skipped_after_attempts() {
        let h = harness(Phase::One).await;
        let tenant = h.directory.tenant();
        let profile = test_profile(Phase::One);
        let ts = Utc::now().trunc_subsecs(6);
        h.log.push(Signal::new(ts, 11, "EURUSD", Direction::Buy));
        h.a.set_offline(true);

        let driver = async {
            sleep(Duration::from_millis(400)).await;
            h.directory.set_status(TradingStatus::Disabled);
        };
        let (end, ()) = tokio::join!(h.copier.run_session(&tenant, &profile), driver);

        assert_eq!(end.unwrap(), SessionEnd::Disabled);
        let stats = h.copier.db.replication_stats().await.unwrap();
        assert_eq!(stats, vec![("deferred".to_string(), 1)]);
        let stored = h.copier.db.load_session("u1").await.unwrap().unwrap();
        assert_eq!(stored.last_signal_cursor, Some(ts));
    }

    #[tokio::test]
    async fn test_failed_mirror_b_login_tears_down_mirror_a() {
        let h = harness(Phase::One).await;
        h.a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        h.b.fail_login(true);

        let err = h.copier.login(&test_profile(Phase::One)).await.unwrap_err();
        assert!(err.to_string().contains("mirror-B"));
        assert!(!h.a.is_logged_in());
        assert!(h.a.open_tickets().is_empty());

        h.b.fail_login(false);
        h.copier.login(&test_profile(Phase::One)).await.unwrap();
        assert!(h.a.is_logged_in());
        assert!(h.b.is_logged_in());
    }

    #[tokio::test]
    async fn test_repeated_login_failures_alert_operator_once() {
        let h = harness(Phase::One).await;
        h.a.fail_login(true);
        let shutdown = h.copier.shutdown_signal();

        let driver = async {
            sleep(Duration::from_millis(400)).await;
            shutdown.store(true, Ordering::SeqCst);
        };
        let (result, ()) = tokio::join!(h.copier.run(), driver);
        result.unwrap();

        let alerts: Vec<_> = h
            .notifier
            .messages()
            .into_iter()
            .filter(|m| m.0 == Audience::Operator)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].2.contains("3 consecutive login failures"));
        assert!(alerts[0].2.contains("mirror-A login failed"));
    }

    #[tokio::test]
    async fn test_teardown_flattens_and_logs_out() {
        let h = harness(Phase::One).await;
        h.copier.login(&test_profile(Phase::One)).await.unwrap();
        h.a.open_position("EURUSD", Direction::Buy, dec!(2)).unwrap();
        h.b.open_position("EURUSD", Direction::Sell, dec!(0.14)).unwrap();

        h.copier.teardown().await;

        assert!(h.a.open_tickets().is_empty());
        assert!(h.b.open_tickets().is_empty());
        assert!(!h.a.is_logged_in());
        assert!(!h.b.is_logged_in());
    }

    #[tokio::test]
    async fn test_wait_for_tenant_stops_on_shutdown() {
        let h = harness(Phase::One).await;
        h.directory.set_assigned(false);
        h.copier.shutdown_signal().store(true, Ordering::SeqCst);
        assert!(h.copier.wait_for_tenant().await.is_none());
        assert!(!h.copier.wait_until_enabled(&h.directory.tenant()).await);
    }

    #[test]
    fn test_login_backoff_doubles_to_cap() {
        let mut backoff = login_backoff(&CopierConfig::default());
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_backoff().unwrap().as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 120, 120]);
    }
}
