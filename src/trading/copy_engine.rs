//! Replication engine: turns one signal into a mirror-A order and an
//! opposite mirror-B order, rolling back mirror-A when mirror-B fails.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::account::{fetch_symbol_info, fetch_tick, resolve_symbol, Account, AccountError};
use crate::api::{Audience, Notifier};
use crate::models::{Direction, OrderRequest, Signal};
use crate::retry::{with_retry, RetryPolicy};

use super::session::{CloseReason, Mirror, PendingClose, SharedSession};
use super::stops::compute_stops;
use super::{CopierConfig, PhaseConfig};

/// Outcome of replicating one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationResult {
    /// Both legs open (mirror-B `None` when disabled for the phase)
    Replicated { mirror_a: u64, mirror_b: Option<u64> },

    /// Symbol not tradeable on a mirror; nothing was placed
    Skipped { reason: String },

    /// Mirror-A order failed; mirror-B was not attempted
    Failed { error: String },

    /// Mirror-B failed after mirror-A filled. `compensated` is false when the
    /// mirror-A close also failed and is left pending.
    RolledBack { mirror_a: u64, error: String, compensated: bool },

    /// Transient failure before any order was placed
    Deferred { error: String },
}

impl ReplicationResult {
    /// Whether the cursor may move past this signal.
    pub fn advances_cursor(&self) -> bool {
        !matches!(self, ReplicationResult::Deferred { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            ReplicationResult::Replicated { .. } => "replicated",
            ReplicationResult::Skipped { .. } => "skipped",
            ReplicationResult::Failed { .. } => "failed",
            ReplicationResult::RolledBack { .. } => "rolled_back",
            ReplicationResult::Deferred { .. } => "deferred",
        }
    }

    /// Tickets still open because of this replication.
    pub fn tickets(&self) -> (Option<u64>, Option<u64>) {
        match self {
            ReplicationResult::Replicated { mirror_a, mirror_b } => (Some(*mirror_a), *mirror_b),
            _ => (None, None),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ReplicationResult::Skipped { reason } => Some(reason),
            ReplicationResult::Failed { error }
            | ReplicationResult::RolledBack { error, .. }
            | ReplicationResult::Deferred { error } => Some(error),
            ReplicationResult::Replicated { .. } => None,
        }
    }
}

/// Delay before acting on a signal, fixed for a given tenant seed.
///
/// Tenants copying the same source get different delays, so their orders do
/// not hit the market at the same instant; one tenant always gets the same delay.
pub fn stagger_delay(seed: u64, max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

/// Order parameters that do not depend on the signal.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub stagger: Duration,
    pub deviation: u32,
    pub magic_a: u64,
    pub magic_b: u64,
    pub rollback: RetryPolicy,
    pub market_data: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &CopierConfig, seed: u64) -> Self {
        Self {
            stagger: stagger_delay(seed, config.max_stagger),
            deviation: config.deviation,
            magic_a: config.magic_a,
            magic_b: config.magic_b,
            rollback: RetryPolicy::new(config.rollback_attempts, config.retry_base_delay),
            market_data: RetryPolicy::new(3, config.retry_base_delay),
        }
    }
}

/// One side of a replicated pair.
struct Leg<'a> {
    mirror: Mirror,
    account: &'a dyn Account,
    symbol: String,
    direction: Direction,
    volume: Decimal,
}

/// Places mirrored orders for signals, one at a time.
pub struct ReplicationEngine {
    mirror_a: Arc<dyn Account>,
    mirror_b: Arc<dyn Account>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
}

impl ReplicationEngine {
    pub fn new(
        mirror_a: Arc<dyn Account>,
        mirror_b: Arc<dyn Account>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            mirror_a,
            mirror_b,
            notifier,
            settings,
        }
    }

    /// Replicate `signal` onto both mirrors under `phase`.
    pub async fn replicate(&self, signal: &Signal, phase: &PhaseConfig, session: &SharedSession) -> ReplicationResult {
        info!(
            ticket = signal.ticket,
            symbol = %signal.symbol,
            direction = %signal.direction,
            delay_ms = self.settings.stagger.as_millis() as u64,
            "Replicating signal"
        );

        if !self.settings.stagger.is_zero() {
            tokio::time::sleep(self.settings.stagger).await;
        }

        // Resolve names on both mirrors before anything is placed, so a
        // missing symbol never leaves a one-sided position.
        let symbol_a = match self.resolve(self.mirror_a.as_ref(), &signal.symbol).await {
            Ok(name) => name,
            Err(result) => return result,
        };
        let symbol_b = if phase.mirror_b_enabled {
            match self.resolve(self.mirror_b.as_ref(), &signal.symbol).await {
                Ok(name) => Some(name),
                Err(result) => return result,
            }
        } else {
            None
        };

        let leg_a = Leg {
            mirror: Mirror::A,
            account: self.mirror_a.as_ref(),
            symbol: symbol_a,
            direction: signal.direction,
            volume: phase.mirror_a_lots,
        };

        let request_a = match self.build_request(&leg_a, phase).await {
            Ok(request) => request,
            Err(e) => return pre_order_outcome(Mirror::A, e),
        };

        let mut session = session.lock().await;

        let ticket_a = match leg_a.account.place_order(request_a).await {
            Ok(receipt) => receipt.ticket,
            Err(e) => {
                warn!(ticket = signal.ticket, error = %e, "Mirror-A order failed, skipping mirror-B");
                return ReplicationResult::Failed { error: e.to_string() };
            }
        };
        info!(source = signal.ticket, ticket = ticket_a, "Mirror-A leg open");

        let Some(symbol_b) = symbol_b else {
            session.mirror_a_open.insert(ticket_a);
            return ReplicationResult::Replicated { mirror_a: ticket_a, mirror_b: None };
        };

        let leg_b = Leg {
            mirror: Mirror::B,
            account: self.mirror_b.as_ref(),
            symbol: symbol_b,
            direction: signal.direction.opposite(),
            volume: phase.mirror_b_lots,
        };

        let placed_b = match self.build_request(&leg_b, phase).await {
            Ok(request) => leg_b.account.place_order(request).await,
            Err(e) => Err(e),
        };

        match placed_b {
            Ok(receipt) => {
                info!(source = signal.ticket, ticket = receipt.ticket, "Mirror-B leg open");
                session.mirror_a_open.insert(ticket_a);
                session.mirror_b_open.insert(receipt.ticket);
                ReplicationResult::Replicated {
                    mirror_a: ticket_a,
                    mirror_b: Some(receipt.ticket),
                }
            }
            Err(e) => {
                warn!(source = signal.ticket, ticket = ticket_a, error = %e, "Mirror-B order failed, rolling back mirror-A");
                let compensated = self.rollback(ticket_a).await;
                if !compensated {
                    session.pending_closes.insert(PendingClose {
                        mirror: Mirror::A,
                        ticket: ticket_a,
                        reason: CloseReason::Rollback,
                    });
                    drop(session);
                    self.notifier
                        .notify(
                            Audience::Operator,
                            "Rollback failed",
                            &format!(
                                "Mirror-B order for {} {} failed ({}). Closing mirror-A ticket {} also failed; \
                                 the position is one-sided until the close succeeds.",
                                signal.direction, signal.symbol, e, ticket_a
                            ),
                        )
                        .await;
                }
                ReplicationResult::RolledBack {
                    mirror_a: ticket_a,
                    error: e.to_string(),
                    compensated,
                }
            }
        }
    }

    /// Broker name for the symbol, or the result to return when it can't be found.
    async fn resolve(&self, account: &dyn Account, symbol: &str) -> Result<String, ReplicationResult> {
        match resolve_symbol(account, symbol).await {
            Ok(Some(name)) => Ok(name),
            Ok(None) => {
                warn!(account = account.name(), symbol, "Symbol not found, skipping signal");
                Err(ReplicationResult::Skipped {
                    reason: format!("{} not found on {}", symbol, account.name()),
                })
            }
            Err(e) if e.is_transient() => Err(ReplicationResult::Deferred { error: e.to_string() }),
            Err(e) => Err(ReplicationResult::Failed { error: e.to_string() }),
        }
    }

    async fn build_request(&self, leg: &Leg<'_>, phase: &PhaseConfig) -> Result<OrderRequest, AccountError> {
        let info = fetch_symbol_info(leg.account, &leg.symbol, self.settings.market_data).await?;
        let tick = fetch_tick(leg.account, &leg.symbol, self.settings.market_data).await?;

        let price = info.normalize(tick.entry_price(leg.direction));
        let stops = compute_stops(leg.direction, price, phase.stop_loss_pips, phase.take_profit_pips, &info);

        let (magic, comment) = match leg.mirror {
            Mirror::A => (self.settings.magic_a, "mirror_a"),
            Mirror::B => (self.settings.magic_b, "mirror_b"),
        };

        debug!(
            mirror = %leg.mirror,
            symbol = %leg.symbol,
            direction = %leg.direction,
            price = %price,
            sl = ?stops.stop_loss,
            tp = ?stops.take_profit,
            stops_level = info.stops_level,
            "Order prepared"
        );

        Ok(OrderRequest {
            symbol: leg.symbol.clone(),
            direction: leg.direction,
            volume: leg.volume,
            price,
            stop_loss: stops.stop_loss,
            take_profit: stops.take_profit,
            deviation: self.settings.deviation,
            magic,
            comment: comment.to_string(),
        })
    }

    /// Close the mirror-A leg of a half-opened pair. `true` once it is gone.
    async fn rollback(&self, ticket: u64) -> bool {
        let account = self.mirror_a.as_ref();
        let closed = with_retry(self.settings.rollback, "rollback close", |_| true, || async move {
            match account.close_position(ticket).await {
                Err(AccountError::PositionNotFound(_)) => Ok(()),
                other => other,
            }
        })
        .await;

        match closed {
            Ok(()) => {
                info!(ticket, "Mirror-A leg rolled back");
                true
            }
            Err(e) => {
                error!(ticket, error = %e, "Rollback close failed, mirror-A position is one-sided");
                false
            }
        }
    }
}

/// Map an error raised before any order was placed.
fn pre_order_outcome(mirror: Mirror, error: AccountError) -> ReplicationResult {
    match error {
        AccountError::SymbolNotFound(symbol) => {
            warn!(%mirror, symbol = %symbol, "No usable symbol info, skipping signal");
            ReplicationResult::Skipped {
                reason: format!("{} has no symbol info on {}", symbol, mirror),
            }
        }
        e if e.is_transient() => ReplicationResult::Deferred { error: e.to_string() },
        e => ReplicationResult::Failed { error: e.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PaperAccount;
    use crate::models::Phase;
    use crate::testing::{paper_pair, test_engine_settings, RecordingNotifier};
    use crate::trading::TenantSession;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Fixture {
        a: Arc<PaperAccount>,
        b: Arc<PaperAccount>,
        notifier: Arc<RecordingNotifier>,
        engine: ReplicationEngine,
        session: SharedSession,
    }

    fn fixture(phase: Phase) -> Fixture {
        let (a, b) = paper_pair();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = ReplicationEngine::new(a.clone(), b.clone(), notifier.clone(), test_engine_settings());
        let session = TenantSession::new("u1", PhaseConfig::for_phase(phase, dec!(100000)), Utc::now()).shared();
        Fixture { a, b, notifier, engine, session }
    }

    fn signal(symbol: &str, direction: Direction) -> Signal {
        Signal::new(Utc::now(), 77, symbol, direction)
    }

    #[tokio::test]
    async fn test_replicates_both_legs_in_opposite_directions() {
        let f = fixture(Phase::One);
        let phase = f.session.lock().await.phase_config.clone();

        let result = f.engine.replicate(&signal("EURUSD", Direction::Buy), &phase, &f.session).await;

        assert_eq!(result, ReplicationResult::Replicated { mirror_a: 1001, mirror_b: Some(1001) });

        let a_orders = f.a.placed_orders();
        assert_eq!(a_orders.len(), 1);
        assert_eq!(a_orders[0].direction, Direction::Buy);
        assert_eq!(a_orders[0].volume, dec!(2.0));
        assert_eq!(a_orders[0].magic, 234000);
        assert_eq!(a_orders[0].comment, "mirror_a");
        // Buy fills at the ask, stops 1250 points away.
        assert_eq!(a_orders[0].price, dec!(1.10002));
        assert_eq!(a_orders[0].stop_loss, Some(dec!(1.08752)));

        let b_orders = f.b.placed_orders();
        assert_eq!(b_orders[0].direction, Direction::Sell);
        assert_eq!(b_orders[0].volume, dec!(0.14));
        assert_eq!(b_orders[0].magic, 234001);
        assert_eq!(b_orders[0].price, dec!(1.10000));

        let session = f.session.lock().await;
        assert!(session.mirror_a_open.contains(&1001));
        assert!(session.mirror_b_open.contains(&1001));
    }

    #[tokio::test]
    async fn test_phase_three_places_mirror_a_only() {
        let f = fixture(Phase::Three);
        let phase = f.session.lock().await.phase_config.clone();

        let result = f.engine.replicate(&signal("EURUSD", Direction::Sell), &phase, &f.session).await;

        assert_eq!(result, ReplicationResult::Replicated { mirror_a: 1001, mirror_b: None });
        assert!(f.b.placed_orders().is_empty());
        let order = &f.a.placed_orders()[0];
        assert_eq!(order.stop_loss, None);
        assert_eq!(order.take_profit, None);
        assert_eq!(order.volume, dec!(0.5));
    }

    #[tokio::test]
    async fn test_rollback_when_mirror_b_fails() {
        let f = fixture(Phase::One);
        let phase = f.session.lock().await.phase_config.clone();
        f.b.fail_next_orders(1);

        let result = f.engine.replicate(&signal("EURUSD", Direction::Buy), &phase, &f.session).await;

        assert!(matches!(
            result,
            ReplicationResult::RolledBack { mirror_a: 1001, compensated: true, .. }
        ));
        assert!(result.advances_cursor());
        assert_eq!(f.a.closed_tickets(), vec![1001]);
        assert!(f.a.open_tickets().is_empty());

        let session = f.session.lock().await;
        assert!(session.mirror_a_open.is_empty());
        assert!(session.pending_closes.is_empty());
        assert!(f.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_tracked_and_reported() {
        let f = fixture(Phase::One);
        let phase = f.session.lock().await.phase_config.clone();
        f.b.fail_next_orders(1);
        f.a.fail_next_closes(10);

        let result = f.engine.replicate(&signal("EURUSD", Direction::Buy), &phase, &f.session).await;

        assert!(matches!(result, ReplicationResult::RolledBack { compensated: false, .. }));
        assert_eq!(f.a.open_tickets(), vec![1001]);

        let session = f.session.lock().await;
        assert_eq!(session.pending_tickets(Mirror::A, CloseReason::Rollback).len(), 1);
        assert!(session.mirror_a_open.is_empty());

        let messages = f.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Audience::Operator);
    }

    #[tokio::test]
    async fn test_mirror_a_failure_skips_mirror_b() {
        let f = fixture(Phase::One);
        let phase = f.session.lock().await.phase_config.clone();
        f.a.fail_next_orders(1);

        let result = f.engine.replicate(&signal("EURUSD", Direction::Buy), &phase, &f.session).await;

        assert!(matches!(result, ReplicationResult::Failed { .. }));
        assert!(f.b.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_skipped_before_any_order() {
        let f = fixture(Phase::One);
        let phase = f.session.lock().await.phase_config.clone();

        let result = f.engine.replicate(&signal("BTCUSD", Direction::Buy), &phase, &f.session).await;

        assert!(matches!(result, ReplicationResult::Skipped { .. }));
        assert!(result.advances_cursor());
        assert!(f.a.placed_orders().is_empty());
        assert!(f.b.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_symbol_missing_on_mirror_b_only_is_skipped() {
        let f = fixture(Phase::One);
        let phase = f.session.lock().await.phase_config.clone();
        f.a.add_symbol("US30", dec!(0.01), 2, 0, dec!(39000));

        let result = f.engine.replicate(&signal("US30", Direction::Buy), &phase, &f.session).await;

        assert!(matches!(result, ReplicationResult::Skipped { .. }));
        assert!(f.a.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_offline_account_defers() {
        let f = fixture(Phase::One);
        let phase = f.session.lock().await.phase_config.clone();
        f.a.set_offline(true);

        let result = f.engine.replicate(&signal("EURUSD", Direction::Buy), &phase, &f.session).await;

        assert!(matches!(result, ReplicationResult::Deferred { .. }));
        assert!(!result.advances_cursor());
    }

    #[tokio::test]
    async fn test_suffixed_symbol_on_mirror_b() {
        let f = fixture(Phase::Two);
        let phase = f.session.lock().await.phase_config.clone();
        f.a.add_symbol("GER40", dec!(0.1), 1, 0, dec!(18000));
        f.b.add_symbol("GER40.raw", dec!(0.1), 1, 0, dec!(18000));

        let result = f.engine.replicate(&signal("GER40", Direction::Sell), &phase, &f.session).await;

        assert!(matches!(result, ReplicationResult::Replicated { .. }));
        assert_eq!(f.b.placed_orders()[0].symbol, "GER40.raw");
        assert_eq!(f.b.placed_orders()[0].direction, Direction::Buy);
    }

    #[test]
    fn test_stagger_is_deterministic_and_bounded() {
        let max = Duration::from_secs(10);
        for seed in [0u64, 1, 17, 42, 9_999_999] {
            let first = stagger_delay(seed, max);
            assert_eq!(first, stagger_delay(seed, max));
            assert!(first <= max);
        }
        assert_eq!(stagger_delay(17, Duration::ZERO), Duration::ZERO);
    }
}
