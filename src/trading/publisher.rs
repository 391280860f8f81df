//! Source-side adapter: turns newly opened positions into signals.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::api::SignalLog;
use crate::models::Signal;

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(50);
pub const DEFAULT_OUTBOX_TTL: Duration = Duration::from_secs(30);

/// What one poll did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// New tickets seen on the source
    pub detected: usize,
    pub sent: usize,
    /// Signals given up on after the outbox window
    pub dropped: usize,
    /// Signals still waiting in the outbox
    pub queued: usize,
}

/// Diffs source snapshots and appends one signal per new ticket.
pub struct SignalPublisher {
    source: Arc<dyn Account>,
    log: Arc<dyn SignalLog>,
    /// Tickets in the previous snapshot; `None` until primed
    known: Option<BTreeSet<u64>>,
    last_timestamp: Option<DateTime<Utc>>,
    outbox: VecDeque<(Signal, Instant)>,
    outbox_ttl: Duration,
}

impl SignalPublisher {
    pub fn new(source: Arc<dyn Account>, log: Arc<dyn SignalLog>) -> Self {
        Self {
            source,
            log,
            known: None,
            last_timestamp: None,
            outbox: VecDeque::new(),
            outbox_ttl: DEFAULT_OUTBOX_TTL,
        }
    }

    pub fn with_outbox_ttl(mut self, ttl: Duration) -> Self {
        self.outbox_ttl = ttl;
        self
    }

    /// Poll until `stop` is set.
    pub async fn run(mut self, period: Duration, stop: Arc<AtomicBool>) {
        info!(source = self.source.name(), period_ms = period.as_millis() as u64, "Signal publisher started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !stop.load(Ordering::SeqCst) {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(report) if report.detected > 0 || report.dropped > 0 => {
                    debug!(?report, "Publish cycle");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Error in publish cycle"),
            }
        }

        if !self.outbox.is_empty() {
            warn!(pending = self.outbox.len(), "Publisher stopped with unsent signals");
        }
        info!("Signal publisher stopped");
    }

    /// Snapshot the source, queue signals for new tickets and flush the outbox.
    ///
    /// The first successful snapshot only primes the diff.
    pub async fn poll_once(&mut self) -> Result<PublishReport> {
        let positions = self
            .source
            .positions()
            .await
            .context("Failed to read source positions")?;
        let current: BTreeSet<u64> = positions.iter().map(|p| p.ticket).collect();

        let mut report = PublishReport::default();

        match &self.known {
            None => {
                info!(existing = current.len(), "Source snapshot primed");
            }
            Some(known) => {
                let mut fresh: Vec<_> = positions.iter().filter(|p| !known.contains(&p.ticket)).collect();
                fresh.sort_by_key(|p| p.ticket);

                for position in fresh {
                    let signal = Signal::new(
                        self.next_timestamp(),
                        position.ticket,
                        position.symbol.clone(),
                        position.direction,
                    );
                    info!(
                        ticket = signal.ticket,
                        symbol = %signal.symbol,
                        direction = %signal.direction,
                        "New source position"
                    );
                    self.outbox.push_back((signal, Instant::now()));
                    report.detected += 1;
                }
            }
        }
        self.known = Some(current);

        let (sent, dropped) = self.flush().await;
        report.sent = sent;
        report.dropped = dropped;
        report.queued = self.outbox.len();
        Ok(report)
    }

    /// Microsecond timestamp strictly after the previous one.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut ts = Utc::now().trunc_subsecs(6);
        if let Some(last) = self.last_timestamp {
            if ts <= last {
                ts = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_timestamp = Some(ts);
        ts
    }

    /// Send queued signals in order; stops at the first one that cannot go out.
    async fn flush(&mut self) -> (usize, usize) {
        let mut sent = 0;
        let mut dropped = 0;

        while let Some((signal, queued_at)) = self.outbox.front().cloned() {
            let delivered = match self.log.append(&signal).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    warn!(ticket = signal.ticket, error = %e, "Signal append failed");
                    false
                }
            };

            if delivered {
                self.outbox.pop_front();
                sent += 1;
            } else if queued_at.elapsed() >= self.outbox_ttl {
                warn!(
                    ticket = signal.ticket,
                    symbol = %signal.symbol,
                    age_s = queued_at.elapsed().as_secs(),
                    "Dropping signal that could not be sent"
                );
                self.outbox.pop_front();
                dropped += 1;
            } else {
                break;
            }
        }

        (sent, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PaperAccount;
    use crate::models::Direction;
    use crate::testing::MemorySignalLog;
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<PaperAccount>, Arc<MemorySignalLog>, SignalPublisher) {
        let source = Arc::new(PaperAccount::with_default_symbols("source", dec!(10000)));
        let log = Arc::new(MemorySignalLog::default());
        let publisher = SignalPublisher::new(source.clone(), log.clone());
        (source, log, publisher)
    }

    #[tokio::test]
    async fn test_priming_snapshot_emits_nothing() {
        let (source, log, mut publisher) = setup();
        source.open_position("EURUSD", Direction::Buy, dec!(1)).unwrap();

        let report = publisher.poll_once().await.unwrap();
        assert_eq!(report, PublishReport::default());
        assert!(log.signals().is_empty());
    }

    #[tokio::test]
    async fn test_new_tickets_become_ordered_signals() {
        let (source, log, mut publisher) = setup();
        publisher.poll_once().await.unwrap();

        let t1 = source.open_position("EURUSD", Direction::Buy, dec!(1)).unwrap();
        let t2 = source.open_position("XAUUSD", Direction::Sell, dec!(1)).unwrap();
        let report = publisher.poll_once().await.unwrap();
        assert_eq!(report.detected, 2);
        assert_eq!(report.sent, 2);

        // Unchanged snapshot, and a closed ticket, emit nothing.
        source.remove_position(t1);
        assert_eq!(publisher.poll_once().await.unwrap().detected, 0);

        let signals = log.signals();
        assert_eq!(signals.len(), 2);
        assert_eq!((signals[0].ticket, signals[0].direction), (t1, Direction::Buy));
        assert_eq!((signals[1].ticket, signals[1].symbol.as_str()), (t2, "XAUUSD"));
        assert!(signals[1].timestamp > signals[0].timestamp);
    }

    #[tokio::test]
    async fn test_offline_signals_wait_in_outbox() {
        let (source, log, mut publisher) = setup();
        publisher.poll_once().await.unwrap();

        log.set_offline(true);
        source.open_position("EURUSD", Direction::Buy, dec!(1)).unwrap();
        let report = publisher.poll_once().await.unwrap();
        assert_eq!((report.detected, report.sent, report.queued), (1, 0, 1));

        log.set_offline(false);
        let report = publisher.poll_once().await.unwrap();
        assert_eq!((report.sent, report.queued), (1, 0));
        assert_eq!(log.signals().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_signals_are_dropped() {
        let (source, log, publisher) = setup();
        let mut publisher = publisher.with_outbox_ttl(Duration::ZERO);
        publisher.poll_once().await.unwrap();

        log.set_offline(true);
        source.open_position("EURUSD", Direction::Buy, dec!(1)).unwrap();
        let report = publisher.poll_once().await.unwrap();
        assert_eq!((report.detected, report.dropped, report.queued), (1, 1, 0));
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let (_source, _log, mut publisher) = setup();
        let stamps: Vec<_> = (0..50).map(|_| publisher.next_timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }
}
