//! Runtime state of one tenant's trading session.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::PhaseConfig;

/// Which mirror account a ticket lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mirror {
    A,
    B,
}

impl std::fmt::Display for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mirror::A => f.write_str("mirror-A"),
            Mirror::B => f.write_str("mirror-B"),
        }
    }
}

/// Why a close is still owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CloseReason {
    /// Compensating close of a leg whose partner failed to open
    Rollback,
    /// Flatten after a lost leg or a phase conclusion
    Flatten,
}

/// A close that failed and is retried by the sync watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingClose {
    pub mirror: Mirror,
    pub ticket: u64,
    pub reason: CloseReason,
}

/// Session state shared by the replication loop and the watchdogs.
///
/// Open sets and cursor are written by replication and the sync watchdog
/// only, always under the session lock.
#[derive(Debug, Clone)]
pub struct TenantSession {
    pub user_id: String,
    pub phase_config: PhaseConfig,

    /// Timestamp of the last fully processed signal
    pub last_signal_cursor: DateTime<Utc>,

    pub mirror_a_open: BTreeSet<u64>,
    pub mirror_b_open: BTreeSet<u64>,

    /// Equity (balance in phase 3) captured on phase entry
    pub phase_baseline_equity: Option<Decimal>,

    pub automation_healthy: bool,

    /// Stop flag for the session's background tasks
    pub running: bool,

    pub pending_closes: BTreeSet<PendingClose>,
}

pub type SharedSession = Arc<Mutex<TenantSession>>;

impl TenantSession {
    pub fn new(user_id: impl Into<String>, phase_config: PhaseConfig, cursor: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            phase_config,
            last_signal_cursor: cursor,
            mirror_a_open: BTreeSet::new(),
            mirror_b_open: BTreeSet::new(),
            phase_baseline_equity: None,
            automation_healthy: true,
            running: true,
            pending_closes: BTreeSet::new(),
        }
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Move the cursor forward; never moves it back. Returns whether it moved.
    pub fn advance_cursor(&mut self, to: DateTime<Utc>) -> bool {
        if to > self.last_signal_cursor {
            self.last_signal_cursor = to;
            true
        } else {
            false
        }
    }

    /// Tickets on `mirror` whose close is still owed for `reason`.
    pub fn pending_tickets(&self, mirror: Mirror, reason: CloseReason) -> BTreeSet<u64> {
        self.pending_closes
            .iter()
            .filter(|p| p.mirror == mirror && p.reason == reason)
            .map(|p| p.ticket)
            .collect()
    }

    /// Drop all position tracking, as after a flatten.
    pub fn clear_open_sets(&mut self) {
        self.mirror_a_open.clear();
        self.mirror_b_open.clear();
    }
}
