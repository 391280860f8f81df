//! In-memory doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;

use crate::account::PaperAccount;
use crate::api::{Audience, Notifier, SignalLog, TenantDirectory};
use crate::models::{AccountCredentials, Phase, Signal, Tenant, TenantProfile, TradingStatus};
use crate::retry::RetryPolicy;
use crate::trading::EngineSettings;

/// Two funded mirrors quoting EURUSD at 1.10000 and GBPUSD at 1.27000.
pub fn paper_pair() -> (Arc<PaperAccount>, Arc<PaperAccount>) {
    let make = |name: &str| {
        let account = PaperAccount::new(name, dec!(100000));
        account.add_symbol("EURUSD", dec!(0.00001), 5, 10, dec!(1.10000));
        account.add_symbol("GBPUSD", dec!(0.00001), 5, 10, dec!(1.27000));
        Arc::new(account)
    };
    (make("mirror-A"), make("mirror-B"))
}

/// Engine settings without stagger and with near-instant retries.
pub fn test_engine_settings() -> EngineSettings {
    EngineSettings {
        stagger: Duration::ZERO,
        deviation: 20,
        magic_a: 234000,
        magic_b: 234001,
        rollback: RetryPolicy::new(3, Duration::from_millis(1)),
        market_data: RetryPolicy::new(3, Duration::from_millis(1)),
    }
}

pub fn test_profile(phase: Phase) -> TenantProfile {
    let creds = |login: u64| AccountCredentials {
        login,
        server: "Demo-Server".to_string(),
        password_enc: "enc".to_string(),
        key_version: "1".to_string(),
    };
    TenantProfile {
        user_id: "u1".to_string(),
        seed: 42,
        phase,
        account_size: dec!(100000),
        mirror_a: creds(5001),
        mirror_b: creds(7001),
    }
}

/// Notifier that keeps every message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(Audience, String, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(Audience, String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, audience: Audience, subject: &str, body: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .push((audience, subject.to_string(), body.to_string()));
        true
    }
}

/// Signal log held in memory; can be switched offline.
#[derive(Default)]
pub struct MemorySignalLog {
    signals: Mutex<Vec<Signal>>,
    offline: AtomicBool,
}

impl MemorySignalLog {
    pub fn push(&self, signal: Signal) {
        self.signals.lock().unwrap().push(signal);
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalLog for MemorySignalLog {
    async fn append(&self, signal: &Signal) -> Result<bool> {
        if self.offline.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.push(signal.clone());
        Ok(true)
    }

    async fn fetch_since(&self, cursor: DateTime<Utc>) -> Result<Vec<Signal>> {
        if self.offline.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let mut signals: Vec<Signal> = self
            .signals()
            .into_iter()
            .filter(|s| s.timestamp > cursor)
            .collect();
        signals.sort_by_key(|s| s.timestamp);
        Ok(signals)
    }
}

/// Directory serving one tenant with a switchable trading status.
pub struct MemoryDirectory {
    profile: TenantProfile,
    assigned: AtomicBool,
    status: Mutex<TradingStatus>,
    fail_updates: AtomicBool,
    updates: Mutex<Vec<bool>>,
}

impl MemoryDirectory {
    pub fn new(profile: TenantProfile, status: TradingStatus) -> Self {
        Self {
            profile,
            assigned: AtomicBool::new(true),
            status: Mutex::new(status),
            fail_updates: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn tenant(&self) -> Tenant {
        Tenant {
            user_id: self.profile.user_id.clone(),
        }
    }

    pub fn set_assigned(&self, assigned: bool) {
        self.assigned.store(assigned, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: TradingStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// While set, `set_trading_enabled` fails like a dropped connection.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Every `set_trading_enabled` call that succeeded, in order.
    pub fn updates(&self) -> Vec<bool> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl TenantDirectory for MemoryDirectory {
    async fn resolve_tenant(&self) -> Result<Option<Tenant>> {
        Ok(self.assigned.load(Ordering::SeqCst).then(|| self.tenant()))
    }

    async fn load_profile(&self, _tenant: &Tenant) -> Result<TenantProfile> {
        Ok(self.profile.clone())
    }

    async fn is_trading_enabled(&self, _tenant: &Tenant) -> TradingStatus {
        *self.status.lock().unwrap()
    }

    async fn set_trading_enabled(&self, _tenant: &Tenant, enabled: bool) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            anyhow::bail!("network error");
        }
        self.updates.lock().unwrap().push(enabled);
        let status = if enabled {
            TradingStatus::Enabled
        } else {
            TradingStatus::Disabled
        };
        self.set_status(status);
        Ok(())
    }
}
