//! Remote append-only signal log.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use super::supabase::SupabaseClient;
use crate::connectivity::ConnectivityMonitor;
use crate::models::Signal;
use crate::retry::{with_retry, RetryPolicy};

/// Default table holding the signals.
pub const DEFAULT_SIGNAL_TABLE: &str = "orders";

/// Append-only, timestamp-ordered log of signals.
#[async_trait]
pub trait SignalLog: Send + Sync {
    /// Append one signal. `Ok(false)` means the store was offline and
    /// nothing was sent.
    async fn append(&self, signal: &Signal) -> Result<bool>;

    /// Signals with a timestamp strictly after `cursor`, oldest first.
    /// Empty when offline.
    async fn fetch_since(&self, cursor: DateTime<Utc>) -> Result<Vec<Signal>>;
}

/// Signal log stored in a Supabase table.
pub struct SupabaseSignalLog {
    client: SupabaseClient,
    table: String,
    connectivity: ConnectivityMonitor,
    retry: RetryPolicy,
}

impl SupabaseSignalLog {
    pub fn new(client: SupabaseClient, table: impl Into<String>, connectivity: ConnectivityMonitor) -> Self {
        Self {
            client,
            table: table.into(),
            connectivity,
            retry: RetryPolicy::new(2, Duration::from_millis(200)),
        }
    }
}

/// PostgREST filter selecting rows after the cursor.
fn after_filter(cursor: DateTime<Utc>) -> String {
    format!("gt.{}", cursor.to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[async_trait]
impl SignalLog for SupabaseSignalLog {
    async fn append(&self, signal: &Signal) -> Result<bool> {
        if !self.connectivity.is_online() {
            self.connectivity.warn_offline("append signal");
            return Ok(false);
        }

        with_retry(self.retry, "append signal", |_| true, || async move {
            self.client.insert(&self.table, signal).await
        })
        .await?;

        debug!(ticket = signal.ticket, symbol = %signal.symbol, "Signal appended");
        Ok(true)
    }

    async fn fetch_since(&self, cursor: DateTime<Utc>) -> Result<Vec<Signal>> {
        if !self.connectivity.is_online() {
            self.connectivity.warn_offline("fetch signals");
            return Ok(Vec::new());
        }

        let query = [
            ("select", "*".to_string()),
            ("ts", after_filter(cursor)),
            ("order", "ts.asc".to_string()),
        ];

        let query = &query;
        let rows: Vec<serde_json::Value> = with_retry(self.retry, "fetch signals", |_| true, || async move {
            self.client.select(&self.table, query).await
        })
        .await?;

        let mut signals = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<Signal>(row.clone()) {
                Ok(signal) => signals.push(signal),
                Err(e) => warn!(row = %row, error = %e, "Skipping malformed signal row"),
            }
        }

        Ok(signals)
    }
}
