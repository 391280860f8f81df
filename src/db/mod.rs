//! Local persistence of copier state.
//!
//! Stores what a restart needs and what `status` reports:
//! - Per-tenant session state (phase, signal cursor, running and halted flags, baseline)
//! - One record per processed signal
//! - Phase pass/fail events

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::Signal;

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Persisted session state of one tenant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSession {
    pub user_id: String,
    pub phase: i64,
    pub last_signal_cursor: Option<DateTime<Utc>>,
    pub running: bool,
    /// A phase concluded and the directory has not yet recorded the halt
    pub halted: bool,
    /// Decimal as text, kept exact
    pub baseline_equity: Option<String>,
    pub updated_at: String,
}

impl StoredSession {
    pub fn baseline(&self) -> Option<Decimal> {
        self.baseline_equity.as_deref().and_then(|v| Decimal::from_str(v).ok())
    }
}

/// One processed signal.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredReplication {
    pub id: String,
    pub user_id: String,
    pub signal_ts: DateTime<Utc>,
    pub source_ticket: i64,
    pub symbol: String,
    pub direction: String,
    pub status: String,
    pub ticket_a: Option<i64>,
    pub ticket_b: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// Phase conclusion record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PhaseEvent {
    pub id: i64,
    pub user_id: String,
    pub phase: i64,
    pub outcome: String,
    pub reason: String,
    pub equity_a: f64,
    pub equity_b: f64,
    pub created_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_state (
                user_id TEXT PRIMARY KEY,
                phase INTEGER NOT NULL,
                last_signal_cursor TEXT,
                running INTEGER NOT NULL DEFAULT 0,
                halted INTEGER NOT NULL DEFAULT 0,
                baseline_equity TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                signal_ts TEXT NOT NULL,
                source_ticket INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                ticket_a INTEGER,
                ticket_b INTEGER,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS phase_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                phase INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                equity_a REAL NOT NULL,
                equity_b REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replications_user ON replications(user_id, signal_ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replications_status ON replications(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Session State ====================

    /// Mark a session as started in `phase`.
    ///
    /// The stored baseline belongs to the stored phase and is dropped when
    /// the phase changed. The halted flag is left as it is.
    pub async fn start_session(&self, user_id: &str, phase: u8) -> Result<StoredSession> {
        sqlx::query(
            r#"
            INSERT INTO session_state (user_id, phase, running, updated_at)
            VALUES (?, ?, 1, datetime('now'))
            ON CONFLICT(user_id) DO UPDATE SET
                baseline_equity = CASE WHEN phase = excluded.phase THEN baseline_equity ELSE NULL END,
                phase = excluded.phase,
                running = 1,
                updated_at = datetime('now')
            "#,
        )
        .bind(user_id)
        .bind(phase as i64)
        .execute(&self.pool)
        .await?;

        self.load_session(user_id)
            .await?
            .context("Session state missing after insert")
    }

    pub async fn load_session(&self, user_id: &str) -> Result<Option<StoredSession>> {
        sqlx::query_as::<_, StoredSession>("SELECT * FROM session_state WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load session state")
    }

    pub async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        sqlx::query_as::<_, StoredSession>("SELECT * FROM session_state ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list sessions")
    }

    /// Persist the cursor after a fully processed signal.
    pub async fn save_cursor(&self, user_id: &str, cursor: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE session_state SET last_signal_cursor = ?, updated_at = datetime('now') WHERE user_id = ?",
        )
        .bind(cursor)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_running(&self, user_id: &str, running: bool) -> Result<()> {
        sqlx::query("UPDATE session_state SET running = ?, updated_at = datetime('now') WHERE user_id = ?")
            .bind(running)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark or clear a halt that still has to reach the directory.
    pub async fn set_halted(&self, user_id: &str, halted: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_state (user_id, phase, running, halted, updated_at)
            VALUES (?, 1, 0, ?, datetime('now'))
            ON CONFLICT(user_id) DO UPDATE SET
                halted = excluded.halted,
                updated_at = datetime('now')
            "#,
        )
        .bind(user_id)
        .bind(halted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_halted(&self, user_id: &str) -> Result<bool> {
        Ok(self.load_session(user_id).await?.is_some_and(|s| s.halted))
    }

    /// Store or clear (`None`) the phase baseline.
    pub async fn save_baseline(&self, user_id: &str, baseline: Option<Decimal>) -> Result<()> {
        sqlx::query(
            "UPDATE session_state SET baseline_equity = ?, updated_at = datetime('now') WHERE user_id = ?",
        )
        .bind(baseline.map(|b| b.to_string()))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Replications ====================

    /// Record the outcome of one signal. Returns the record id.
    pub async fn record_replication(
        &self,
        user_id: &str,
        signal: &Signal,
        status: &str,
        ticket_a: Option<u64>,
        ticket_b: Option<u64>,
        error: Option<&str>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO replications (
                id, user_id, signal_ts, source_ticket, symbol, direction,
                status, ticket_a, ticket_b, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(signal.timestamp)
        .bind(signal.ticket as i64)
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(status)
        .bind(ticket_a.map(|t| t as i64))
        .bind(ticket_b.map(|t| t as i64))
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn recent_replications(&self, limit: i64) -> Result<Vec<StoredReplication>> {
        sqlx::query_as::<_, StoredReplication>(
            "SELECT * FROM replications ORDER BY signal_ts DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch replications")
    }

    /// Replication counts per status, most frequent first.
    pub async fn replication_stats(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) AS n FROM replications GROUP BY status ORDER BY n DESC, status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ==================== Phase Events ====================

    pub async fn record_phase_event(
        &self,
        user_id: &str,
        phase: u8,
        outcome: &str,
        reason: &str,
        equity_a: Decimal,
        equity_b: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO phase_events (user_id, phase, outcome, reason, equity_a, equity_b)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(phase as i64)
        .bind(outcome)
        .bind(reason)
        .bind(equity_a.to_f64().unwrap_or(0.0))
        .bind(equity_b.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_phase_events(&self, limit: i64) -> Result<Vec<PhaseEvent>> {
        sqlx::query_as::<_, PhaseEvent>("SELECT * FROM phase_events ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch phase events")
    }
}
