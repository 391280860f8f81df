//! Mirror copier
//!
//! Copies positions opened on a source account onto two mirror accounts,
//! one in the same direction and one opposite, keeps the pair in sync and
//! tracks the tenant's evaluation phase.

mod account;
mod api;
mod bot;
mod connectivity;
mod db;
mod models;
mod retry;
mod trading;

#[cfg(test)]
mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::account::{Account, BridgeAccount, PaperAccount};
use crate::api::{
    LogNotifier, Notifier, SignalLog, SupabaseClient, SupabaseDirectory, SupabaseSignalLog, WebhookNotifier,
    DEFAULT_SIGNAL_TABLE,
};
use crate::bot::{Copier, CopierDeps};
use crate::connectivity::{endpoint_of, ConnectivityMonitor};
use crate::db::Database;
use crate::trading::{CopierConfig, PhaseConfig, SignalPublisher, DEFAULT_POLL_PERIOD};

/// Mirror copier CLI.
#[derive(Parser)]
#[command(name = "mirrorcopy")]
#[command(about = "Copy source-account signals onto a same-direction and an opposite-direction mirror", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "MIRRORCOPY_DATABASE", default_value = "sqlite:./mirrorcopy.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Remote store holding signals and tenant data.
#[derive(clap::Args)]
struct StoreArgs {
    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    supabase_key: Option<String>,

    /// Table holding the signals
    #[arg(long, env = "SIGNAL_TABLE", default_value = DEFAULT_SIGNAL_TABLE)]
    signal_table: String,
}

impl StoreArgs {
    fn client(&self) -> Result<SupabaseClient> {
        let url = self.supabase_url.as_deref().context("SUPABASE_URL not set")?;
        let key = self.supabase_key.as_deref().context("SUPABASE_KEY not set")?;
        SupabaseClient::new(url, key)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the copy engine
    Run {
        /// Bridge in front of the same-direction terminal
        #[arg(long, env = "MIRROR_A_BRIDGE_URL", required_unless_present = "paper")]
        mirror_a_url: Option<String>,

        /// Bridge in front of the opposite-direction terminal
        #[arg(long, env = "MIRROR_B_BRIDGE_URL", required_unless_present = "paper")]
        mirror_b_url: Option<String>,

        /// Notification webhook; messages are only logged when unset
        #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
        webhook_url: Option<String>,

        /// Operator address forwarded with notifications
        #[arg(long, env = "OPERATOR_EMAIL")]
        operator: Option<String>,

        /// IP this deployment is registered under; discovered when unset
        #[arg(long, env = "DEPLOYMENT_IP")]
        deployment_ip: Option<String>,

        /// Trade on simulated accounts instead of the bridges
        #[arg(long)]
        paper: bool,
    },

    /// Publish signals for positions opened on the source terminal
    Publish {
        /// Bridge in front of the source terminal
        #[arg(long, env = "SOURCE_BRIDGE_URL")]
        source_url: String,
    },

    /// Show persisted session state and statistics
    Status,

    /// Show the phase table and timings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = CopierConfig::default();

    match cli.command {
        Commands::Run {
            mirror_a_url,
            mirror_b_url,
            webhook_url,
            operator,
            deployment_ip,
            paper,
        } => {
            let db = Database::new(&cli.database).await?;
            let client = cli.store.client()?;
            let connectivity = spawn_connectivity(&client, &config);

            let (mirror_a, mirror_b): (Arc<dyn Account>, Arc<dyn Account>) = if paper {
                (
                    Arc::new(PaperAccount::with_default_symbols("mirror-A", dec!(100000))),
                    Arc::new(PaperAccount::with_default_symbols("mirror-B", dec!(100000))),
                )
            } else {
                let a = mirror_a_url.context("mirror-A bridge URL not set")?;
                let b = mirror_b_url.context("mirror-B bridge URL not set")?;
                (
                    Arc::new(BridgeAccount::new("mirror-A", &a)?),
                    Arc::new(BridgeAccount::new("mirror-B", &b)?),
                )
            };

            let notifier: Arc<dyn Notifier> = match webhook_url {
                Some(url) => Arc::new(WebhookNotifier::new(url, operator)?),
                None => {
                    warn!("No notification webhook configured, notifications are only logged");
                    Arc::new(LogNotifier)
                }
            };

            let deps = CopierDeps {
                mirror_a,
                mirror_b,
                signal_log: Arc::new(SupabaseSignalLog::new(
                    client.clone(),
                    cli.store.signal_table.clone(),
                    connectivity.clone(),
                )),
                directory: Arc::new(SupabaseDirectory::new(client, connectivity, deployment_ip)?),
                notifier,
            };

            println!("\n=== Mirror Copier ===");
            println!("Mode: {}", if paper { "PAPER (simulated accounts)" } else { "LIVE TRADING" });
            println!("Signal table: {}", cli.store.signal_table);
            println!("\nPress Ctrl+C to stop.\n");

            let copier = Copier::new(config, db, deps);
            if let Err(e) = copier.run().await {
                tracing::error!(error = %e, "Copier error");
            }
        }

        Commands::Publish { source_url } => {
            let client = cli.store.client()?;
            let connectivity = spawn_connectivity(&client, &config);
            let source: Arc<dyn Account> = Arc::new(BridgeAccount::new("source", &source_url)?);
            let log: Arc<dyn SignalLog> = Arc::new(SupabaseSignalLog::new(
                client,
                cli.store.signal_table.clone(),
                connectivity,
            ));

            let stop = Arc::new(AtomicBool::new(false));
            let shutdown = stop.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                shutdown.store(true, Ordering::SeqCst);
            });

            println!("\n=== Signal Publisher ===");
            println!("Signal table: {}", cli.store.signal_table);
            println!("\nPress Ctrl+C to stop.\n");

            SignalPublisher::new(source, log).run(DEFAULT_POLL_PERIOD, stop).await;
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let sessions = db.list_sessions().await?;
            if sessions.is_empty() {
                println!("No session found. Run 'mirrorcopy run' to start copying.");
                return Ok(());
            }

            println!("\n=== Sessions ===\n");
            println!(
                "{:<38} {:>6} {:>8} {:>7} {:>14} {:<28}",
                "USER", "PHASE", "RUNNING", "HALTED", "BASELINE", "CURSOR"
            );
            println!("{}", "-".repeat(106));
            for s in &sessions {
                println!(
                    "{:<38} {:>6} {:>8} {:>7} {:>14} {:<28}",
                    s.user_id,
                    s.phase,
                    if s.running { "yes" } else { "no" },
                    if s.halted { "yes" } else { "no" },
                    s.baseline().map(|b| b.round_dp(2).to_string()).unwrap_or_else(|| "-".to_string()),
                    s.last_signal_cursor
                        .map(|c| c.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }

            let stats = db.replication_stats().await?;
            let total: i64 = stats.iter().map(|(_, n)| n).sum();
            println!("\n=== Replications ({}) ===\n", total);
            for (status, count) in &stats {
                println!("  {:<14} {:>8}", status, count);
            }

            let recent = db.recent_replications(10).await?;
            if !recent.is_empty() {
                println!("\n--- Recent Signals ---");
                for r in &recent {
                    println!(
                        "  {} #{} {} {} -> {} (A: {}, B: {}){}",
                        r.signal_ts.format("%m-%d %H:%M:%S"),
                        r.source_ticket,
                        r.direction,
                        r.symbol,
                        r.status,
                        r.ticket_a.map_or("-".to_string(), |t| t.to_string()),
                        r.ticket_b.map_or("-".to_string(), |t| t.to_string()),
                        r.error_message.as_deref().map(|e| format!(" {}", e)).unwrap_or_default(),
                    );
                }
            }

            let events = db.recent_phase_events(10).await?;
            if !events.is_empty() {
                println!("\n--- Phase Events ---");
                for e in &events {
                    println!(
                        "  {} phase {} {}: {} (A: ${:.2}, B: ${:.2})",
                        e.created_at, e.phase, e.outcome, e.reason, e.equity_a, e.equity_b
                    );
                }
            }
        }

        Commands::Config => {
            println!("\n=== Phase Table (account size {}) ===\n", config.nominal_balance);
            println!(
                "{:<6} {:>8} {:>8} {:>8} {:>8} {:>10} {:>8}",
                "PHASE", "SL PTS", "TP PTS", "A LOTS", "B LOTS", "B ENABLED", "TARGET"
            );
            println!("{}", "-".repeat(64));
            let dash = || "-".to_string();
            for p in PhaseConfig::all() {
                println!(
                    "{:<6} {:>8} {:>8} {:>8} {:>8} {:>10} {:>8}",
                    p.phase.number(),
                    p.stop_loss_pips.map_or_else(dash, |v| v.to_string()),
                    p.take_profit_pips.map_or_else(dash, |v| v.to_string()),
                    p.mirror_a_lots,
                    p.mirror_b_lots,
                    if p.mirror_b_enabled { "yes" } else { "no" },
                    p.target_profit.map_or_else(dash, |v| v.to_string()),
                );
            }

            println!("\n=== Timings ===\n");
            println!("  Replication loop:     {:?}", config.replication_period);
            println!("  Sync watchdog:        {:?}", config.sync_period);
            println!("  Automation watchdog:  {:?}", config.automation_period);
            println!("  Connectivity sample:  {:?}", config.connectivity_period);
            println!("  Phase evaluation:     every {} iterations", config.phase_eval_every);
            println!("  Enabled check:        every {} iterations", config.enabled_check_every);
            println!("  Max stagger:          {:?}", config.max_stagger);
            println!("  Max signal age:       {:?}", config.max_signal_age);
            println!(
                "  Login back-off:       {:?} .. {:?}",
                config.login_backoff_initial, config.login_backoff_max
            );

            println!("\n=== Orders ===\n");
            println!("  Deviation:            {} points", config.deviation);
            println!("  Magic (A / B):        {} / {}", config.magic_a, config.magic_b);
            println!("  Rollback attempts:    {}", config.rollback_attempts);
            println!("  Deferred attempts:    {}", config.deferred_attempts);
            println!("  Halt write attempts:  {}", config.halt_attempts);
            println!("  Login alert after:    {} failures", config.login_alert_after);
        }
    }

    Ok(())
}

/// Start sampling the store's reachability in the background.
fn spawn_connectivity(client: &SupabaseClient, config: &CopierConfig) -> ConnectivityMonitor {
    let monitor = ConnectivityMonitor::new(config.offline_warn_cooldown);
    match endpoint_of(client.base_url()) {
        Some((host, port)) => {
            monitor.spawn(host, port, config.connectivity_period, Arc::new(AtomicBool::new(false)));
        }
        None => warn!(url = client.base_url(), "Cannot derive a probe target, assuming online"),
    }
    monitor
}
