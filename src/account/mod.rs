//! Account capability: one tradeable account behind a terminal.
//!
//! Two instances exist per tenant, mirror-A and mirror-B. The engine only
//! reads positions and issues orders/closes through this trait; it never
//! edits a position directly.

mod bridge;
mod error;
mod paper;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::{AccountCredentials, AccountInfo, OrderReceipt, OrderRequest, Position, SymbolInfo, Tick};
use crate::retry::{with_retry, RetryPolicy};

pub use bridge::BridgeAccount;
pub use error::{AccountError, AccountResult, RETCODE_DONE};
pub use paper::PaperAccount;

/// Broker-specific suffixes probed when the exact symbol name is missing.
pub const SYMBOL_SUFFIXES: [&str; 6] = [".i", "m", ".raw", "#", ".a", ".c"];

/// Operations the engine needs from a trading account.
#[async_trait]
pub trait Account: Send + Sync {
    /// Human-friendly label used in logs ("mirror-A", "mirror-B", "source").
    fn name(&self) -> &str;

    /// Open a terminal session for these credentials.
    async fn login(&self, credentials: &AccountCredentials) -> AccountResult<AccountInfo>;

    /// Close the terminal session. Never fails; errors are only logged.
    async fn shutdown(&self);

    async fn account_info(&self) -> AccountResult<AccountInfo>;

    /// All open positions on the account.
    async fn positions(&self) -> AccountResult<Vec<Position>>;

    /// Contract specification, `None` when the broker does not list the name.
    async fn symbol_info(&self, name: &str) -> AccountResult<Option<SymbolInfo>>;

    /// Add the symbol to the terminal's market watch. `false` if unknown.
    async fn select_symbol(&self, name: &str) -> AccountResult<bool>;

    /// Every symbol name the broker offers.
    async fn symbols(&self) -> AccountResult<Vec<String>>;

    async fn tick(&self, symbol: &str) -> AccountResult<Option<Tick>>;

    async fn place_order(&self, request: OrderRequest) -> AccountResult<OrderReceipt>;

    async fn close_position(&self, ticket: u64) -> AccountResult<()>;

    /// Whether the terminal currently permits programmatic trading.
    async fn is_automation_enabled(&self) -> AccountResult<bool>;

    /// Ask the terminal to permit programmatic trading; `true` on success.
    async fn try_enable_automation(&self) -> AccountResult<bool>;
}

/// Outcome of flattening one account.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CloseReport {
    pub closed: Vec<u64>,
    pub failed: Vec<(u64, AccountError)>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Close every open position on the account.
///
/// A close failure does not stop the sweep; the ticket is reported in `failed`.
pub async fn close_all(account: &dyn Account) -> AccountResult<CloseReport> {
    let positions = account.positions().await?;
    let mut report = CloseReport::default();

    for position in positions {
        match account.close_position(position.ticket).await {
            Ok(()) => {
                debug!(account = account.name(), ticket = position.ticket, "Position closed");
                report.closed.push(position.ticket);
            }
            Err(AccountError::PositionNotFound(_)) => {
                // Already gone between the snapshot and the close.
                report.closed.push(position.ticket);
            }
            Err(e) => {
                warn!(account = account.name(), ticket = position.ticket, error = %e, "Close failed");
                report.failed.push((position.ticket, e));
            }
        }
    }

    Ok(report)
}

/// Find the broker's name for `symbol`.
///
/// Tries the exact name, then each of [`SYMBOL_SUFFIXES`], then the first
/// broker symbol containing the base name (case-insensitive).
pub async fn resolve_symbol(account: &dyn Account, symbol: &str) -> AccountResult<Option<String>> {
    if is_tradeable(account, symbol).await? {
        return Ok(Some(symbol.to_string()));
    }

    for suffix in SYMBOL_SUFFIXES {
        let candidate = format!("{}{}", symbol, suffix);
        if is_tradeable(account, &candidate).await? {
            debug!(account = account.name(), symbol, resolved = %candidate, "Resolved symbol by suffix");
            return Ok(Some(candidate));
        }
    }

    let base = symbol.to_uppercase();
    let all = account.symbols().await?;
    for name in all {
        if name.to_uppercase().contains(&base) && is_tradeable(account, &name).await? {
            debug!(account = account.name(), symbol, resolved = %name, "Resolved symbol by search");
            return Ok(Some(name));
        }
    }

    Ok(None)
}

async fn is_tradeable(account: &dyn Account, name: &str) -> AccountResult<bool> {
    if !account.select_symbol(name).await? {
        return Ok(false);
    }
    Ok(account.symbol_info(name).await?.is_some())
}

/// Symbol specification, retried while the terminal returns nothing usable.
pub async fn fetch_symbol_info(
    account: &dyn Account,
    symbol: &str,
    policy: RetryPolicy,
) -> AccountResult<SymbolInfo> {
    let result = with_retry(policy, "symbol_info", AccountError::is_transient, || async move {
        match account.symbol_info(symbol).await? {
            Some(info) if info.is_valid() => Ok(info),
            _ => Err(AccountError::Transport(format!("no symbol info for {}", symbol))),
        }
    })
    .await;

    result.map_err(|e| match e {
        AccountError::Transport(_) => AccountError::SymbolNotFound(symbol.to_string()),
        other => other,
    })
}

/// Current tick, retried while the terminal returns nothing or zero prices.
pub async fn fetch_tick(account: &dyn Account, symbol: &str, policy: RetryPolicy) -> AccountResult<Tick> {
    with_retry(policy, "tick", AccountError::is_transient, || async move {
        match account.tick(symbol).await? {
            Some(tick) if tick.is_valid() => Ok(tick),
            _ => Err(AccountError::NoTick(symbol.to_string())),
        }
    })
    .await
}
