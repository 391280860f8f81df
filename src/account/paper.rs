//! In-memory simulated account.
//!
//! Backs `run --paper` and doubles as the account in tests: balance and
//! equity are set explicitly, orders fill at the current tick, and order,
//! close, login or transport failures can be injected.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use super::{Account, AccountError, AccountResult};
use crate::models::{
    AccountCredentials, AccountInfo, Direction, OrderReceipt, OrderRequest, Position, SymbolInfo, Tick,
};

/// Retcode used for injected rejections.
const RETCODE_REJECT: u32 = 10006;
/// Retcode for stops closer than the broker allows.
const RETCODE_INVALID_STOPS: u32 = 10016;

const FIRST_TICKET: u64 = 1001;

#[derive(Debug)]
struct PaperState {
    login: u64,
    balance: Decimal,
    equity: Decimal,
    symbols: BTreeMap<String, (SymbolInfo, Tick)>,
    positions: BTreeMap<u64, Position>,
    next_ticket: u64,
    automation: bool,
    automation_fixable: bool,
    offline: bool,
    fail_login: bool,
    fail_orders: u32,
    fail_closes: u32,
    placed: Vec<OrderRequest>,
    closed: Vec<u64>,
    logged_in: bool,
}

/// Simulated account; every method is cheap and never blocks on I/O.
#[derive(Debug)]
pub struct PaperAccount {
    name: String,
    state: Mutex<PaperState>,
}

impl PaperAccount {
    pub fn new(name: impl Into<String>, balance: Decimal) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PaperState {
                login: 0,
                balance,
                equity: balance,
                symbols: BTreeMap::new(),
                positions: BTreeMap::new(),
                next_ticket: FIRST_TICKET,
                automation: true,
                automation_fixable: true,
                offline: false,
                fail_login: false,
                fail_orders: 0,
                fail_closes: 0,
                placed: Vec::new(),
                closed: Vec::new(),
                logged_in: false,
            }),
        }
    }

    /// Paper account preloaded with a few common symbols.
    pub fn with_default_symbols(name: impl Into<String>, balance: Decimal) -> Self {
        let account = Self::new(name, balance);
        account.add_symbol("EURUSD", Decimal::new(1, 5), 5, 10, Decimal::new(108500, 5));
        account.add_symbol("GBPUSD", Decimal::new(1, 5), 5, 10, Decimal::new(126800, 5));
        account.add_symbol("USDJPY", Decimal::new(1, 3), 3, 10, Decimal::new(151200, 3));
        account.add_symbol("XAUUSD", Decimal::new(1, 2), 2, 0, Decimal::new(235000, 2));
        account
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        // A poisoned lock only means a test panicked mid-update; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// List a symbol with bid `price` and a two-point spread.
    pub fn add_symbol(&self, name: &str, point: Decimal, digits: u32, stops_level: u32, price: Decimal) {
        let info = SymbolInfo {
            name: name.to_string(),
            point,
            digits,
            stops_level,
            spread: 2,
        };
        let tick = Tick {
            bid: price,
            ask: price + point * Decimal::from(2),
        };
        self.lock().symbols.insert(name.to_string(), (info, tick));
    }

    /// Move the bid of `symbol`. Positions whose stop or target is crossed
    /// are closed as the broker would; their tickets are returned.
    pub fn set_price(&self, symbol: &str, bid: Decimal) -> Vec<u64> {
        let mut state = self.lock();
        let Some((info, tick)) = state.symbols.get_mut(symbol) else {
            return Vec::new();
        };
        tick.bid = bid;
        tick.ask = bid + info.point * Decimal::from(info.spread);
        let tick = *tick;

        let hit: Vec<u64> = state
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .filter(|p| {
                let exit = tick.entry_price(p.direction.opposite());
                p.stop_hit(exit) || p.target_hit(exit)
            })
            .map(|p| p.ticket)
            .collect();
        for ticket in &hit {
            state.positions.remove(ticket);
            info!(account = %self.name, ticket, symbol, "Paper stop triggered");
        }
        hit
    }

    pub fn set_equity(&self, equity: Decimal) {
        self.lock().equity = equity;
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.lock().balance = balance;
    }

    /// Open a position directly, bypassing order checks.
    pub fn open_position(&self, symbol: &str, direction: Direction, volume: Decimal) -> AccountResult<u64> {
        let mut state = self.lock();
        let (_, tick) = state
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| AccountError::SymbolNotFound(symbol.to_string()))?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.insert(
            ticket,
            Position {
                ticket,
                symbol: symbol.to_string(),
                direction,
                volume,
                open_price: tick.entry_price(direction),
                stop_loss: None,
                take_profit: None,
                profit: Decimal::ZERO,
            },
        );
        Ok(ticket)
    }

    /// Drop a position as the broker would on a stop-out or manual close.
    pub fn remove_position(&self, ticket: u64) -> bool {
        self.lock().positions.remove(&ticket).is_some()
    }

    pub fn fail_next_orders(&self, count: u32) {
        self.lock().fail_orders = count;
    }

    pub fn fail_next_closes(&self, count: u32) {
        self.lock().fail_closes = count;
    }

    pub fn fail_login(&self, fail: bool) {
        self.lock().fail_login = fail;
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_automation(&self, enabled: bool) {
        self.lock().automation = enabled;
    }

    /// Whether `try_enable_automation` succeeds.
    pub fn set_automation_fixable(&self, fixable: bool) {
        self.lock().automation_fixable = fixable;
    }

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.lock().placed.clone()
    }

    pub fn closed_tickets(&self) -> Vec<u64> {
        self.lock().closed.clone()
    }

    pub fn open_tickets(&self) -> Vec<u64> {
        self.lock().positions.keys().copied().collect()
    }

    pub fn is_logged_in(&self) -> bool {
        self.lock().logged_in
    }

    fn check_online(state: &PaperState) -> AccountResult<()> {
        if state.offline {
            return Err(AccountError::Transport("paper account offline".to_string()));
        }
        Ok(())
    }

    fn info(state: &PaperState) -> AccountInfo {
        AccountInfo {
            login: state.login,
            balance: state.balance,
            equity: state.equity,
            margin: Decimal::ZERO,
            currency: "USD".to_string(),
        }
    }
}

fn stop_too_close(info: &SymbolInfo, price: Decimal, level: Option<Decimal>) -> bool {
    let min = info.point * Decimal::from(info.stops_level);
    match level {
        Some(level) => (level - price).abs() < min,
        None => false,
    }
}

#[async_trait]
impl Account for PaperAccount {
    fn name(&self) -> &str {
        &self.name
    }

    async fn login(&self, credentials: &AccountCredentials) -> AccountResult<AccountInfo> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        if state.fail_login {
            return Err(AccountError::Login(format!("login {} rejected", credentials.login)));
        }
        state.login = credentials.login;
        state.logged_in = true;
        info!(account = %self.name, login = credentials.login, server = %credentials.server, "Paper login");
        Ok(Self::info(&state))
    }

    async fn shutdown(&self) {
        self.lock().logged_in = false;
    }

    async fn account_info(&self) -> AccountResult<AccountInfo> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(Self::info(&state))
    }

    async fn positions(&self) -> AccountResult<Vec<Position>> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state.positions.values().cloned().collect())
    }

    async fn symbol_info(&self, name: &str) -> AccountResult<Option<SymbolInfo>> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state.symbols.get(name).map(|(info, _)| info.clone()))
    }

    async fn select_symbol(&self, name: &str) -> AccountResult<bool> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state.symbols.contains_key(name))
    }

    async fn symbols(&self) -> AccountResult<Vec<String>> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state.symbols.keys().cloned().collect())
    }

    async fn tick(&self, symbol: &str) -> AccountResult<Option<Tick>> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state.symbols.get(symbol).map(|(_, tick)| *tick))
    }

    async fn place_order(&self, request: OrderRequest) -> AccountResult<OrderReceipt> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        state.placed.push(request.clone());

        if state.fail_orders > 0 {
            state.fail_orders -= 1;
            return Err(AccountError::Rejected {
                retcode: RETCODE_REJECT,
                comment: "Request rejected".to_string(),
            });
        }
        if !state.automation {
            return Err(AccountError::Rejected {
                retcode: 10027,
                comment: "AutoTrading disabled by client".to_string(),
            });
        }

        let (info, _) = state
            .symbols
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| AccountError::SymbolNotFound(request.symbol.clone()))?;
        if stop_too_close(&info, request.price, request.stop_loss)
            || stop_too_close(&info, request.price, request.take_profit)
        {
            return Err(AccountError::Rejected {
                retcode: RETCODE_INVALID_STOPS,
                comment: "Invalid stops".to_string(),
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.insert(
            ticket,
            Position {
                ticket,
                symbol: request.symbol.clone(),
                direction: request.direction,
                volume: request.volume,
                open_price: request.price,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                profit: Decimal::ZERO,
            },
        );

        Ok(OrderReceipt { ticket })
    }

    async fn close_position(&self, ticket: u64) -> AccountResult<()> {
        let mut state = self.lock();
        Self::check_online(&state)?;

        if state.fail_closes > 0 {
            state.fail_closes -= 1;
            return Err(AccountError::Rejected {
                retcode: RETCODE_REJECT,
                comment: "Close rejected".to_string(),
            });
        }
        if state.positions.remove(&ticket).is_none() {
            return Err(AccountError::PositionNotFound(ticket));
        }
        state.closed.push(ticket);
        Ok(())
    }

    async fn is_automation_enabled(&self) -> AccountResult<bool> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state.automation)
    }

    async fn try_enable_automation(&self) -> AccountResult<bool> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        if state.automation_fixable {
            state.automation = true;
        }
        Ok(state.automation)
    }
}
