//! Data models for signals, positions, accounts and tenants.

mod account;
mod position;
mod signal;
mod tenant;

pub use account::{AccountCredentials, AccountInfo, OrderReceipt, OrderRequest, SymbolInfo, Tick};
pub use position::Position;
pub use signal::{Direction, Signal};
pub use tenant::{Phase, Tenant, TenantProfile, TradingStatus};
