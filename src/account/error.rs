use thiserror::Error;

/// Convenience alias for account results.
pub type AccountResult<T> = Result<T, AccountError>;

/// Terminal retcode for a completed trade request.
pub const RETCODE_DONE: u32 = 10009;

/// Error returned by an account implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountError {
    /// Network, timeout or bridge failure; the request may succeed if repeated.
    #[error("transport error: {0}")]
    Transport(String),

    /// Bad credentials or an unreachable trade server.
    #[error("login failed: {0}")]
    Login(String),

    /// The terminal refused a trade request.
    #[error("rejected with retcode {retcode}: {comment}")]
    Rejected { retcode: u32, comment: String },

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// The terminal returned no tick or zero prices.
    #[error("no valid tick for {0}")]
    NoTick(String),

    #[error("position {0} not found")]
    PositionNotFound(u64),
}

impl AccountError {
    /// Whether retrying the same request can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, AccountError::Transport(_) | AccountError::NoTick(_))
    }
}

impl From<reqwest::Error> for AccountError {
    fn from(err: reqwest::Error) -> Self {
        AccountError::Transport(err.to_string())
    }
}
