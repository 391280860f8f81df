//! HTTP client for a terminal bridge.
//!
//! Each terminal runs a small bridge service. Trade requests answer with a
//! terminal retcode: `{ "retcode": 10009, "order": 123456, "comment": "Request completed" }`,
//! where only 10009 counts as done.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Account, AccountError, AccountResult, RETCODE_DONE};
use crate::models::{AccountCredentials, AccountInfo, OrderReceipt, OrderRequest, Position, SymbolInfo, Tick};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Trade request result reported by the terminal.
#[derive(Debug, Clone, Deserialize)]
struct TradeResponse {
    retcode: u32,
    #[serde(default)]
    order: Option<u64>,
    #[serde(default)]
    comment: Option<String>,
}

impl TradeResponse {
    fn into_result(self) -> AccountResult<Option<u64>> {
        if self.retcode == RETCODE_DONE {
            Ok(self.order)
        } else {
            Err(AccountError::Rejected {
                retcode: self.retcode,
                comment: self.comment.unwrap_or_default(),
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    login: u64,
    server: &'a str,
    password_enc: &'a str,
    key_version: &'a str,
}

#[derive(Debug, Deserialize)]
struct TerminalState {
    trade_allowed: bool,
}

#[derive(Debug, Deserialize)]
struct SelectResponse {
    selected: bool,
}

/// Account reached through a terminal bridge over HTTP.
pub struct BridgeAccount {
    name: String,
    client: Client,
    base_url: Url,
}

impl BridgeAccount {
    pub fn new(name: impl Into<String>, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("Invalid bridge URL {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Bridge URL {} cannot take a path", base_url);
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            name: name.into(),
            client,
            base_url,
        })
    }

    /// Endpoint URL; each segment is percent-encoded, so `EURUSD#` stays in the path.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> AccountResult<T> {
        let response = self.client.get(self.url(segments)).send().await?;
        Self::decode(response).await
    }

    /// GET that maps a 404 to `None`.
    async fn get_optional<T: DeserializeOwned>(&self, segments: &[&str]) -> AccountResult<Option<T>> {
        let response = self.client.get(self.url(segments)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> AccountResult<T> {
        let response = self.client.post(self.url(segments)).json(body).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> AccountResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AccountError::Transport(format!("bridge request failed: {} - {}", status, body)));
        }
        response
            .json()
            .await
            .map_err(|e| AccountError::Transport(format!("failed to parse bridge response: {}", e)))
    }
}

#[async_trait]
impl Account for BridgeAccount {
    fn name(&self) -> &str {
        &self.name
    }

    async fn login(&self, credentials: &AccountCredentials) -> AccountResult<AccountInfo> {
        let request = LoginRequest {
            login: credentials.login,
            server: &credentials.server,
            password_enc: &credentials.password_enc,
            key_version: &credentials.key_version,
        };

        let response = self.client.post(self.url(&["login"])).json(&request).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(AccountError::Login(format!("{} - {}", status, body)));
        }
        let info: AccountInfo = Self::decode(response).await?;

        if info.login != credentials.login {
            return Err(AccountError::Login(format!(
                "terminal reports login {}, expected {}",
                info.login, credentials.login
            )));
        }

        info!(account = %self.name, login = info.login, server = %credentials.server, "Logged in");
        Ok(info)
    }

    async fn shutdown(&self) {
        match self.client.post(self.url(&["shutdown"])).send().await {
            Ok(_) => debug!(account = %self.name, "Terminal session closed"),
            Err(e) => warn!(account = %self.name, error = %e, "Failed to close terminal session"),
        }
    }

    async fn account_info(&self) -> AccountResult<AccountInfo> {
        self.get_json(&["account"]).await
    }

    async fn positions(&self) -> AccountResult<Vec<Position>> {
        self.get_json(&["positions"]).await
    }

    async fn symbol_info(&self, name: &str) -> AccountResult<Option<SymbolInfo>> {
        self.get_optional(&["symbols", name]).await
    }

    async fn select_symbol(&self, name: &str) -> AccountResult<bool> {
        let response: Option<SelectResponse> = {
            let response = self
                .client
                .post(self.url(&["symbols", name, "select"]))
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                None
            } else {
                Some(Self::decode(response).await?)
            }
        };
        Ok(response.map(|r| r.selected).unwrap_or(false))
    }

    async fn symbols(&self) -> AccountResult<Vec<String>> {
        self.get_json(&["symbols"]).await
    }

    async fn tick(&self, symbol: &str) -> AccountResult<Option<Tick>> {
        self.get_optional(&["ticks", symbol]).await
    }

    async fn place_order(&self, request: OrderRequest) -> AccountResult<OrderReceipt> {
        debug!(
            account = %self.name,
            symbol = %request.symbol,
            direction = %request.direction,
            volume = %request.volume,
            price = %request.price,
            "Sending order"
        );

        let response: TradeResponse = self.post_json(&["order", "send"], &request).await?;
        let ticket = response
            .into_result()?
            .ok_or_else(|| AccountError::Transport("order done without a ticket".to_string()))?;

        Ok(OrderReceipt { ticket })
    }

    async fn close_position(&self, ticket: u64) -> AccountResult<()> {
        let ticket_segment = ticket.to_string();
        let response = self
            .client
            .post(self.url(&["positions", &ticket_segment, "close"]))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AccountError::PositionNotFound(ticket));
        }
        let result: TradeResponse = Self::decode(response).await?;
        result.into_result().map(|_| ())
    }

    async fn is_automation_enabled(&self) -> AccountResult<bool> {
        let state: TerminalState = self.get_json(&["terminal"]).await?;
        Ok(state.trade_allowed)
    }

    async fn try_enable_automation(&self) -> AccountResult<bool> {
        let state: TerminalState = self.post_json(&["terminal", "automation"], &serde_json::json!({ "enabled": true })).await?;
        Ok(state.trade_allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_response_retcodes() {
        let done: TradeResponse =
            serde_json::from_str(r#"{"retcode": 10009, "order": 123456, "comment": "Request completed"}"#).unwrap();
        assert_eq!(done.into_result(), Ok(Some(123456)));

        let rejected: TradeResponse =
            serde_json::from_str(r#"{"retcode": 10019, "comment": "No money"}"#).unwrap();
        assert_eq!(
            rejected.into_result(),
            Err(AccountError::Rejected { retcode: 10019, comment: "No money".to_string() })
        );
    }

    #[test]
    fn test_endpoint_urls() {
        let account = BridgeAccount::new("mirror-A", "http://127.0.0.1:8001/").unwrap();
        assert_eq!(account.url(&["positions"]).as_str(), "http://127.0.0.1:8001/positions");
        assert_eq!(account.name(), "mirror-A");

        let nested = BridgeAccount::new("mirror-B", "http://bridge.local/terminal-b").unwrap();
        assert_eq!(
            nested.url(&["positions", "42", "close"]).as_str(),
            "http://bridge.local/terminal-b/positions/42/close"
        );
    }

    #[test]
    fn test_symbol_names_are_encoded_into_the_path() {
        let account = BridgeAccount::new("mirror-A", "http://127.0.0.1:8001").unwrap();

        let url = account.url(&["symbols", "EURUSD#", "select"]);
        assert_eq!(url.path(), "/symbols/EURUSD%23/select");
        assert_eq!(url.fragment(), None);

        let url = account.url(&["ticks", "US30.cash"]);
        assert_eq!(url.path(), "/ticks/US30.cash");
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(BridgeAccount::new("mirror-A", "not a url").is_err());
        assert!(BridgeAccount::new("mirror-A", "mailto:ops@example.com").is_err());
    }
}
