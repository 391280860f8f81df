//! Row types of the remote store's tables.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::models::AccountCredentials;

/// Row of `vps`.
#[derive(Debug, Clone, Deserialize)]
pub struct VpsRow {
    pub id: i64,
}

/// Row of `profiles`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default)]
    pub started_trading: Option<bool>,
}

/// Row of `account_prop`: the evaluated account, traded as mirror-A.
#[derive(Debug, Clone, Deserialize)]
pub struct PropAccountRow {
    pub id: u64,
    #[serde(deserialize_with = "u64_from_any")]
    pub account_id: u64,
    pub server: String,
    pub size: Decimal,
    pub password_enc: String,
    #[serde(deserialize_with = "string_from_any")]
    pub key_version: String,
    #[serde(default)]
    pub fase: Option<u8>,
}

impl PropAccountRow {
    pub fn credentials(&self) -> AccountCredentials {
        AccountCredentials {
            login: self.account_id,
            server: self.server.clone(),
            password_enc: self.password_enc.clone(),
            key_version: self.key_version.clone(),
        }
    }
}

/// Row of `account_broker`: the hedge account, traded as mirror-B.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerAccountRow {
    #[serde(deserialize_with = "u64_from_any")]
    pub account_id: u64,
    pub server: String,
    pub password_enc: String,
    #[serde(deserialize_with = "string_from_any")]
    pub key_version: String,
}

impl BrokerAccountRow {
    pub fn credentials(&self) -> AccountCredentials {
        AccountCredentials {
            login: self.account_id,
            server: self.server.clone(),
            password_enc: self.password_enc.clone(),
            key_version: self.key_version.clone(),
        }
    }
}

/// Logins are stored as text in some tables and as integers in others.
fn u64_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid login {}", n))),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid login {:?}", s))),
        other => Err(serde::de::Error::custom(format!("invalid login {}", other))),
    }
}

fn string_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}
