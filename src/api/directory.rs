//! Tenant directory: which tenant this deployment serves, their phase and credentials.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::supabase::{eq, SupabaseClient};
use super::types::{BrokerAccountRow, ProfileRow, PropAccountRow, VpsRow};
use crate::connectivity::ConnectivityMonitor;
use crate::models::{Phase, Tenant, TenantProfile, TradingStatus};

const IP_DISCOVERY_URL: &str = "https://api.ipify.org";

/// The store was known to be unreachable; no request was sent.
#[derive(Debug, Error)]
#[error("remote store offline, {0} skipped")]
pub struct StoreOffline(pub &'static str);

/// Source of tenant assignment and trading permission.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Tenant assigned to this deployment, `None` if unassigned.
    async fn resolve_tenant(&self) -> Result<Option<Tenant>>;

    /// Phase, account size and credentials, always read fresh.
    async fn load_profile(&self, tenant: &Tenant) -> Result<TenantProfile>;

    /// Never reports `Disabled` because of a network problem.
    async fn is_trading_enabled(&self, tenant: &Tenant) -> TradingStatus;

    async fn set_trading_enabled(&self, tenant: &Tenant, enabled: bool) -> Result<()>;
}

/// Directory backed by the `vps`, `profiles`, `account_prop` and
/// `account_broker` tables.
pub struct SupabaseDirectory {
    client: SupabaseClient,
    connectivity: ConnectivityMonitor,
    http: Client,
    deployment_ip: Mutex<Option<String>>,
}

impl SupabaseDirectory {
    /// `deployment_ip` overrides public-IP discovery.
    pub fn new(client: SupabaseClient, connectivity: ConnectivityMonitor, deployment_ip: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            connectivity,
            http,
            deployment_ip: Mutex::new(deployment_ip),
        })
    }

    fn ensure_online(&self, what: &'static str) -> Result<()> {
        if self.connectivity.is_online() {
            return Ok(());
        }
        self.connectivity.warn_offline(what);
        Err(StoreOffline(what).into())
    }

    async fn deployment_ip(&self) -> Result<String> {
        let mut cached = self.deployment_ip.lock().await;
        if let Some(ip) = cached.as_ref() {
            return Ok(ip.clone());
        }

        let ip = discover_public_ip(&self.http).await?;
        info!(ip = %ip, "Discovered deployment IP");
        *cached = Some(ip.clone());
        Ok(ip)
    }
}

/// Public IP of this host as seen from the internet.
pub async fn discover_public_ip(http: &Client) -> Result<String> {
    let response = http
        .get(IP_DISCOVERY_URL)
        .send()
        .await
        .context("Failed to reach IP discovery service")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("IP discovery failed: {} - {}", status, body);
    }

    let ip = response.text().await.context("Failed to read IP")?;
    Ok(ip.trim().to_string())
}

/// Map a stored phase number, rejecting unknown ones.
fn parse_phase(fase: Option<u8>) -> Result<Phase> {
    let number = fase.unwrap_or(1);
    Phase::try_from(number).map_err(|e| anyhow::anyhow!(e))
}

#[async_trait]
impl TenantDirectory for SupabaseDirectory {
    async fn resolve_tenant(&self) -> Result<Option<Tenant>> {
        if !self.connectivity.is_online() {
            self.connectivity.warn_offline("resolve tenant");
            return Ok(None);
        }

        let ip = self.deployment_ip().await?;
        let vps: Vec<VpsRow> = self.client.select("vps", &[("select", "id".to_string()), ("IP", eq(&ip))]).await?;
        let Some(vps) = vps.first() else {
            debug!(ip = %ip, "No VPS registered for this IP");
            return Ok(None);
        };

        let profiles: Vec<ProfileRow> = self
            .client
            .select(
                "profiles",
                &[("select", "id,started_trading".to_string()), ("vps_id", eq(vps.id))],
            )
            .await?;

        Ok(profiles.into_iter().next().map(|p| Tenant { user_id: p.id }))
    }

    async fn load_profile(&self, tenant: &Tenant) -> Result<TenantProfile> {
        self.ensure_online("load profile")?;

        let prop: PropAccountRow = self
            .client
            .select_single(
                "account_prop",
                &[
                    ("select", "id,account_id,server,size,password_enc,key_version,fase".to_string()),
                    ("user_id", eq(&tenant.user_id)),
                ],
            )
            .await
            .context("Failed to load prop account")?;

        let broker: BrokerAccountRow = self
            .client
            .select_single(
                "account_broker",
                &[
                    ("select", "account_id,server,password_enc,key_version".to_string()),
                    ("user_id", eq(&tenant.user_id)),
                ],
            )
            .await
            .context("Failed to load broker account")?;

        let phase = parse_phase(prop.fase)?;

        info!(
            user_id = %tenant.user_id,
            mirror_a = prop.account_id,
            mirror_b = broker.account_id,
            %phase,
            size = %prop.size,
            "Profile loaded"
        );

        Ok(TenantProfile {
            user_id: tenant.user_id.clone(),
            seed: prop.id,
            phase,
            account_size: prop.size,
            mirror_a: prop.credentials(),
            mirror_b: broker.credentials(),
        })
    }

    async fn is_trading_enabled(&self, tenant: &Tenant) -> TradingStatus {
        if !self.connectivity.is_online() {
            self.connectivity.warn_offline("trading-enabled check");
            return TradingStatus::Unknown;
        }

        let rows: Result<Vec<ProfileRow>> = self
            .client
            .select(
                "profiles",
                &[("select", "id,started_trading".to_string()), ("id", eq(&tenant.user_id))],
            )
            .await;

        match rows {
            Ok(rows) => match rows.first() {
                Some(ProfileRow { started_trading: Some(true), .. }) => TradingStatus::Enabled,
                Some(_) => TradingStatus::Disabled,
                None => {
                    warn!(user_id = %tenant.user_id, "Profile not found");
                    TradingStatus::Disabled
                }
            },
            Err(e) => {
                warn!(user_id = %tenant.user_id, error = %e, "Trading-enabled check failed");
                TradingStatus::Unknown
            }
        }
    }

    async fn set_trading_enabled(&self, tenant: &Tenant, enabled: bool) -> Result<()> {
        self.ensure_online("update trading flag")?;

        self.client
            .update(
                "profiles",
                &[("id", eq(&tenant.user_id))],
                &serde_json::json!({ "started_trading": enabled }),
            )
            .await?;

        info!(user_id = %tenant.user_id, enabled, "Trading flag updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_phase() {
        assert_eq!(parse_phase(None).unwrap(), Phase::One);
        assert_eq!(parse_phase(Some(4)).unwrap(), Phase::Four);
        assert!(parse_phase(Some(9)).is_err());
    }

    #[tokio::test]
    async fn test_offline_status_is_unknown() {
        let connectivity = ConnectivityMonitor::new(Duration::from_secs(5));
        connectivity.set_online(false);
        let client = SupabaseClient::new("http://127.0.0.1:1", "key").unwrap();
        let directory = SupabaseDirectory::new(client, connectivity, Some("10.0.0.1".into())).unwrap();
        let tenant = Tenant { user_id: "u1".into() };

        assert_eq!(directory.is_trading_enabled(&tenant).await, TradingStatus::Unknown);
        assert_eq!(directory.resolve_tenant().await.unwrap(), None);

        let err = directory.load_profile(&tenant).await.unwrap_err();
        assert!(err.downcast_ref::<StoreOffline>().is_some());
        let err = directory.set_trading_enabled(&tenant, false).await.unwrap_err();
        assert!(err.downcast_ref::<StoreOffline>().is_some());
    }
}
