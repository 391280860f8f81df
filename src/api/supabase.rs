//! Minimal PostgREST client shared by the signal log and the tenant directory.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a Supabase project's REST endpoint.
#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    /// `GET /rest/v1/{table}` with PostgREST filter parameters.
    pub async fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<T>> {
        debug!(table, ?query, "Selecting rows");

        let response = self
            .authorized(self.http.get(self.table_url(table)))
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to query {}", table))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Select on {} failed: {} - {}", table, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} rows", table))
    }

    /// Exactly one row or an error.
    pub async fn select_single<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> Result<T> {
        let mut rows: Vec<T> = self.select(table, query).await?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            n => anyhow::bail!("Expected one row in {}, found {}", table, n),
        }
    }

    pub async fn insert<B: Serialize + ?Sized>(&self, table: &str, row: &B) -> Result<()> {
        let response = self
            .authorized(self.http.post(self.table_url(table)))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .with_context(|| format!("Failed to insert into {}", table))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Insert into {} failed: {} - {}", table, status, body);
        }
        Ok(())
    }

    pub async fn update<B: Serialize + ?Sized>(&self, table: &str, query: &[(&str, String)], patch: &B) -> Result<()> {
        let response = self
            .authorized(self.http.patch(self.table_url(table)))
            .header("Prefer", "return=minimal")
            .query(query)
            .json(patch)
            .send()
            .await
            .with_context(|| format!("Failed to update {}", table))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Update of {} failed: {} - {}", table, status, body);
        }
        Ok(())
    }
}

/// PostgREST equality filter value.
pub fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}
