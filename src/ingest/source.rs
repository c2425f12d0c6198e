use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::normalize_statement;
use crate::error::{AppResult, ReconError};
use crate::ledger::models::{Gateway, GatewayRecord};
use crate::ledger::ReconStore;

/// Where the matcher gets a gateway's statement for a window
#[async_trait]
pub trait StatementSource: Send + Sync {
    async fn fetch(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<GatewayRecord>>;
}

/// Statements previously uploaded through the ingest endpoint
pub struct StoredStatementSource {
    store: Arc<dyn ReconStore>,
}

impl StoredStatementSource {
    pub fn new(store: Arc<dyn ReconStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatementSource for StoredStatementSource {
    async fn fetch(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<GatewayRecord>> {
        self.store
            .gateway_records_in_window(gateway, window_start, window_end)
            .await
    }
}

/// Pulls statements from each gateway's reporting endpoint.
///
/// Gateways without a configured URL are served by `fallback`.
pub struct HttpStatementSource {
    client: Client,
    base_urls: HashMap<Gateway, String>,
    fallback: Option<Arc<dyn StatementSource>>,
}

impl HttpStatementSource {
    pub fn new(
        base_urls: HashMap<Gateway, String>,
        timeout: Duration,
        fallback: Option<Arc<dyn StatementSource>>,
    ) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_urls,
            fallback,
        })
    }

    async fn pull(
        &self,
        gateway: Gateway,
        url: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Value>, String> {
        let response = self
            .client
            .get(url)
            .query(&[
                ("from", window_start.to_rfc3339()),
                ("to", window_end.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("{} responded {}", gateway, response.status()));
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| format!("unreadable statement body: {}", e))
    }
}

#[async_trait]
impl StatementSource for HttpStatementSource {
    async fn fetch(
        &self,
        gateway: Gateway,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> AppResult<Vec<GatewayRecord>> {
        let url = match self.base_urls.get(&gateway) {
            Some(url) => url,
            None => {
                return match &self.fallback {
                    Some(fallback) => fallback.fetch(gateway, window_start, window_end).await,
                    None => Err(ReconError::StatementFetch {
                        gateway,
                        message: "no statement endpoint configured".to_string(),
                    }
                    .into()),
                };
            }
        };

        let lines = self
            .pull(gateway, url, window_start, window_end)
            .await
            .map_err(|message| {
                warn!("Statement pull for {} failed: {}", gateway, message);
                ReconError::StatementFetch { gateway, message }
            })?;

        let records: Vec<GatewayRecord> = normalize_statement(gateway, &lines)?
            .into_iter()
            .filter(|r| r.occurred_at >= window_start && r.occurred_at <= window_end)
            .collect();

        debug!("Pulled {} statement lines for {}", records.len(), gateway);
        Ok(records)
    }
}
