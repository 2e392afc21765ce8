//! Analytical Warehouse Client
//!
//! Client for the warehouse's REST statement API: submit a parameterized
//! statement, then follow `nextUri` pages until the result set is drained.
//! Higher latency than the operational store; used for aggregate features
//! and as the fallback for operational resolvers.

use crate::binder::{BoundQuery, ParamValue};
use crate::error::{FeatureError, Result};
use crate::source::{SourceClient, SourceResult, SourceRow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::warn;

pub struct WarehouseSource {
    source_id: String,
    base_url: String,
    user: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(rename = "nextUri")]
    next_uri: Option<String>,
    columns: Option<Vec<WarehouseColumn>>,
    data: Option<Vec<Vec<Value>>>,
    error: Option<WarehouseError>,
}

#[derive(Debug, Deserialize)]
struct WarehouseColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WarehouseError {
    message: String,
    #[serde(rename = "errorCode")]
    error_code: Option<u32>,
}

impl WarehouseSource {
    pub fn new(source_id: impl Into<String>, base_url: String, user: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build warehouse HTTP client");

        Self {
            source_id: source_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            client,
        }
    }

    /// Construct from `WAREHOUSE_URL` / `WAREHOUSE_USER`.
    pub fn from_env(source_id: impl Into<String>) -> Self {
        let base_url =
            std::env::var("WAREHOUSE_URL").unwrap_or_else(|_| "http://localhost:8081".to_string());
        let user = std::env::var("WAREHOUSE_USER").unwrap_or_else(|_| "features".to_string());
        Self::new(source_id, base_url, user)
    }

    async fn submit(&self, query: &BoundQuery) -> Result<StatementResponse> {
        let url = format!("{}/v1/statement", self.base_url);
        let body = StatementRequest {
            statement: &query.statement,
            params: query.params.iter().map(ParamValue::as_json).collect(),
        };

        let response = self
            .client
            .post(&url)
            .header("X-Warehouse-User", &self.user)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error("submit", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FeatureError::SourceQuery(format!(
                "warehouse submit failed with status {}: {}",
                status, text
            )));
        }

        let parsed: StatementResponse = response
            .json()
            .await
            .map_err(|e| FeatureError::SourceQuery(format!("warehouse response parse: {}", e)))?;
        self.check_body_error(&parsed)?;
        Ok(parsed)
    }

    async fn fetch_page(&self, next_uri: &str) -> Result<StatementResponse> {
        let url = if next_uri.starts_with("http") {
            next_uri.to_string()
        } else {
            format!("{}{}", self.base_url, next_uri)
        };

        let response = self
            .client
            .get(&url)
            .header("X-Warehouse-User", &self.user)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error("fetch", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FeatureError::SourceQuery(format!(
                "warehouse fetch failed with status {}: {}",
                status, text
            )));
        }

        let parsed: StatementResponse = response
            .json()
            .await
            .map_err(|e| FeatureError::SourceQuery(format!("warehouse page parse: {}", e)))?;
        self.check_body_error(&parsed)?;
        Ok(parsed)
    }

    fn check_body_error(&self, response: &StatementResponse) -> Result<()> {
        if let Some(error) = &response.error {
            return Err(FeatureError::SourceQuery(format!(
                "warehouse error: {} (code: {:?})",
                error.message, error.error_code
            )));
        }
        Ok(())
    }

    fn map_reqwest_error(&self, stage: &str, err: reqwest::Error) -> FeatureError {
        if err.is_connect() || err.is_timeout() {
            FeatureError::SourceConnection(format!("warehouse {}: {}", stage, err))
        } else {
            FeatureError::SourceQuery(format!("warehouse {}: {}", stage, err))
        }
    }

    async fn run(&self, query: &BoundQuery) -> Result<Vec<SourceRow>> {
        let mut columns: Option<Vec<WarehouseColumn>> = None;
        let mut data: Vec<Vec<Value>> = Vec::new();

        let mut response = self.submit(query).await?;
        loop {
            if columns.is_none() {
                columns = response.columns.take();
            }
            if let Some(page) = response.data.take() {
                data.extend(page);
            }
            match response.next_uri.take() {
                Some(next_uri) => response = self.fetch_page(&next_uri).await?,
                None => break,
            }
        }

        let Some(columns) = columns else {
            if !data.is_empty() {
                warn!(source = %self.source_id, "warehouse returned data without columns");
            }
            return Ok(Vec::new());
        };

        let rows = data
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .zip(row.into_iter())
                    .map(|(column, value)| (column.name.clone(), value))
                    .collect()
            })
            .collect();
        Ok(rows)
    }
}

#[async_trait]
impl SourceClient for WarehouseSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn execute(&self, query: &BoundQuery, timeout: Duration) -> Result<SourceResult> {
        let started = Instant::now();

        let rows = tokio::time::timeout(timeout, self.run(query))
            .await
            .map_err(|_| FeatureError::SourceTimeout {
                source_name: self.source_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        Ok(SourceResult {
            source_id: self.source_id.clone(),
            rows,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1/info", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
