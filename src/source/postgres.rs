//! Operational Store Client (PostgreSQL)
//!
//! Low-latency point lookups against the operational database via sqlx.
//! This is the primary source for most resolvers.

use crate::binder::{BoundQuery, ParamValue};
use crate::error::{FeatureError, Result};
use crate::source::{SourceClient, SourceResult, SourceRow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::time::{Duration, Instant};
use tracing::warn;

pub struct PostgresSource {
    source_id: String,
    pool: PgPool,
}

impl PostgresSource {
    pub fn new(source_id: impl Into<String>, pool: PgPool) -> Self {
        Self {
            source_id: source_id.into(),
            pool,
        }
    }

    /// Connect a pool and probe it.
    pub async fn connect(source_id: impl Into<String>, database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| FeatureError::SourceConnection(format!("postgres connect: {}", e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| FeatureError::SourceConnection(format!("postgres probe: {}", e)))?;

        Ok(Self::new(source_id, pool))
    }

    /// Connect from `DATABASE_URL`.
    pub async fn from_env(source_id: impl Into<String>) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| {
            FeatureError::Configuration("DATABASE_URL is not set".to_string())
        })?;
        Self::connect(source_id, &database_url).await
    }

    fn map_sqlx_error(&self, err: sqlx::Error) -> FeatureError {
        match err {
            sqlx::Error::Io(e) => FeatureError::SourceConnection(format!("postgres io: {}", e)),
            sqlx::Error::PoolTimedOut => {
                FeatureError::SourceConnection("postgres pool timed out".to_string())
            }
            sqlx::Error::PoolClosed => {
                FeatureError::SourceConnection("postgres pool closed".to_string())
            }
            other => FeatureError::SourceQuery(format!("postgres query: {}", other)),
        }
    }
}

#[async_trait]
impl SourceClient for PostgresSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn execute(&self, query: &BoundQuery, timeout: Duration) -> Result<SourceResult> {
        let started = Instant::now();

        let mut prepared = sqlx::query(&query.statement);
        for param in &query.params {
            prepared = match param {
                ParamValue::Text(s) => prepared.bind(s.clone()),
                ParamValue::Integer(i) => prepared.bind(*i),
                ParamValue::Float(f) => prepared.bind(*f),
                ParamValue::Boolean(b) => prepared.bind(*b),
            };
        }

        let rows = tokio::time::timeout(timeout, prepared.fetch_all(&self.pool))
            .await
            .map_err(|_| FeatureError::SourceTimeout {
                source_name: self.source_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| self.map_sqlx_error(e))?;

        let rows = rows.iter().map(decode_row).collect();

        Ok(SourceResult {
            source_id: self.source_id.clone(),
            rows,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(sqlx::query("SELECT 1").execute(&self.pool).await.is_ok())
    }
}

fn decode_row(row: &PgRow) -> SourceRow {
    let mut decoded = SourceRow::new();
    for column in row.columns() {
        let name = column.name();
        let value = match column.type_info().name() {
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => row
                .try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(Value::String),
            "INT2" => row
                .try_get::<Option<i16>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::from(v as i64)),
            "INT4" => row
                .try_get::<Option<i32>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::from(v as i64)),
            "INT8" => row
                .try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(name)
                .ok()
                .flatten()
                .and_then(|v| serde_json::Number::from_f64(v as f64).map(Value::Number)),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(name)
                .ok()
                .flatten()
                .and_then(|v| serde_json::Number::from_f64(v).map(Value::Number)),
            "BOOL" => row
                .try_get::<Option<bool>, _>(name)
                .ok()
                .flatten()
                .map(Value::Bool),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_rfc3339())),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string())),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string())),
            other => {
                warn!(column = name, pg_type = other, "undecodable column type, emitting null");
                None
            }
        };
        decoded.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    decoded
}
