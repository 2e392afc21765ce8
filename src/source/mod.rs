//! Source Client Abstraction
//!
//! A uniform async interface over heterogeneous backing stores. Concrete
//! clients wrap the operational Postgres store, the analytical warehouse's
//! REST statement API, and an in-memory fixture store for tests and demos.
//! The router never knows which concrete store answered.

pub mod memory;
pub mod postgres;
pub mod warehouse;

pub use memory::MemorySource;
pub use postgres::PostgresSource;
pub use warehouse::WarehouseSource;

use crate::binder::BoundQuery;
use crate::error::{FeatureError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One result row: column name to JSON value.
pub type SourceRow = HashMap<String, Value>;

/// Rows returned by one execution attempt, tagged with the answering source
/// and the latency observed.
#[derive(Debug, Clone)]
pub struct SourceResult {
    pub source_id: String,
    pub rows: Vec<SourceRow>,
    pub latency_ms: u64,
}

/// Contract every backing store client implements.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Source identifier resolver definitions refer to.
    fn source_id(&self) -> &str;

    /// Execute a bound statement under the given timeout.
    async fn execute(&self, query: &BoundQuery, timeout: Duration) -> Result<SourceResult>;

    /// Whether the backing store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

/// The set of configured source clients, keyed by source id.
#[derive(Default, Clone)]
pub struct SourceSet {
    clients: HashMap<String, Arc<dyn SourceClient>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn SourceClient>) {
        self.clients.insert(client.source_id().to_string(), client);
    }

    pub fn with(mut self, client: Arc<dyn SourceClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, source_id: &str) -> Result<Arc<dyn SourceClient>> {
        self.clients.get(source_id).cloned().ok_or_else(|| {
            FeatureError::Configuration(format!("no client registered for source '{}'", source_id))
        })
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }
}
