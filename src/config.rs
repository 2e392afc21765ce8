//! Configuration Loading
//!
//! Resolver definitions arrive already structured (JSON records from the
//! configuration collaborator); this module deserializes them into a
//! registry and wires source clients from environment variables.

use crate::catalog::{ANALYTICS_WH, OPERATIONAL_PG};
use crate::error::Result;
use crate::registry::{RegistryBuilder, ResolverDefinition, ResolverRegistry};
use crate::source::{PostgresSource, SourceSet, WarehouseSource};
use std::path::Path;
use std::sync::Arc;

/// Load resolver definition records from a JSON file.
pub fn load_definitions(path: &Path) -> Result<Vec<ResolverDefinition>> {
    let text = std::fs::read_to_string(path)?;
    let definitions: Vec<ResolverDefinition> = serde_json::from_str(&text)?;
    Ok(definitions)
}

/// Build a registry from a definition file.
pub fn registry_from_file(path: &Path) -> Result<ResolverRegistry> {
    let mut builder = RegistryBuilder::new();
    builder.register_all(load_definitions(path)?)?;
    builder.build()
}

/// Wire the production source clients from the environment:
/// `DATABASE_URL` for the operational store, `WAREHOUSE_URL` /
/// `WAREHOUSE_USER` for the analytical warehouse.
pub async fn sources_from_env() -> Result<SourceSet> {
    let mut sources = SourceSet::new();
    sources.register(Arc::new(PostgresSource::from_env(OPERATIONAL_PG).await?));
    sources.register(Arc::new(WarehouseSource::from_env(ANALYTICS_WH)));
    Ok(sources)
}
