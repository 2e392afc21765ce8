use lastmile_features::catalog::{self, ANALYTICS_WH, OPERATIONAL_PG};
use lastmile_features::config;
use lastmile_features::engine::FeatureEngine;
use lastmile_features::model::{EntityKind, FeatureRequest};
use lastmile_features::observability::logger;
use lastmile_features::registry::ResolverRegistry;
use lastmile_features::source::{MemorySource, SourceRow, SourceSet};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "lastmile-features")]
#[command(about = "Request-time feature resolution engine for last-mile delivery")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered features and their resolver chains
    Catalog {
        /// Resolver definition file (JSON); defaults to the built-in catalog
        #[arg(long)]
        definitions: Option<PathBuf>,
    },
    /// Resolve features for one entity
    Resolve {
        /// Entity type: shipment | route | courier | address
        entity_type: String,

        /// Canonical entity identifier
        entity_id: String,

        /// Feature names to resolve
        #[arg(required = true)]
        features: Vec<String>,

        /// Resolver definition file (JSON); defaults to the built-in catalog
        #[arg(long)]
        definitions: Option<PathBuf>,

        /// Use in-memory demo sources instead of configured stores
        #[arg(long)]
        demo: bool,

        /// End-to-end request deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Maximum acceptable cached age in milliseconds
        #[arg(long)]
        staleness_ms: Option<u64>,

        /// Extra entity keys as name=value (e.g. collection_pitstop_postcode=EC1A1BB)
        #[arg(long = "key")]
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logger::init_tracing();

    let args = Args::parse();
    match args.command {
        Commands::Catalog { definitions } => {
            let registry = build_registry(definitions.as_deref())?;
            print_catalog(&registry);
            Ok(())
        }
        Commands::Resolve {
            entity_type,
            entity_id,
            features,
            definitions,
            demo,
            timeout_ms,
            staleness_ms,
            keys,
        } => {
            let registry = Arc::new(build_registry(definitions.as_deref())?);
            let sources = if demo {
                demo_sources(&registry)
            } else {
                config::sources_from_env().await?
            };

            let engine = FeatureEngine::new(Arc::clone(&registry), sources);
            let mut request = FeatureRequest::new(parse_entity(&entity_type)?, entity_id);
            for feature in &features {
                request = request.with_feature(feature.as_str());
            }
            for key in &keys {
                let (name, value) = key
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--key expects name=value, got '{}'", key))?;
                request = request.with_key(name, value);
            }
            if let Some(ms) = timeout_ms {
                request = request.with_timeout_ms(ms);
            }
            if let Some(ms) = staleness_ms {
                request = request.with_staleness_tolerance_ms(ms);
            }

            info!(request_id = %request.request_id, "resolving");
            let outcome = engine.resolve(request).await;

            let mut resolved = serde_json::Map::new();
            for (feature, value) in &outcome.features {
                resolved.insert(
                    feature.clone(),
                    json!({
                        "value": value.value,
                        "provenance": value.provenance,
                        "quality_status": value.quality,
                        "resolved_at": value.resolved_at.to_rfc3339(),
                    }),
                );
            }
            let errors: serde_json::Map<String, serde_json::Value> = outcome
                .errors
                .iter()
                .map(|(feature, err)| (feature.clone(), json!(err.to_string())))
                .collect();

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "features": resolved,
                    "errors": errors,
                }))?
            );

            if !outcome.errors.is_empty() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn build_registry(definitions: Option<&std::path::Path>) -> Result<ResolverRegistry> {
    match definitions {
        Some(path) => Ok(config::registry_from_file(path)?),
        None => Ok(catalog::lastmile_registry()?),
    }
}

fn parse_entity(entity_type: &str) -> Result<EntityKind> {
    match entity_type.to_ascii_lowercase().as_str() {
        "shipment" => Ok(EntityKind::Shipment),
        "route" => Ok(EntityKind::Route),
        "courier" => Ok(EntityKind::Courier),
        "address" => Ok(EntityKind::Address),
        other => Err(anyhow!(
            "unknown entity type '{}'; expected shipment | route | courier | address",
            other
        )),
    }
}

fn print_catalog(registry: &ResolverRegistry) {
    for feature in registry.feature_names() {
        let chain = registry.lookup(&feature).expect("listed feature resolves");
        let entity = chain[0].entity.as_str();
        println!("{} ({})", feature, entity);
        for definition in chain {
            let default = definition
                .default_value
                .as_ref()
                .map(|v| format!(", default {}", v))
                .unwrap_or_default();
            println!(
                "  [{}] {} timeout {}ms, ttl {}ms{}",
                definition.priority,
                definition.source_id,
                definition.timeout_ms,
                definition.cache_ttl_ms,
                default
            );
        }
    }
}

/// Seed in-memory sources with a small demo dataset so `resolve --demo`
/// exercises the full pipeline without a database. Fixture keys reuse the
/// registry's own statement templates.
fn demo_sources(registry: &ResolverRegistry) -> SourceSet {
    let pg = Arc::new(MemorySource::new(OPERATIONAL_PG));
    let wh = Arc::new(MemorySource::new(ANALYTICS_WH));

    let row = |pairs: &[(&str, serde_json::Value)]| -> SourceRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    };

    for feature in registry.feature_names() {
        let chain = registry.lookup(&feature).expect("listed feature resolves");
        for definition in chain {
            let source: &MemorySource = if definition.source_id == OPERATIONAL_PG {
                &pg
            } else {
                &wh
            };

            // Pass-through resolvers echo their upstream parameter.
            if let Some(upstream) = definition.requires.first() {
                source.insert_echo(&definition.statement_template, &[upstream.as_str()]);
                continue;
            }

            if let Some(prelude) = &definition.prelude {
                pg.insert_rows(
                    &prelude.statement_template,
                    vec![row(&[("outcode", json!("EC1A"))])],
                );
            }

            let rows = match definition.feature.as_str() {
                "avg_population_density" => vec![row(&[("avg_population_density", json!(8200.0))])],
                "route_composition" => vec![row(&[
                    ("composition_total_shipments", json!(86)),
                    ("composition_count_containers", json!(5)),
                    ("composition_count_loose_shipments", json!(11)),
                ])],
                "courier_transport_vehicle_type" => {
                    vec![row(&[("transport_type", json!("Electric Moped"))])]
                }
                "courier_route_index" => vec![row(&[("route_count", json!(63))])],
                "destination_building_type" => vec![row(&[(
                    "destination_address",
                    json!("Flat 2, Rose House, 14 Elm Street"),
                )])],
                "estimated_floor_number" => {
                    vec![row(&[("estimated_floor_number", json!(3))])]
                }
                "remaining_parcels_burden" => {
                    vec![row(&[("remaining_parcels_burden", json!(14))])]
                }
                "time_of_day" => vec![row(&[("time_of_day", json!(18))])],
                _ => Vec::new(),
            };
            source.insert_rows(&definition.statement_template, rows);
        }
    }

    SourceSet::new().with(pg).with(wh)
}
