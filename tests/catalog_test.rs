//! The built-in Last Mile catalog exercised end-to-end over in-memory
//! sources: classification ladders, tier boundaries, derived metrics, and
//! the dual-source density path.

use lastmile_features::catalog::{self, ANALYTICS_WH, OPERATIONAL_PG};
use lastmile_features::engine::FeatureEngine;
use lastmile_features::model::{EntityKind, FeatureRequest, Provenance, QualityStatus};
use lastmile_features::source::memory::MemorySource;
use lastmile_features::source::{SourceRow, SourceSet};
use serde_json::json;
use std::sync::Arc;

struct Harness {
    engine: FeatureEngine,
    pg: Arc<MemorySource>,
}

fn row(pairs: &[(&str, serde_json::Value)]) -> SourceRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Catalog registry over in-memory sources. Pass-through resolvers echo
/// their upstream parameter; data-backed resolvers read the fixtures
/// registered here.
fn harness() -> Harness {
    let registry = Arc::new(catalog::lastmile_registry().unwrap());
    let pg = Arc::new(MemorySource::new(OPERATIONAL_PG));
    let wh = Arc::new(MemorySource::new(ANALYTICS_WH));

    for feature in registry.feature_names() {
        for definition in registry.lookup(&feature).unwrap() {
            if let Some(upstream) = definition.requires.first() {
                let source: &MemorySource = if definition.source_id == OPERATIONAL_PG {
                    &pg
                } else {
                    &wh
                };
                source.insert_echo(&definition.statement_template, &[upstream.as_str()]);
            }
        }
    }

    let engine = FeatureEngine::new(registry, SourceSet::new().with(pg.clone()).with(wh));
    Harness { engine, pg }
}

fn density_templates(engine: &FeatureEngine) -> (String, String) {
    let primary = engine.registry().primary("avg_population_density").unwrap();
    (
        primary.prelude.as_ref().unwrap().statement_template.clone(),
        primary.statement_template.clone(),
    )
}

fn seed_density(harness: &Harness, density: f64) {
    let (prelude, main) = density_templates(&harness.engine);
    harness
        .pg
        .insert_rows(&prelude, vec![row(&[("outcode", json!("EC1A"))])]);
    harness
        .pg
        .insert_rows(&main, vec![row(&[("avg_population_density", json!(density))])]);
}

#[tokio::test]
async fn test_flat_rule_outranks_house_rule() {
    let harness = harness();
    let template = harness
        .engine
        .registry()
        .primary("destination_building_type")
        .unwrap()
        .statement_template
        .clone();
    harness.pg.insert_rows(
        &template,
        vec![row(&[(
            "destination_address",
            json!("Flat 2, Rose House, 14 Elm Street"),
        )])],
    );

    let outcome = harness
        .engine
        .resolve(
            FeatureRequest::new(EntityKind::Shipment, "shp-100")
                .with_feature("destination_building_type"),
        )
        .await;
    let building = outcome.get("destination_building_type").unwrap();
    assert_eq!(building.value, json!("flat"));
    assert_eq!(building.quality, QualityStatus::Complete);
}

#[tokio::test]
async fn test_density_tier_boundaries_are_inclusive() {
    for (density, expected) in [(5_000.0, "high"), (4_999.99, "medium"), (999.0, "low")] {
        let harness = harness();
        seed_density(&harness, density);

        let outcome = harness
            .engine
            .resolve(
                FeatureRequest::new(EntityKind::Route, "route-7421").with_feature("density_tier"),
            )
            .await;
        assert!(outcome.is_complete(), "density {} failed: {:?}", density, outcome.errors);
        assert_eq!(
            outcome.get("density_tier").unwrap().value,
            json!(expected),
            "density {}",
            density
        );
    }
}

#[tokio::test]
async fn test_density_default_feeds_dependent_features() {
    // No density fixtures anywhere: the resolver chain exhausts and the
    // declared default applies, visibly degraded.
    let harness = harness();
    let (prelude, _) = density_templates(&harness.engine);
    harness
        .pg
        .insert_rows(&prelude, vec![row(&[("outcode", json!("EC1A"))])]);

    let outcome = harness
        .engine
        .resolve(
            FeatureRequest::new(EntityKind::Route, "route-7421")
                .with_features(&["avg_population_density", "density_tier"]),
        )
        .await;

    let density = outcome.get("avg_population_density").unwrap();
    assert_eq!(density.value, json!(2500.0));
    assert_eq!(density.provenance, Provenance::Default);
    assert_eq!(density.quality, QualityStatus::Defaulted);

    // The dependent tier consumes the defaulted value cleanly.
    assert_eq!(outcome.get("density_tier").unwrap().value, json!("medium"));
}

#[tokio::test]
async fn test_estimated_delay_derives_from_density() {
    let harness = harness();
    seed_density(&harness, 8_200.0);

    let outcome = harness
        .engine
        .resolve(
            FeatureRequest::new(EntityKind::Route, "route-7421")
                .with_feature("estimated_handover_delay_seconds"),
        )
        .await;
    assert!(outcome.is_complete(), "{:?}", outcome.errors);
    // 8200 * 0.012 + 90 = 188.4
    let delay = outcome
        .get("estimated_handover_delay_seconds")
        .unwrap()
        .value
        .as_f64()
        .unwrap();
    assert!((delay - 188.4).abs() < 1e-9, "delay {}", delay);
}

#[tokio::test]
async fn test_courier_experience_tiering_and_route_cap() {
    let harness = harness();
    let template = harness
        .engine
        .registry()
        .primary("courier_route_index")
        .unwrap()
        .statement_template
        .clone();
    harness
        .pg
        .insert_rows(&template, vec![row(&[("route_count", json!(250))])]);

    let outcome = harness
        .engine
        .resolve(
            FeatureRequest::new(EntityKind::Courier, "courier-112")
                .with_features(&["courier_route_index", "courier_experience_level"]),
        )
        .await;
    assert!(outcome.is_complete(), "{:?}", outcome.errors);
    // Lifetime count capped at 100, which tiers as experienced.
    assert_eq!(outcome.get("courier_route_index").unwrap().value, json!(100.0));
    assert_eq!(
        outcome.get("courier_experience_level").unwrap().value,
        json!("experienced")
    );
}

#[tokio::test]
async fn test_vehicle_type_classification() {
    let harness = harness();
    let template = harness
        .engine
        .registry()
        .primary("courier_transport_vehicle_type")
        .unwrap()
        .statement_template
        .clone();
    harness.pg.insert_rows(
        &template,
        vec![row(&[("transport_type", json!("Electric Moped"))])],
    );

    let outcome = harness
        .engine
        .resolve(
            FeatureRequest::new(EntityKind::Courier, "courier-112")
                .with_feature("courier_transport_vehicle_type"),
        )
        .await;
    assert_eq!(
        outcome.get("courier_transport_vehicle_type").unwrap().value,
        json!("moped")
    );
}

#[tokio::test]
async fn test_route_composition_projects_all_columns() {
    let harness = harness();
    let template = harness
        .engine
        .registry()
        .primary("route_composition")
        .unwrap()
        .statement_template
        .clone();
    harness.pg.insert_rows(
        &template,
        vec![row(&[
            ("composition_total_shipments", json!(86)),
            ("composition_count_containers", json!(5)),
            ("composition_count_loose_shipments", json!(11)),
        ])],
    );

    let outcome = harness
        .engine
        .resolve(
            FeatureRequest::new(EntityKind::Route, "route-7421").with_feature("route_composition"),
        )
        .await;
    let composition = outcome.get("route_composition").unwrap();
    assert_eq!(
        composition.value,
        json!({
            "composition_total_shipments": 86,
            "composition_count_containers": 5,
            "composition_count_loose_shipments": 11,
        })
    );
    assert_eq!(composition.quality, QualityStatus::Complete);
}

#[tokio::test]
async fn test_handover_complexity_chains_two_derived_features() {
    let harness = harness();
    let template = harness
        .engine
        .registry()
        .primary("destination_building_type")
        .unwrap()
        .statement_template
        .clone();
    harness.pg.insert_rows(
        &template,
        vec![row(&[("destination_address", json!("Apt 9, Birch Court"))])],
    );

    let outcome = harness
        .engine
        .resolve(
            FeatureRequest::new(EntityKind::Shipment, "shp-100")
                .with_feature("building_type_handover_complexity"),
        )
        .await;
    assert!(outcome.is_complete(), "{:?}", outcome.errors);
    assert_eq!(
        outcome.get("building_type_handover_complexity").unwrap().value,
        json!("high")
    );
    // Only the requested feature is reported; the upstream stays cached.
    assert!(outcome.get("destination_building_type").is_none());
    assert_eq!(harness.engine.cache().len(), 2);
}
