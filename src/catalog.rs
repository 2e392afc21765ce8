//! Last Mile Feature Catalog
//!
//! The built-in resolver definitions for the Last Mile Durations model:
//! courier, route, and shipment features with their sources, fallbacks,
//! classification ladders, tier boundaries, and declared defaults.

use crate::error::Result;
use crate::model::EntityKind;
use crate::postprocess::{
    ClassificationRule, DerivationStep, MetricExpr, TierBoundary, TierDirection,
};
use crate::registry::{
    Cardinality, ParamKind, ParamSpec, PreludeQuery, RegistryBuilder, ResolverDefinition,
    ResolverRegistry, RowPredicate,
};
use serde_json::json;

/// Operational relational store: low-latency point lookups.
pub const OPERATIONAL_PG: &str = "operational_pg";
/// Analytical warehouse: slower aggregates, used as fallback when the
/// operational store has operational issues.
pub const ANALYTICS_WH: &str = "analytics_wh";

const HOUR_MS: u64 = 3_600_000;
const FIVE_MINUTES_MS: u64 = 300_000;

fn rule(pattern: &str, category: &str) -> ClassificationRule {
    ClassificationRule {
        pattern: pattern.to_string(),
        category: category.to_string(),
    }
}

fn not_null(column: &str) -> RowPredicate {
    RowPredicate::NotNull {
        column: column.to_string(),
    }
}

fn float_param(name: &str) -> ParamSpec {
    ParamSpec {
        name: name.to_string(),
        kind: ParamKind::Float,
    }
}

fn base(
    feature: &str,
    entity: EntityKind,
    source_id: &str,
    priority: u32,
    template: &str,
    output_columns: &[&str],
) -> ResolverDefinition {
    ResolverDefinition {
        feature: feature.to_string(),
        entity,
        source_id: source_id.to_string(),
        priority,
        statement_template: template.to_string(),
        params: vec![ParamSpec::text(entity.key_column())],
        output_columns: output_columns.iter().map(|c| c.to_string()).collect(),
        cardinality: Cardinality::One,
        quality_predicates: Vec::new(),
        timeout_ms: 250,
        cache_ttl_ms: FIVE_MINUTES_MS,
        default_value: None,
        requires: Vec::new(),
        prelude: None,
        derive: Vec::new(),
    }
}

/// A derivation-only resolver: the statement round-trips an upstream value
/// through the store so the derived feature keeps a normal attempt,
/// provenance, and TTL.
fn pass_through(
    feature: &str,
    entity: EntityKind,
    upstream: &str,
    derive: Vec<DerivationStep>,
    output_columns: &[&str],
) -> ResolverDefinition {
    let mut definition = base(
        feature,
        entity,
        OPERATIONAL_PG,
        0,
        &format!("SELECT :{}::float8 AS {}", upstream, upstream),
        output_columns,
    );
    definition.params = vec![float_param(upstream)];
    definition.requires = vec![upstream.to_string()];
    definition.derive = derive;
    definition
}

fn courier_definitions() -> Vec<ResolverDefinition> {
    let mut definitions = Vec::new();

    let mut vehicle = base(
        "courier_transport_vehicle_type",
        EntityKind::Courier,
        OPERATIONAL_PG,
        0,
        "SELECT transport_type FROM couriers WHERE courier_uid = :courier_uid AND deleted_at IS NULL",
        &["courier_transport_vehicle_type"],
    );
    vehicle.quality_predicates = vec![not_null("transport_type")];
    vehicle.cache_ttl_ms = HOUR_MS;
    vehicle.default_value = Some(json!("car"));
    vehicle.derive = vec![DerivationStep::Classify {
        input: "transport_type".to_string(),
        output: "courier_transport_vehicle_type".to_string(),
        rules: vec![
            rule(r"(?i)\bvan\b", "van"),
            rule(r"(?i)\be-?bike\b", "ebike"),
            rule(r"(?i)\b(moped|scooter)\b", "moped"),
            rule(r"(?i)\b(car|automobile)\b", "car"),
        ],
        fallback: "car".to_string(),
    }];
    definitions.push(vehicle);

    let mut route_index = base(
        "courier_route_index",
        EntityKind::Courier,
        OPERATIONAL_PG,
        0,
        "SELECT completed_route_count AS route_count FROM courier_stats WHERE courier_uid = :courier_uid",
        &["courier_route_index"],
    );
    route_index.quality_predicates = vec![not_null("route_count")];
    route_index.default_value = Some(json!(0));
    // Route count is capped so a long-tenured courier does not dominate
    // the model input range.
    route_index.derive = vec![DerivationStep::Compute {
        output: "courier_route_index".to_string(),
        expr: MetricExpr::Affine {
            column: "route_count".to_string(),
            scale: 1.0,
            offset: 0.0,
            cap: Some(100.0),
        },
    }];
    definitions.push(route_index);

    let mut route_index_wh = base(
        "courier_route_index",
        EntityKind::Courier,
        ANALYTICS_WH,
        1,
        "SELECT COUNT(DISTINCT route_uid) AS route_count FROM wh_route_assignments WHERE courier_uid = :courier_uid",
        &["courier_route_index"],
    );
    route_index_wh.quality_predicates = vec![not_null("route_count")];
    route_index_wh.timeout_ms = 1_500;
    route_index_wh.derive = definitions.last().unwrap().derive.clone();
    definitions.push(route_index_wh);

    let mut experience = pass_through(
        "courier_experience_level",
        EntityKind::Courier,
        "courier_route_index",
        vec![DerivationStep::Tier {
            input: "courier_route_index".to_string(),
            output: "courier_experience_level".to_string(),
            direction: TierDirection::Descending,
            boundaries: vec![
                TierBoundary {
                    threshold: 50.0,
                    label: "experienced".to_string(),
                },
                TierBoundary {
                    threshold: 10.0,
                    label: "intermediate".to_string(),
                },
            ],
            fallback: "novice".to_string(),
        }],
        &["courier_experience_level"],
    );
    experience.cache_ttl_ms = HOUR_MS;
    definitions.push(experience);

    definitions
}

fn route_definitions() -> Vec<ResolverDefinition> {
    let mut definitions = Vec::new();

    // Primary: operational store, pitstop postcode resolved to an outcode
    // by the prelude stage, then density by outcode.
    let mut density = base(
        "avg_population_density",
        EntityKind::Route,
        OPERATIONAL_PG,
        0,
        "SELECT avg_density AS avg_population_density FROM outcode_population WHERE outcode = :outcode",
        &["avg_population_density"],
    );
    density.params = vec![ParamSpec::text("outcode")];
    density.prelude = Some(PreludeQuery {
        source_id: OPERATIONAL_PG.to_string(),
        statement_template:
            "SELECT p.outcode FROM routes r JOIN pitstops p ON p.pitstop_uid = r.collection_pitstop_uid WHERE r.route_uid = :route_uid"
                .to_string(),
        params: vec![ParamSpec::text("route_uid")],
        output_columns: vec!["outcode".to_string()],
    });
    density.quality_predicates = vec![not_null("avg_population_density")];
    density.cache_ttl_ms = HOUR_MS;
    density.default_value = Some(json!(2500.0));
    definitions.push(density);

    // Fallback: warehouse join. Use only if the operational store has
    // operational issues; higher timeout, same shape.
    let mut density_wh = base(
        "avg_population_density",
        EntityKind::Route,
        ANALYTICS_WH,
        1,
        "SELECT o.avg_density AS avg_population_density FROM wh_routes r JOIN wh_outcode_population o ON o.outcode = r.collection_outcode WHERE r.route_uid = :route_uid",
        &["avg_population_density"],
    );
    density_wh.quality_predicates = vec![not_null("avg_population_density")];
    density_wh.timeout_ms = 1_500;
    density_wh.cache_ttl_ms = HOUR_MS;
    definitions.push(density_wh);

    let mut tier = pass_through(
        "density_tier",
        EntityKind::Route,
        "avg_population_density",
        vec![DerivationStep::Tier {
            input: "avg_population_density".to_string(),
            output: "density_tier".to_string(),
            direction: TierDirection::Descending,
            boundaries: vec![
                TierBoundary {
                    threshold: 5_000.0,
                    label: "high".to_string(),
                },
                TierBoundary {
                    threshold: 1_000.0,
                    label: "medium".to_string(),
                },
            ],
            fallback: "low".to_string(),
        }],
        &["density_tier"],
    );
    tier.cache_ttl_ms = HOUR_MS;
    definitions.push(tier);

    let mut delay = pass_through(
        "estimated_handover_delay_seconds",
        EntityKind::Route,
        "avg_population_density",
        vec![DerivationStep::Compute {
            output: "estimated_handover_delay_seconds".to_string(),
            expr: MetricExpr::Affine {
                column: "avg_population_density".to_string(),
                scale: 0.012,
                offset: 90.0,
                cap: Some(240.0),
            },
        }],
        &["estimated_handover_delay_seconds"],
    );
    delay.cache_ttl_ms = HOUR_MS;
    definitions.push(delay);

    let mut composition = base(
        "route_composition",
        EntityKind::Route,
        OPERATIONAL_PG,
        0,
        "SELECT composition_total_shipments, composition_count_containers, composition_count_loose_shipments FROM route_composition WHERE route_uid = :route_uid",
        &[
            "composition_total_shipments",
            "composition_count_containers",
            "composition_count_loose_shipments",
        ],
    );
    composition.quality_predicates = vec![not_null("composition_total_shipments")];
    definitions.push(composition);

    let mut composition_wh = base(
        "route_composition",
        EntityKind::Route,
        ANALYTICS_WH,
        1,
        "SELECT COUNT(*) AS composition_total_shipments, COUNT(DISTINCT container_uid) AS composition_count_containers, SUM(CASE WHEN container_uid IS NULL THEN 1 ELSE 0 END) AS composition_count_loose_shipments FROM wh_route_shipments WHERE route_uid = :route_uid",
        &[
            "composition_total_shipments",
            "composition_count_containers",
            "composition_count_loose_shipments",
        ],
    );
    composition_wh.quality_predicates = vec![not_null("composition_total_shipments")];
    composition_wh.timeout_ms = 1_500;
    definitions.push(composition_wh);

    definitions
}

fn shipment_definitions() -> Vec<ResolverDefinition> {
    let mut definitions = Vec::new();

    let mut building = base(
        "destination_building_type",
        EntityKind::Shipment,
        OPERATIONAL_PG,
        0,
        "SELECT destination_address FROM shipments WHERE shipment_uid = :shipment_uid AND status <> 'cancelled'",
        &["destination_building_type"],
    );
    building.quality_predicates = vec![not_null("destination_address")];
    building.cache_ttl_ms = HOUR_MS;
    // Flat markers outrank house markers: "Flat 2, Rose House" is a flat.
    building.derive = vec![DerivationStep::Classify {
        input: "destination_address".to_string(),
        output: "destination_building_type".to_string(),
        rules: vec![
            rule(r"(?i)\b(flat|apartment|apt|maisonette)\b", "flat"),
            rule(r"(?i)\b(unit|block|floor)\b", "flat"),
            rule(r"(?i)\b(house|bungalow|cottage)\b", "house"),
        ],
        fallback: "unknown".to_string(),
    }];
    definitions.push(building);

    let mut complexity = base(
        "building_type_handover_complexity",
        EntityKind::Shipment,
        OPERATIONAL_PG,
        0,
        "SELECT :destination_building_type::text AS destination_building_type",
        &["building_type_handover_complexity"],
    );
    complexity.params = vec![ParamSpec::text("destination_building_type")];
    complexity.requires = vec!["destination_building_type".to_string()];
    complexity.cache_ttl_ms = HOUR_MS;
    complexity.derive = vec![DerivationStep::Classify {
        input: "destination_building_type".to_string(),
        output: "building_type_handover_complexity".to_string(),
        rules: vec![rule(r"^flat$", "high"), rule(r"^house$", "low")],
        fallback: "medium".to_string(),
    }];
    definitions.push(complexity);

    let mut floor = base(
        "estimated_floor_number",
        EntityKind::Shipment,
        OPERATIONAL_PG,
        0,
        "SELECT floor_number AS estimated_floor_number FROM address_attributes WHERE shipment_uid = :shipment_uid",
        &["estimated_floor_number"],
    );
    floor.default_value = Some(json!(0));
    floor.derive = vec![DerivationStep::DefaultIfNull {
        column: "estimated_floor_number".to_string(),
        value: json!(0),
    }];
    definitions.push(floor);

    let mut burden = base(
        "remaining_parcels_burden",
        EntityKind::Shipment,
        OPERATIONAL_PG,
        0,
        "SELECT remaining_parcels AS remaining_parcels_burden FROM route_progress WHERE shipment_uid = :shipment_uid",
        &["remaining_parcels_burden"],
    );
    burden.quality_predicates = vec![not_null("remaining_parcels_burden")];
    burden.cache_ttl_ms = 30_000;
    definitions.push(burden);

    let mut time_of_day = base(
        "time_of_day",
        EntityKind::Shipment,
        OPERATIONAL_PG,
        0,
        "SELECT EXTRACT(HOUR FROM attempt_at_local)::int4 AS time_of_day FROM delivery_attempts WHERE shipment_uid = :shipment_uid ORDER BY attempt_at_local DESC LIMIT 1",
        &["time_of_day"],
    );
    time_of_day.quality_predicates = vec![not_null("time_of_day")];
    definitions.push(time_of_day);

    definitions
}

/// Build the full Last Mile Durations registry.
pub fn lastmile_registry() -> Result<ResolverRegistry> {
    let mut builder = RegistryBuilder::new();
    builder.register_all(courier_definitions())?;
    builder.register_all(route_definitions())?;
    builder.register_all(shipment_definitions())?;
    builder.build()
}
