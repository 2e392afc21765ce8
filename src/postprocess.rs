//! Result Post-Processor
//!
//! Turns qualifying source rows into a final feature value: data-quality
//! filtering, pattern classification, threshold tiering, default
//! substitution, and derived-metric computation, in that fixed order.
//!
//! Rule tables are tagged variants evaluated first-match-wins. Ordering is
//! part of the contract: reordering a rule list changes behavior.

use crate::error::{FeatureError, Result};
use crate::model::QualityStatus;
use crate::registry::{Cardinality, ResolverDefinition, RowPredicate};
use crate::source::SourceRow;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// One `(pattern -> category)` classification rule. Patterns are regular
/// expressions matched anywhere in the input string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub pattern: String,
    pub category: String,
}

/// One inclusive tier boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBoundary {
    pub threshold: f64,
    pub label: String,
}

/// Which side of the boundary list is inclusive. `Descending` evaluates
/// `value >= threshold` top-to-bottom (the `>= 5000` before `>= 1000`
/// shape); `Ascending` evaluates `value <= threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierDirection {
    Descending,
    Ascending,
}

/// Arithmetic combination of resolved component values. Computed after all
/// substitutions so it never consumes a raw null.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricExpr {
    /// `column * scale + offset`, optionally capped.
    Affine {
        column: String,
        scale: f64,
        offset: f64,
        #[serde(default)]
        cap: Option<f64>,
    },
    Sum { columns: Vec<String> },
    Product { columns: Vec<String> },
}

/// One declared derivation step. Steps run grouped by phase in the fixed
/// pipeline order; within a phase, declared order is preserved exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum DerivationStep {
    Classify {
        input: String,
        output: String,
        rules: Vec<ClassificationRule>,
        fallback: String,
    },
    Tier {
        input: String,
        output: String,
        direction: TierDirection,
        boundaries: Vec<TierBoundary>,
        fallback: String,
    },
    DefaultIfNull { column: String, value: Value },
    Compute { output: String, expr: MetricExpr },
}

/// Explicitly constructed, immutable derivation configuration. Compiled
/// patterns are cached across calls; the cache is the only interior state.
pub struct PostProcessor {
    pattern_cache: RwLock<HashMap<String, Regex>>,
}

impl PostProcessor {
    pub fn new() -> Self {
        Self {
            pattern_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop rows failing the definition's data-quality predicates. An
    /// emptied result is "zero qualifying rows" to the router, never a
    /// silent null.
    pub fn qualify(&self, rows: Vec<SourceRow>, definition: &ResolverDefinition) -> Vec<SourceRow> {
        rows.into_iter()
            .filter(|row| {
                definition
                    .quality_predicates
                    .iter()
                    .all(|predicate| predicate_holds(predicate, row))
            })
            .collect()
    }

    /// Derive the final value and quality status from qualifying rows.
    pub fn derive(
        &self,
        rows: Vec<SourceRow>,
        definition: &ResolverDefinition,
    ) -> Result<(Value, QualityStatus)> {
        match definition.cardinality {
            Cardinality::One => {
                let row = rows.into_iter().next().ok_or_else(|| {
                    FeatureError::Derivation(format!(
                        "no qualifying row for '{}'",
                        definition.feature
                    ))
                })?;
                let (row, quality) = self.derive_row(row, definition)?;
                Ok((project(&row, &definition.output_columns), quality))
            }
            Cardinality::Many => {
                let mut quality = QualityStatus::Complete;
                let mut projected = Vec::with_capacity(rows.len());
                for row in rows {
                    let (row, row_quality) = self.derive_row(row, definition)?;
                    quality = quality.downgrade_to(row_quality);
                    projected.push(project(&row, &definition.output_columns));
                }
                Ok((Value::Array(projected), quality))
            }
        }
    }

    fn derive_row(
        &self,
        mut row: SourceRow,
        definition: &ResolverDefinition,
    ) -> Result<(SourceRow, QualityStatus)> {
        let mut quality = QualityStatus::Complete;

        for step in &definition.derive {
            if let DerivationStep::Classify {
                input,
                output,
                rules,
                fallback,
            } = step
            {
                let (category, downgrade) = self.classify(row.get(input), rules, fallback)?;
                if let Some(status) = downgrade {
                    quality = quality.downgrade_to(status);
                }
                row.insert(output.clone(), Value::String(category));
            }
        }

        for step in &definition.derive {
            if let DerivationStep::Tier {
                input,
                output,
                direction,
                boundaries,
                fallback,
            } = step
            {
                match as_f64(row.get(input)) {
                    Some(value) => {
                        let label = tier(value, *direction, boundaries, fallback);
                        row.insert(output.clone(), Value::String(label));
                    }
                    None => {
                        quality = quality.downgrade_to(QualityStatus::MissingComponent);
                        row.insert(output.clone(), Value::String(fallback.clone()));
                    }
                }
            }
        }

        for step in &definition.derive {
            if let DerivationStep::DefaultIfNull { column, value } = step {
                let is_null = row.get(column).map(Value::is_null).unwrap_or(true);
                if is_null {
                    row.insert(column.clone(), value.clone());
                    quality = quality.downgrade_to(QualityStatus::Defaulted);
                }
            }
        }

        for step in &definition.derive {
            if let DerivationStep::Compute { output, expr } = step {
                match compute(expr, &row) {
                    Some(value) => {
                        row.insert(output.clone(), value);
                    }
                    None => {
                        // An input stayed null with no declared default;
                        // the metric is withheld rather than computed on it.
                        quality = quality.downgrade_to(QualityStatus::MissingComponent);
                    }
                }
            }
        }

        for column in &definition.output_columns {
            if row.get(column).map(Value::is_null).unwrap_or(true) {
                quality = quality.downgrade_to(QualityStatus::MissingComponent);
            }
        }

        Ok((row, quality))
    }

    /// Evaluate an ordered rule list top-to-bottom, first match wins. A null
    /// input falls through to the declared fallback and downgrades quality.
    fn classify(
        &self,
        input: Option<&Value>,
        rules: &[ClassificationRule],
        fallback: &str,
    ) -> Result<(String, Option<QualityStatus>)> {
        let text = match input {
            Some(Value::String(s)) => s.clone(),
            Some(value) if !value.is_null() => value.to_string(),
            _ => return Ok((fallback.to_string(), Some(QualityStatus::MissingComponent))),
        };

        for rule in rules {
            if self.regex_for(&rule.pattern)?.is_match(&text) {
                return Ok((rule.category.clone(), None));
            }
        }
        Ok((fallback.to_string(), None))
    }

    fn regex_for(&self, pattern: &str) -> Result<Regex> {
        if let Some(regex) = self.pattern_cache.read().unwrap().get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(pattern).map_err(|e| {
            FeatureError::Configuration(format!("invalid classification pattern '{}': {}", pattern, e))
        })?;
        self.pattern_cache
            .write()
            .unwrap()
            .insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn predicate_holds(predicate: &RowPredicate, row: &SourceRow) -> bool {
    match predicate {
        RowPredicate::NotNull { column } => {
            row.get(column).map(|v| !v.is_null()).unwrap_or(false)
        }
        RowPredicate::NotEquals { column, value } => {
            row.get(column).map(|v| v != value).unwrap_or(true)
        }
        RowPredicate::Equals { column, value } => {
            row.get(column).map(|v| v == value).unwrap_or(false)
        }
    }
}

fn tier(value: f64, direction: TierDirection, boundaries: &[TierBoundary], fallback: &str) -> String {
    for boundary in boundaries {
        let hit = match direction {
            TierDirection::Descending => value >= boundary.threshold,
            TierDirection::Ascending => value <= boundary.threshold,
        };
        if hit {
            return boundary.label.clone();
        }
    }
    fallback.to_string()
}

fn compute(expr: &MetricExpr, row: &SourceRow) -> Option<Value> {
    match expr {
        MetricExpr::Affine {
            column,
            scale,
            offset,
            cap,
        } => {
            let mut value = as_f64(row.get(column))? * scale + offset;
            if let Some(cap) = cap {
                value = value.min(*cap);
            }
            Some(number(value))
        }
        MetricExpr::Sum { columns } => {
            let mut total = 0.0;
            for column in columns {
                total += as_f64(row.get(column))?;
            }
            Some(number(total))
        }
        MetricExpr::Product { columns } => {
            let mut total = 1.0;
            for column in columns {
                total *= as_f64(row.get(column))?;
            }
            Some(number(total))
        }
    }
}

fn as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn project(row: &SourceRow, output_columns: &[String]) -> Value {
    if output_columns.len() == 1 {
        return row.get(&output_columns[0]).cloned().unwrap_or(Value::Null);
    }
    let mut projected = serde_json::Map::new();
    for column in output_columns {
        projected.insert(
            column.clone(),
            row.get(column).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(projected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use serde_json::json;

    fn definition(derive: Vec<DerivationStep>, output_columns: Vec<&str>) -> ResolverDefinition {
        ResolverDefinition {
            feature: "test_feature".to_string(),
            entity: EntityKind::Shipment,
            source_id: "operational_pg".to_string(),
            priority: 0,
            statement_template: "SELECT 1".to_string(),
            params: Vec::new(),
            output_columns: output_columns.iter().map(|c| c.to_string()).collect(),
            cardinality: Cardinality::One,
            quality_predicates: Vec::new(),
            timeout_ms: 1_000,
            cache_ttl_ms: 60_000,
            default_value: None,
            requires: Vec::new(),
            prelude: None,
            derive,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> SourceRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_classification_first_match_wins() {
        let post = PostProcessor::new();
        let def = definition(
            vec![DerivationStep::Classify {
                input: "destination_address".to_string(),
                output: "building_type".to_string(),
                rules: vec![
                    ClassificationRule {
                        pattern: r"(?i)\b(flat|apartment|apt)\b".to_string(),
                        category: "flat".to_string(),
                    },
                    ClassificationRule {
                        pattern: r"(?i)\bhouse\b".to_string(),
                        category: "house".to_string(),
                    },
                ],
                fallback: "unknown".to_string(),
            }],
            vec!["building_type"],
        );

        // Matches both the flat rule and the later house rule; first wins.
        let rows = vec![row(&[(
            "destination_address",
            json!("Flat 2, Rose House, 14 Elm St"),
        )])];
        let (value, quality) = post.derive(rows, &def).unwrap();
        assert_eq!(value, json!("flat"));
        assert_eq!(quality, QualityStatus::Complete);
    }

    #[test]
    fn test_classification_fallback_category() {
        let post = PostProcessor::new();
        let def = definition(
            vec![DerivationStep::Classify {
                input: "destination_address".to_string(),
                output: "building_type".to_string(),
                rules: vec![ClassificationRule {
                    pattern: r"(?i)flat".to_string(),
                    category: "flat".to_string(),
                }],
                fallback: "house".to_string(),
            }],
            vec!["building_type"],
        );

        let rows = vec![row(&[("destination_address", json!("14 Elm Street"))])];
        let (value, quality) = post.derive(rows, &def).unwrap();
        assert_eq!(value, json!("house"));
        assert_eq!(quality, QualityStatus::Complete);
    }

    #[test]
    fn test_tier_boundary_inclusivity() {
        let boundaries = vec![
            TierBoundary {
                threshold: 5_000.0,
                label: "high".to_string(),
            },
            TierBoundary {
                threshold: 1_000.0,
                label: "medium".to_string(),
            },
        ];
        assert_eq!(
            tier(5_000.0, TierDirection::Descending, &boundaries, "low"),
            "high"
        );
        assert_eq!(
            tier(4_999.99, TierDirection::Descending, &boundaries, "low"),
            "medium"
        );
        assert_eq!(
            tier(999.99, TierDirection::Descending, &boundaries, "low"),
            "low"
        );
    }

    #[test]
    fn test_default_substitution_downgrades_quality() {
        let post = PostProcessor::new();
        let def = definition(
            vec![DerivationStep::DefaultIfNull {
                column: "avg_population_density".to_string(),
                value: json!(2500.0),
            }],
            vec!["avg_population_density"],
        );

        let rows = vec![row(&[("avg_population_density", Value::Null)])];
        let (value, quality) = post.derive(rows, &def).unwrap();
        assert_eq!(value, json!(2500.0));
        assert_eq!(quality, QualityStatus::Defaulted);
    }

    #[test]
    fn test_compute_runs_after_default_substitution() {
        let post = PostProcessor::new();
        let def = definition(
            vec![
                DerivationStep::Compute {
                    output: "estimated_handover_delay_seconds".to_string(),
                    expr: MetricExpr::Affine {
                        column: "avg_population_density".to_string(),
                        scale: 0.012,
                        offset: 90.0,
                        cap: None,
                    },
                },
                DerivationStep::DefaultIfNull {
                    column: "avg_population_density".to_string(),
                    value: json!(2500.0),
                },
            ],
            vec!["estimated_handover_delay_seconds"],
        );

        // Density is null in the row; the default phase runs before the
        // compute phase regardless of declared step order.
        let rows = vec![row(&[("avg_population_density", Value::Null)])];
        let (value, quality) = post.derive(rows, &def).unwrap();
        assert_eq!(value, json!(120.0));
        assert_eq!(quality, QualityStatus::Defaulted);
    }

    #[test]
    fn test_missing_component_without_default() {
        let post = PostProcessor::new();
        let def = definition(Vec::new(), vec!["estimated_floor_number"]);
        let rows = vec![row(&[("estimated_floor_number", Value::Null)])];
        let (value, quality) = post.derive(rows, &def).unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(quality, QualityStatus::MissingComponent);
    }

    #[test]
    fn test_qualify_filters_soft_deletes_and_nulls() {
        let post = PostProcessor::new();
        let mut def = definition(Vec::new(), vec!["density"]);
        def.quality_predicates = vec![
            RowPredicate::NotNull {
                column: "density".to_string(),
            },
            RowPredicate::NotEquals {
                column: "deleted".to_string(),
                value: json!(true),
            },
        ];

        let rows = vec![
            row(&[("density", json!(1200.0)), ("deleted", json!(false))]),
            row(&[("density", Value::Null), ("deleted", json!(false))]),
            row(&[("density", json!(900.0)), ("deleted", json!(true))]),
        ];
        let qualifying = post.qualify(rows, &def);
        assert_eq!(qualifying.len(), 1);
        assert_eq!(qualifying[0].get("density"), Some(&json!(1200.0)));
    }

    #[test]
    fn test_affine_cap() {
        let result = compute(
            &MetricExpr::Affine {
                column: "route_count".to_string(),
                scale: 1.0,
                offset: 0.0,
                cap: Some(100.0),
            },
            &row(&[("route_count", json!(250))]),
        );
        assert_eq!(result, Some(json!(100.0)));
    }
}
