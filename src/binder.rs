//! Parameter Binder
//!
//! Resolves named `:placeholder` tokens in a statement template against the
//! request's entity keys, prelude-stage outputs, and upstream resolved
//! feature values. The output is a statement with positional `$n`
//! placeholders plus an ordered parameter list; values are never spliced
//! into statement text.

use crate::error::{FeatureError, Result};
use crate::model::{FeatureRequest, ResolvedFeature};
use crate::registry::{ParamKind, ParamSpec};
use crate::source::SourceRow;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

lazy_static! {
    // A placeholder is `:name` not preceded by another ':' so that
    // `::text`-style casts survive binding untouched.
    static ref PLACEHOLDER: Regex =
        Regex::new(r"(^|[^:]):([A-Za-z_][A-Za-z0-9_]*)").unwrap();
}

/// A concrete, typed parameter value ready for a store's native
/// parameterization mechanism.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl ParamValue {
    pub fn as_json(&self) -> Value {
        match self {
            ParamValue::Text(s) => Value::String(s.clone()),
            ParamValue::Integer(i) => Value::from(*i),
            ParamValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::Boolean(b) => Value::Bool(*b),
        }
    }
}

/// A statement with every placeholder substituted: positional text plus an
/// ordered parameter vector. Created per execution attempt and discarded.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    pub source_id: String,
    pub statement: String,
    pub params: Vec<ParamValue>,
}

/// Everything a placeholder may legally bind to, searched in order:
/// request keys, then prelude-stage outputs, then upstream feature values.
pub struct BindContext<'a> {
    pub request: &'a FeatureRequest,
    pub upstream: &'a HashMap<String, ResolvedFeature>,
    pub prelude: Option<&'a SourceRow>,
}

impl<'a> BindContext<'a> {
    pub fn new(
        request: &'a FeatureRequest,
        upstream: &'a HashMap<String, ResolvedFeature>,
    ) -> Self {
        Self {
            request,
            upstream,
            prelude: None,
        }
    }

    pub fn with_prelude(mut self, row: &'a SourceRow) -> Self {
        self.prelude = Some(row);
        self
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.request.keys.get(name) {
            return Some(Value::String(value.clone()));
        }
        if let Some(row) = self.prelude {
            if let Some(value) = row.get(name) {
                return Some(value.clone());
            }
        }
        self.upstream.get(name).map(|f| f.value.clone())
    }

    fn is_request_key(&self, name: &str) -> bool {
        self.request.keys.contains_key(name)
    }
}

/// Bind a statement template. Every placeholder must be declared in
/// `params` and resolve to a known value; each occurrence appends one
/// positional parameter.
pub fn bind(
    source_id: &str,
    template: &str,
    params: &[ParamSpec],
    ctx: &BindContext<'_>,
) -> Result<BoundQuery> {
    let mut statement = String::with_capacity(template.len());
    let mut bound: Vec<ParamValue> = Vec::new();
    let mut cursor = 0;

    for captures in PLACEHOLDER.captures_iter(template) {
        let whole = captures.get(0).unwrap();
        let prefix = captures.get(1).unwrap();
        let name = captures.get(2).unwrap().as_str();

        let spec = params.iter().find(|p| p.name == name).ok_or_else(|| {
            FeatureError::UnboundParameter(format!(
                "placeholder ':{}' is not declared by the resolver",
                name
            ))
        })?;

        let raw = ctx.lookup(name).ok_or_else(|| {
            FeatureError::UnboundParameter(format!(
                "placeholder ':{}' matches no request key, prelude output, or upstream feature",
                name
            ))
        })?;

        if raw.is_null() {
            return Err(FeatureError::MissingKey(format!(
                "placeholder ':{}' resolved to null",
                name
            )));
        }
        if ctx.is_request_key(name) {
            if let Value::String(s) = &raw {
                if s.trim().is_empty() {
                    return Err(FeatureError::MissingKey(format!(
                        "entity key '{}' is empty",
                        name
                    )));
                }
            }
        }

        bound.push(coerce(&raw, spec)?);

        statement.push_str(&template[cursor..whole.start()]);
        statement.push_str(prefix.as_str());
        statement.push_str(&format!("${}", bound.len()));
        cursor = whole.end();
    }
    statement.push_str(&template[cursor..]);

    Ok(BoundQuery {
        source_id: source_id.to_string(),
        statement,
        params: bound,
    })
}

fn coerce(value: &Value, spec: &ParamSpec) -> Result<ParamValue> {
    let coerced = match spec.kind {
        ParamKind::Text => match value {
            Value::String(s) => Some(ParamValue::Text(s.clone())),
            Value::Number(n) => Some(ParamValue::Text(n.to_string())),
            Value::Bool(b) => Some(ParamValue::Text(b.to_string())),
            _ => None,
        },
        ParamKind::Integer => match value {
            Value::Number(n) => n.as_i64().map(ParamValue::Integer),
            Value::String(s) => s.trim().parse().ok().map(ParamValue::Integer),
            _ => None,
        },
        ParamKind::Float => match value {
            Value::Number(n) => n.as_f64().map(ParamValue::Float),
            Value::String(s) => s.trim().parse().ok().map(ParamValue::Float),
            _ => None,
        },
        ParamKind::Boolean => match value {
            Value::Bool(b) => Some(ParamValue::Boolean(*b)),
            Value::String(s) => s.trim().parse().ok().map(ParamValue::Boolean),
            _ => None,
        },
    };

    coerced.ok_or_else(|| {
        FeatureError::UnboundParameter(format!(
            "value for ':{}' cannot be coerced to {:?}",
            spec.name, spec.kind
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, Provenance, QualityStatus};
    use chrono::Utc;
    use serde_json::json;

    fn request() -> FeatureRequest {
        FeatureRequest::new(EntityKind::Route, "route-42")
            .with_key("collection_pitstop_postcode", "EC1A 1BB")
    }

    #[test]
    fn test_bind_rewrites_to_positional_params() {
        let request = request();
        let upstream = HashMap::new();
        let ctx = BindContext::new(&request, &upstream);
        let bound = bind(
            "operational_pg",
            "SELECT density FROM outcode_density WHERE route_uid = :route_uid AND postcode = :collection_pitstop_postcode",
            &[
                ParamSpec::text("route_uid"),
                ParamSpec::text("collection_pitstop_postcode"),
            ],
            &ctx,
        )
        .unwrap();

        assert_eq!(
            bound.statement,
            "SELECT density FROM outcode_density WHERE route_uid = $1 AND postcode = $2"
        );
        assert_eq!(
            bound.params,
            vec![
                ParamValue::Text("route-42".to_string()),
                ParamValue::Text("EC1A 1BB".to_string()),
            ]
        );
    }

    #[test]
    fn test_postgres_casts_survive() {
        let request = request();
        let upstream = HashMap::new();
        let ctx = BindContext::new(&request, &upstream);
        let bound = bind(
            "operational_pg",
            "SELECT :route_uid::text AS route_uid",
            &[ParamSpec::text("route_uid")],
            &ctx,
        )
        .unwrap();
        assert_eq!(bound.statement, "SELECT $1::text AS route_uid");
        assert_eq!(bound.params.len(), 1);
    }

    #[test]
    fn test_undeclared_placeholder_fails() {
        let request = request();
        let upstream = HashMap::new();
        let ctx = BindContext::new(&request, &upstream);
        let err = bind(
            "operational_pg",
            "SELECT * FROM routes WHERE uid = :route_uid",
            &[],
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, FeatureError::UnboundParameter(_)));
    }

    #[test]
    fn test_unknown_value_fails() {
        let request = request();
        let upstream = HashMap::new();
        let ctx = BindContext::new(&request, &upstream);
        let err = bind(
            "operational_pg",
            "SELECT * FROM couriers WHERE uid = :courier_uid",
            &[ParamSpec::text("courier_uid")],
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, FeatureError::UnboundParameter(_)));
    }

    #[test]
    fn test_empty_entity_key_fails() {
        let request =
            FeatureRequest::new(EntityKind::Route, "route-42").with_key("courier_uid", "  ");
        let upstream = HashMap::new();
        let ctx = BindContext::new(&request, &upstream);
        let err = bind(
            "operational_pg",
            "SELECT * FROM couriers WHERE uid = :courier_uid",
            &[ParamSpec::text("courier_uid")],
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, FeatureError::MissingKey(_)));
    }

    #[test]
    fn test_upstream_feature_binds_with_coercion() {
        let request = request();
        let mut upstream = HashMap::new();
        upstream.insert(
            "avg_population_density".to_string(),
            ResolvedFeature {
                feature: "avg_population_density".to_string(),
                entity_id: "route-42".to_string(),
                value: json!(4210.5),
                provenance: Provenance::Resolver {
                    source_id: "operational_pg".to_string(),
                    priority: 0,
                },
                quality: QualityStatus::Complete,
                resolved_at: Utc::now(),
                expires_at: Utc::now(),
            },
        );
        let ctx = BindContext::new(&request, &upstream);
        let bound = bind(
            "operational_pg",
            "SELECT :avg_population_density AS avg_population_density",
            &[ParamSpec {
                name: "avg_population_density".to_string(),
                kind: ParamKind::Float,
            }],
            &ctx,
        )
        .unwrap();
        assert_eq!(bound.params, vec![ParamValue::Float(4210.5)]);
    }

    #[test]
    fn test_prelude_output_binds() {
        let request = request();
        let upstream = HashMap::new();
        let mut prelude = SourceRow::new();
        prelude.insert("outcode".to_string(), json!("EC1A"));
        let ctx = BindContext::new(&request, &upstream).with_prelude(&prelude);
        let bound = bind(
            "analytics_wh",
            "SELECT avg_density FROM outcode_population WHERE outcode = :outcode",
            &[ParamSpec::text("outcode")],
            &ctx,
        )
        .unwrap();
        assert_eq!(bound.params, vec![ParamValue::Text("EC1A".to_string())]);
    }
}
