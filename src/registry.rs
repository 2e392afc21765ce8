//! Resolver Registry
//!
//! Holds the declared resolver definitions, one or more per feature name,
//! validated at registration time. The built registry is immutable for the
//! serving lifetime; a reload constructs a fresh registry instance so
//! readers never race a mutation.

use crate::error::{FeatureError, Result};
use crate::model::EntityKind;
use crate::postprocess::DerivationStep;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Declared coercion for a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    Integer,
    Float,
    Boolean,
}

/// One named placeholder a statement template expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Text,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Integer,
        }
    }
}

/// Row-level data-quality predicate, applied before any derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowPredicate {
    /// The column must be present and non-null.
    NotNull { column: String },
    /// The column must not equal the given marker value (soft deletes).
    NotEquals {
        column: String,
        value: serde_json::Value,
    },
    Equals {
        column: String,
        value: serde_json::Value,
    },
}

/// Expected row cardinality of a resolver's statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Zero or one row; the first qualifying row carries the value.
    One,
    /// A qualifying row set; the value is the full set.
    Many,
}

fn default_cardinality() -> Cardinality {
    Cardinality::One
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

/// An internal first-stage fetch within one resolver definition. Its output
/// columns become bindable values for the main statement, so a two-source
/// definition stays a single attempt with local failure handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreludeQuery {
    pub source_id: String,
    pub statement_template: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub output_columns: Vec<String>,
}

/// A declared way of producing one feature's value from one backing store.
/// Loaded once at startup from already-parsed definitions; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverDefinition {
    pub feature: String,
    pub entity: EntityKind,
    pub source_id: String,
    /// Rank among resolvers for the same feature; 0 is primary, fallbacks
    /// strictly increase.
    pub priority: u32,
    pub statement_template: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub output_columns: Vec<String>,
    #[serde(default = "default_cardinality")]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub quality_predicates: Vec<RowPredicate>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Emitted with provenance "default" when every resolver is exhausted.
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    /// Feature names whose resolved values this definition binds as
    /// placeholders.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub prelude: Option<PreludeQuery>,
    #[serde(default)]
    pub derive: Vec<DerivationStep>,
}

impl ResolverDefinition {
    pub fn param_kind(&self, name: &str) -> Option<ParamKind> {
        self.params.iter().find(|p| p.name == name).map(|p| p.kind)
    }
}

/// Accumulates definitions and validates them into an immutable registry.
#[derive(Default)]
pub struct RegistryBuilder {
    definitions: HashMap<String, Vec<ResolverDefinition>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one resolver definition. Fails when another definition for
    /// the same feature already holds the same priority.
    pub fn register(&mut self, definition: ResolverDefinition) -> Result<()> {
        let entries = self
            .definitions
            .entry(definition.feature.clone())
            .or_default();

        if entries.iter().any(|d| d.priority == definition.priority) {
            return Err(FeatureError::DuplicatePriority {
                feature: definition.feature.clone(),
                priority: definition.priority,
            });
        }
        if let Some(first) = entries.first() {
            if first.entity != definition.entity {
                return Err(FeatureError::Configuration(format!(
                    "feature '{}' registered for both {} and {} entities",
                    definition.feature,
                    first.entity.as_str(),
                    definition.entity.as_str()
                )));
            }
        }

        entries.push(definition);
        Ok(())
    }

    pub fn register_all(
        &mut self,
        definitions: impl IntoIterator<Item = ResolverDefinition>,
    ) -> Result<()> {
        for definition in definitions {
            self.register(definition)?;
        }
        Ok(())
    }

    /// Validate the definition set and freeze it. Dependency cycles and
    /// dangling `requires` references fail here, never at request time.
    pub fn build(mut self) -> Result<ResolverRegistry> {
        for entries in self.definitions.values_mut() {
            entries.sort_by_key(|d| d.priority);
        }

        for (feature, entries) in &self.definitions {
            for definition in entries {
                for upstream in &definition.requires {
                    if !self.definitions.contains_key(upstream) {
                        return Err(FeatureError::Configuration(format!(
                            "feature '{}' requires unregistered feature '{}'",
                            feature, upstream
                        )));
                    }
                }
            }
        }

        let registry = ResolverRegistry {
            definitions: self.definitions,
        };
        registry.check_acyclic()?;
        Ok(registry)
    }
}

/// Immutable, process-wide resolver definition set.
pub struct ResolverRegistry {
    definitions: HashMap<String, Vec<ResolverDefinition>>,
}

impl ResolverRegistry {
    /// Resolvers for a feature in strictly ascending priority order.
    pub fn lookup(&self, feature: &str) -> Result<&[ResolverDefinition]> {
        self.definitions
            .get(feature)
            .map(|v| v.as_slice())
            .ok_or_else(|| FeatureError::UnknownFeature(feature.to_string()))
    }

    /// The primary (lowest-priority) definition for a feature.
    pub fn primary(&self, feature: &str) -> Result<&ResolverDefinition> {
        self.lookup(feature)?
            .first()
            .ok_or_else(|| FeatureError::UnknownFeature(feature.to_string()))
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.definitions.contains_key(feature)
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Upstream feature names for a feature, across all its resolvers.
    fn upstream_of(&self, feature: &str) -> HashSet<String> {
        self.definitions
            .get(feature)
            .map(|entries| {
                entries
                    .iter()
                    .flat_map(|d| d.requires.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_acyclic(&self) -> Result<()> {
        // Iterative DFS with a gray set for back-edge detection
        let mut visited: HashSet<String> = HashSet::new();
        for start in self.definitions.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut stack = vec![(start.clone(), false)];
            let mut in_path: HashSet<String> = HashSet::new();
            while let Some((feature, children_done)) = stack.pop() {
                if children_done {
                    in_path.remove(&feature);
                    continue;
                }
                if in_path.contains(&feature) {
                    return Err(FeatureError::CyclicDependency(format!(
                        "feature '{}' participates in a dependency cycle",
                        feature
                    )));
                }
                if visited.contains(&feature) {
                    continue;
                }
                visited.insert(feature.clone());
                in_path.insert(feature.clone());
                stack.push((feature.clone(), true));
                for upstream in self.upstream_of(&feature) {
                    if in_path.contains(&upstream) {
                        return Err(FeatureError::CyclicDependency(format!(
                            "feature '{}' depends on '{}' which depends back on it",
                            feature, upstream
                        )));
                    }
                    if !visited.contains(&upstream) {
                        stack.push((upstream, false));
                    }
                }
            }
        }
        Ok(())
    }

    /// Expand the requested features with their transitive upstreams and
    /// order them into dependency waves: every feature in wave N depends
    /// only on features in waves < N. Independent features share a wave and
    /// may resolve concurrently.
    pub fn resolution_waves(&self, requested: &[String]) -> Result<Vec<Vec<String>>> {
        let mut needed: HashSet<String> = HashSet::new();
        let mut pending: Vec<String> = Vec::new();
        for feature in requested {
            if !self.contains(feature) {
                return Err(FeatureError::UnknownFeature(feature.clone()));
            }
            if needed.insert(feature.clone()) {
                pending.push(feature.clone());
            }
        }
        while let Some(feature) = pending.pop() {
            for upstream in self.upstream_of(&feature) {
                if needed.insert(upstream.clone()) {
                    pending.push(upstream);
                }
            }
        }

        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut placed: HashSet<String> = HashSet::new();
        while placed.len() < needed.len() {
            let mut wave: Vec<String> = needed
                .iter()
                .filter(|f| !placed.contains(*f))
                .filter(|f| self.upstream_of(f).iter().all(|u| placed.contains(u)))
                .cloned()
                .collect();
            // Registry construction guarantees acyclicity, so progress is
            // always possible.
            debug_assert!(!wave.is_empty());
            if wave.is_empty() {
                return Err(FeatureError::CyclicDependency(
                    "unresolvable dependency ordering".to_string(),
                ));
            }
            wave.sort();
            for feature in &wave {
                placed.insert(feature.clone());
            }
            waves.push(wave);
        }
        Ok(waves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(feature: &str, priority: u32) -> ResolverDefinition {
        ResolverDefinition {
            feature: feature.to_string(),
            entity: EntityKind::Route,
            source_id: "operational_pg".to_string(),
            priority,
            statement_template: "SELECT 1".to_string(),
            params: Vec::new(),
            output_columns: vec!["value".to_string()],
            cardinality: Cardinality::One,
            quality_predicates: Vec::new(),
            timeout_ms: 1_000,
            cache_ttl_ms: 60_000,
            default_value: None,
            requires: Vec::new(),
            prelude: None,
            derive: Vec::new(),
        }
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(definition("avg_population_density", 0)).unwrap();
        let err = builder
            .register(definition("avg_population_density", 0))
            .unwrap_err();
        assert!(matches!(err, FeatureError::DuplicatePriority { .. }));
    }

    #[test]
    fn test_lookup_returns_ascending_priorities() {
        let mut builder = RegistryBuilder::new();
        builder.register(definition("avg_population_density", 2)).unwrap();
        builder.register(definition("avg_population_density", 0)).unwrap();
        builder.register(definition("avg_population_density", 1)).unwrap();
        let registry = builder.build().unwrap();

        let priorities: Vec<u32> = registry
            .lookup("avg_population_density")
            .unwrap()
            .iter()
            .map(|d| d.priority)
            .collect();
        assert_eq!(priorities, vec![0, 1, 2]);
    }

    #[test]
    fn test_unknown_feature() {
        let registry = RegistryBuilder::new().build().unwrap();
        assert!(matches!(
            registry.lookup("no_such_feature"),
            Err(FeatureError::UnknownFeature(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_at_build() {
        let mut builder = RegistryBuilder::new();
        let mut a = definition("density_tier", 0);
        a.requires = vec!["avg_population_density".to_string()];
        let mut b = definition("avg_population_density", 0);
        b.requires = vec!["density_tier".to_string()];
        builder.register(a).unwrap();
        builder.register(b).unwrap();
        assert!(matches!(
            builder.build(),
            Err(FeatureError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_dangling_requires_rejected() {
        let mut builder = RegistryBuilder::new();
        let mut a = definition("density_tier", 0);
        a.requires = vec!["avg_population_density".to_string()];
        builder.register(a).unwrap();
        assert!(matches!(
            builder.build(),
            Err(FeatureError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolution_waves_sequence_dependents() {
        let mut builder = RegistryBuilder::new();
        builder.register(definition("avg_population_density", 0)).unwrap();
        let mut tier = definition("density_tier", 0);
        tier.requires = vec!["avg_population_density".to_string()];
        builder.register(tier).unwrap();
        builder.register(definition("composition_total_shipments", 0)).unwrap();
        let registry = builder.build().unwrap();

        let waves = registry
            .resolution_waves(&[
                "density_tier".to_string(),
                "composition_total_shipments".to_string(),
            ])
            .unwrap();
        assert_eq!(waves.len(), 2);
        assert_eq!(
            waves[0],
            vec![
                "avg_population_density".to_string(),
                "composition_total_shipments".to_string()
            ]
        );
        assert_eq!(waves[1], vec!["density_tier".to_string()]);
    }
}
