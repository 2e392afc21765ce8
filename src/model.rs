//! Core Data Model
//!
//! Requests, resolved values, provenance, and quality metadata shared by
//! every stage of the resolution pipeline.

use crate::error::{FeatureError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Entity classes served by the feature engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Shipment,
    Route,
    Courier,
    Address,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Shipment => "shipment",
            EntityKind::Route => "route",
            EntityKind::Courier => "courier",
            EntityKind::Address => "address",
        }
    }

    /// Canonical identifier column for this entity class.
    pub fn key_column(&self) -> &'static str {
        match self {
            EntityKind::Shipment => "shipment_uid",
            EntityKind::Route => "route_uid",
            EntityKind::Courier => "courier_uid",
            EntityKind::Address => "address_uid",
        }
    }
}

/// One inbound feature query. Immutable for its lifetime; dropped once the
/// response has been produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub request_id: String,
    pub entity: EntityKind,
    /// Entity identifiers: the canonical key plus any secondary identifiers
    /// a resolver template may bind (e.g. `destination_postcode`).
    pub keys: HashMap<String, String>,
    pub features: Vec<String>,
    /// Maximum acceptable age of a cached value, if stricter than the
    /// resolver-declared TTL.
    pub staleness_tolerance_ms: Option<u64>,
    /// End-to-end deadline for the whole request.
    pub timeout_ms: Option<u64>,
}

impl FeatureRequest {
    pub fn new(entity: EntityKind, entity_id: impl Into<String>) -> Self {
        let mut keys = HashMap::new();
        keys.insert(entity.key_column().to_string(), entity_id.into());
        Self {
            request_id: Uuid::new_v4().to_string(),
            entity,
            keys,
            features: Vec::new(),
            staleness_tolerance_ms: None,
            timeout_ms: None,
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features
            .extend(features.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(name.into(), value.into());
        self
    }

    pub fn with_staleness_tolerance_ms(mut self, ms: u64) -> Self {
        self.staleness_tolerance_ms = Some(ms);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// The canonical entity identifier this request resolves features for.
    pub fn primary_key(&self) -> Result<&str> {
        let column = self.entity.key_column();
        match self.keys.get(column) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(FeatureError::MissingKey(format!(
                "request for {} entity carries no '{}' value",
                self.entity.as_str(),
                column
            ))),
        }
    }
}

/// Data completeness of a resolved value. This is a first-class output
/// consumed by downstream callers, not a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityStatus {
    Complete,
    MissingComponent,
    Defaulted,
}

impl QualityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Complete => "complete",
            QualityStatus::MissingComponent => "missing-component",
            QualityStatus::Defaulted => "defaulted",
        }
    }

    /// Downgrades never upgrade: defaulted stays defaulted even if a later
    /// step fills a component.
    pub fn downgrade_to(self, other: QualityStatus) -> QualityStatus {
        use QualityStatus::*;
        match (self, other) {
            (Complete, s) => s,
            (MissingComponent, Defaulted) => Defaulted,
            (s, _) => s,
        }
    }
}

/// Which resolver attempt produced a value, or the declared default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    Resolver { source_id: String, priority: u32 },
    Default,
}

impl Provenance {
    pub fn is_default(&self) -> bool {
        matches!(self, Provenance::Default)
    }
}

/// A resolved (feature, entity) value with its quality metadata. Owned by
/// the cache once produced; superseded rather than mutated when re-resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedFeature {
    pub feature: String,
    pub entity_id: String,
    pub value: serde_json::Value,
    pub provenance: Provenance,
    pub quality: QualityStatus,
    pub resolved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResolvedFeature {
    /// Whether this value is still usable at `now`, under an optional
    /// caller staleness tolerance (which only narrows, never widens).
    pub fn is_fresh(&self, now: DateTime<Utc>, staleness_tolerance_ms: Option<u64>) -> bool {
        if now >= self.expires_at {
            return false;
        }
        if let Some(tolerance_ms) = staleness_tolerance_ms {
            let age = now - self.resolved_at;
            if age > Duration::milliseconds(tolerance_ms as i64) {
                return false;
            }
        }
        true
    }
}

/// Per-request outcome: partial success map plus per-feature failures.
/// A multi-feature request never fails atomically.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    pub features: HashMap<String, ResolvedFeature>,
    pub errors: HashMap<String, FeatureError>,
}

impl ResolutionOutcome {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, feature: &str) -> Option<&ResolvedFeature> {
        self.features.get(feature)
    }
}
