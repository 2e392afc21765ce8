//! Feature Engine
//!
//! Request orchestration: expands requested features into dependency waves,
//! fans independent features out concurrently, serves cache hits, and
//! isolates per-feature failures so a multi-feature request returns a
//! partial success map instead of failing atomically.

use crate::cache::FeatureCache;
use crate::error::{FeatureError, Result};
use crate::model::{
    FeatureRequest, Provenance, QualityStatus, ResolutionOutcome, ResolvedFeature,
};
use crate::observability::SourceMetrics;
use crate::postprocess::PostProcessor;
use crate::registry::ResolverRegistry;
use crate::router::{RouterOutcome, SourceRouter};
use crate::source::SourceSet;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// End-to-end deadline applied when a request declares none.
    pub default_request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_request_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone)]
pub struct FeatureEngine {
    registry: Arc<ResolverRegistry>,
    router: Arc<SourceRouter>,
    cache: Arc<FeatureCache>,
    post: Arc<PostProcessor>,
    metrics: SourceMetrics,
    config: EngineConfig,
}

impl FeatureEngine {
    pub fn new(registry: Arc<ResolverRegistry>, sources: SourceSet) -> Self {
        Self::with_config(registry, sources, EngineConfig::default())
    }

    pub fn with_config(
        registry: Arc<ResolverRegistry>,
        sources: SourceSet,
        config: EngineConfig,
    ) -> Self {
        let post = Arc::new(PostProcessor::new());
        let metrics = SourceMetrics::new();
        let router = Arc::new(SourceRouter::new(
            sources,
            Arc::clone(&post),
            metrics.clone(),
        ));
        Self {
            registry,
            router,
            cache: Arc::new(FeatureCache::new()),
            post,
            metrics,
            config,
        }
    }

    pub fn registry(&self) -> &ResolverRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &SourceMetrics {
        &self.metrics
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    /// Resolve the requested features for one entity. Always returns a
    /// partial-success outcome; per-feature failures land in the error map.
    pub async fn resolve(&self, request: FeatureRequest) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();

        let mut known: Vec<String> = Vec::new();
        for feature in &request.features {
            if self.registry.contains(feature) {
                if !known.contains(feature) {
                    known.push(feature.clone());
                }
            } else {
                outcome
                    .errors
                    .insert(feature.clone(), FeatureError::UnknownFeature(feature.clone()));
            }
        }
        if known.is_empty() {
            return outcome;
        }

        let waves = match self.registry.resolution_waves(&known) {
            Ok(waves) => waves,
            Err(err) => {
                // Registry construction makes this unreachable for known
                // features; surface it on every requested feature if it
                // happens anyway.
                for feature in known {
                    outcome
                        .errors
                        .insert(feature, FeatureError::Configuration(err.to_string()));
                }
                return outcome;
            }
        };

        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.config.default_request_timeout_ms);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let request = Arc::new(request);

        let mut resolved: HashMap<String, ResolvedFeature> = HashMap::new();
        let mut failed: HashMap<String, FeatureError> = HashMap::new();

        for wave in waves {
            let upstream = Arc::new(resolved.clone());
            let mut join_set: JoinSet<(String, Result<ResolvedFeature>)> = JoinSet::new();

            for feature in wave {
                if let Some(missing) = self.failed_upstream_of(&feature, &failed) {
                    failed.insert(
                        feature.clone(),
                        FeatureError::Unresolvable(format!(
                            "'{}': upstream feature '{}' failed",
                            feature, missing
                        )),
                    );
                    continue;
                }

                let engine = self.clone();
                let request = Arc::clone(&request);
                let upstream = Arc::clone(&upstream);
                join_set.spawn(async move {
                    let result = engine
                        .resolve_one(&feature, &request, &upstream, deadline)
                        .await;
                    (feature, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((feature, Ok(value))) => {
                        resolved.insert(feature, value);
                    }
                    Ok((feature, Err(err))) => {
                        warn!(feature = %feature, error = %err, "feature resolution failed");
                        failed.insert(feature, err);
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "resolution task panicked");
                    }
                }
            }
        }

        for feature in known {
            if let Some(value) = resolved.remove(&feature) {
                outcome.features.insert(feature, value);
            } else if let Some(err) = failed.remove(&feature) {
                outcome.errors.insert(feature, err);
            }
        }

        info!(
            request_id = %request.request_id,
            resolved = outcome.features.len(),
            failed = outcome.errors.len(),
            "request complete"
        );
        outcome
    }

    fn failed_upstream_of(
        &self,
        feature: &str,
        failed: &HashMap<String, FeatureError>,
    ) -> Option<String> {
        let definitions = self.registry.lookup(feature).ok()?;
        definitions
            .iter()
            .flat_map(|d| d.requires.iter())
            .find(|upstream| failed.contains_key(*upstream))
            .cloned()
    }

    /// Resolve one feature: cache check, then a deadline-bounded,
    /// coalesced route-and-derive. Cached values are served even after the
    /// request deadline has passed.
    async fn resolve_one(
        &self,
        feature: &str,
        request: &FeatureRequest,
        upstream: &HashMap<String, ResolvedFeature>,
        deadline: Instant,
    ) -> Result<ResolvedFeature> {
        let entity_id = request.primary_key()?.to_string();

        if let Some(hit) = self
            .cache
            .get(feature, &entity_id, request.staleness_tolerance_ms)
        {
            return Ok(hit);
        }

        let resolution = self.cache.get_or_resolve(
            feature,
            &entity_id,
            request.staleness_tolerance_ms,
            || self.route_and_derive(feature, &entity_id, request, upstream),
        );

        match tokio::time::timeout_at(deadline, resolution).await {
            Ok(result) => result,
            Err(_) => Err(FeatureError::RequestTimeout(format!(
                "'{}' did not resolve before the request deadline",
                feature
            ))),
        }
    }

    async fn route_and_derive(
        &self,
        feature: &str,
        entity_id: &str,
        request: &FeatureRequest,
        upstream: &HashMap<String, ResolvedFeature>,
    ) -> Result<ResolvedFeature> {
        let definitions = self.registry.lookup(feature)?;
        let now = Utc::now();

        match self.router.route(definitions, request, upstream).await? {
            RouterOutcome::Resolved(success) => {
                let definition = &definitions[success.definition_index];
                let (value, quality) = self.post.derive(success.rows, definition)?;
                Ok(ResolvedFeature {
                    feature: feature.to_string(),
                    entity_id: entity_id.to_string(),
                    value,
                    provenance: Provenance::Resolver {
                        source_id: success.source_id,
                        priority: success.priority,
                    },
                    quality,
                    resolved_at: now,
                    expires_at: now + ChronoDuration::milliseconds(definition.cache_ttl_ms as i64),
                })
            }
            RouterOutcome::Defaulted(value) => {
                // Defaulted values expire on the primary's TTL so they are
                // re-attempted on the same cadence as resolved ones.
                let ttl_ms = definitions[0].cache_ttl_ms;
                Ok(ResolvedFeature {
                    feature: feature.to_string(),
                    entity_id: entity_id.to_string(),
                    value,
                    provenance: Provenance::Default,
                    quality: QualityStatus::Defaulted,
                    resolved_at: now,
                    expires_at: now + ChronoDuration::milliseconds(ttl_ms as i64),
                })
            }
        }
    }
}
