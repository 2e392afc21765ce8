//! Source Router
//!
//! Walks a feature's resolvers in ascending priority order, executing each
//! under its declared timeout and falling over on failure or empty results.
//! The primary/fallback arrangement is an explicit state machine, not an
//! operational runbook note: `Pending -> Trying(i) -> {Succeeded,
//! Fallback(i+1), Exhausted}`.
//!
//! Attempts are strictly sequential; the router never issues a speculative
//! parallel attempt against a lower-priority source.

use crate::binder::{bind, BindContext};
use crate::error::{FeatureError, Result};
use crate::model::{FeatureRequest, ResolvedFeature};
use crate::observability::SourceMetrics;
use crate::postprocess::PostProcessor;
use crate::registry::ResolverDefinition;
use crate::source::{SourceRow, SourceSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Router progress for one feature resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Pending,
    Trying(u32),
    Fallback(u32),
    Succeeded,
    Exhausted,
}

/// A successful attempt: qualifying rows plus which resolver produced them.
#[derive(Debug)]
pub struct RouterSuccess {
    pub rows: Vec<SourceRow>,
    pub definition_index: usize,
    pub source_id: String,
    pub priority: u32,
}

/// Terminal router outcome for one feature.
#[derive(Debug)]
pub enum RouterOutcome {
    Resolved(RouterSuccess),
    /// Every resolver exhausted; the feature's declared default applies.
    Defaulted(Value),
}

pub struct SourceRouter {
    sources: SourceSet,
    post: Arc<PostProcessor>,
    metrics: SourceMetrics,
}

impl SourceRouter {
    pub fn new(sources: SourceSet, post: Arc<PostProcessor>, metrics: SourceMetrics) -> Self {
        Self {
            sources,
            post,
            metrics,
        }
    }

    /// Resolve one feature through its resolver chain. `definitions` is the
    /// registry's ascending-priority list for the feature.
    pub async fn route(
        &self,
        definitions: &[ResolverDefinition],
        request: &FeatureRequest,
        upstream: &HashMap<String, ResolvedFeature>,
    ) -> Result<RouterOutcome> {
        let feature = definitions
            .first()
            .map(|d| d.feature.as_str())
            .ok_or_else(|| FeatureError::UnknownFeature("empty resolver chain".to_string()))?;

        let mut state = RouteState::Pending;
        debug!(feature, state = ?state, "routing");
        let mut last_error: Option<FeatureError> = None;

        for (index, definition) in definitions.iter().enumerate() {
            state = RouteState::Trying(definition.priority);
            debug!(feature, source = %definition.source_id, state = ?state, "trying resolver");
            if index > 0 {
                self.metrics.record_fallback(feature);
            }

            match self.attempt(definition, request, upstream).await {
                Ok(rows) if !rows.is_empty() => {
                    state = RouteState::Succeeded;
                    debug!(feature, priority = definition.priority, state = ?state, "resolver succeeded");
                    return Ok(RouterOutcome::Resolved(RouterSuccess {
                        rows,
                        definition_index: index,
                        source_id: definition.source_id.clone(),
                        priority: definition.priority,
                    }));
                }
                Ok(_) => {
                    warn!(feature, priority = definition.priority, "zero qualifying rows");
                }
                Err(err) if err.is_recoverable() => {
                    warn!(feature, priority = definition.priority, error = %err, "resolver attempt failed");
                    last_error = Some(err);
                }
                // Binding and configuration failures are not fallback
                // transitions; they surface immediately.
                Err(err) => return Err(err),
            }

            if index + 1 < definitions.len() {
                state = RouteState::Fallback(definitions[index + 1].priority);
                debug!(feature, state = ?state, "falling back");
            }
        }

        state = RouteState::Exhausted;
        debug!(feature, state = ?state, "resolver chain exhausted");

        if let Some(default_value) = &definitions[0].default_value {
            return Ok(RouterOutcome::Defaulted(default_value.clone()));
        }

        Err(FeatureError::Unresolvable(match last_error {
            Some(err) => format!("'{}': all resolvers failed, last error: {}", feature, err),
            None => format!("'{}': no qualifying rows from any resolver", feature),
        }))
    }

    /// One attempt: optional prelude stage, bind, execute, quality-filter.
    /// The prelude shares the attempt's timeout budget, so a slow first
    /// stage fails the attempt as a whole.
    async fn attempt(
        &self,
        definition: &ResolverDefinition,
        request: &FeatureRequest,
        upstream: &HashMap<String, ResolvedFeature>,
    ) -> Result<Vec<SourceRow>> {
        let deadline = Instant::now() + Duration::from_millis(definition.timeout_ms);

        let prelude_row = match &definition.prelude {
            Some(prelude) => {
                let ctx = BindContext::new(request, upstream);
                let bound = bind(
                    &prelude.source_id,
                    &prelude.statement_template,
                    &prelude.params,
                    &ctx,
                )?;
                let result = self.execute(&bound, deadline).await?;
                match result.rows.into_iter().next() {
                    Some(row) => Some(row),
                    // No intermediate row means the main statement cannot
                    // bind; treat as zero qualifying rows.
                    None => return Ok(Vec::new()),
                }
            }
            None => None,
        };

        let ctx = match &prelude_row {
            Some(row) => BindContext::new(request, upstream).with_prelude(row),
            None => BindContext::new(request, upstream),
        };
        let bound = bind(
            &definition.source_id,
            &definition.statement_template,
            &definition.params,
            &ctx,
        )?;

        let result = self.execute(&bound, deadline).await?;
        Ok(self.post.qualify(result.rows, definition))
    }

    async fn execute(
        &self,
        bound: &crate::binder::BoundQuery,
        deadline: Instant,
    ) -> Result<crate::source::SourceResult> {
        let client = self.sources.get(&bound.source_id)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.metrics.record_error(&bound.source_id);
            return Err(FeatureError::SourceTimeout {
                source_name: bound.source_id.clone(),
                timeout_ms: 0,
            });
        }

        let outcome = tokio::time::timeout(remaining, client.execute(bound, remaining)).await;
        match outcome {
            Ok(Ok(result)) => {
                self.metrics.record_execution(
                    &result.source_id,
                    result.latency_ms,
                    result.rows.len() as u64,
                );
                debug!(source = %result.source_id, rows = result.rows.len(), latency_ms = result.latency_ms, "source call");
                Ok(result)
            }
            Ok(Err(err)) => {
                self.metrics.record_error(&bound.source_id);
                Err(err)
            }
            Err(_) => {
                self.metrics.record_error(&bound.source_id);
                Err(FeatureError::SourceTimeout {
                    source_name: bound.source_id.clone(),
                    timeout_ms: remaining.as_millis() as u64,
                })
            }
        }
    }
}
