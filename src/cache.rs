//! Cache Layer
//!
//! Resolved values keyed by (feature name, entity id) with expiry derived
//! from the winning resolver's declared TTL. Concurrent identical requests
//! inside an uncached window coalesce onto a single in-flight resolution
//! per key, so a cold key costs the backing stores exactly one execution.

use crate::error::Result;
use crate::model::ResolvedFeature;
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

type CacheKey = (String, String);

#[derive(Default)]
pub struct FeatureCache {
    entries: DashMap<CacheKey, ResolvedFeature>,
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh cached value, if one exists under the caller's staleness
    /// tolerance.
    pub fn get(
        &self,
        feature: &str,
        entity_id: &str,
        staleness_tolerance_ms: Option<u64>,
    ) -> Option<ResolvedFeature> {
        let key = (feature.to_string(), entity_id.to_string());
        let entry = self.entries.get(&key)?;
        if entry.is_fresh(Utc::now(), staleness_tolerance_ms) {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Store a resolved value, superseding any previous entry for its key.
    pub fn insert(&self, resolved: ResolvedFeature) {
        let key = (resolved.feature.clone(), resolved.entity_id.clone());
        self.entries.insert(key, resolved);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serve from cache or run `resolve` with at-most-one concurrent
    /// resolution per key. Waiters blocked on the in-flight lock re-check
    /// the cache and observe the leader's value without touching the
    /// backing stores.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        feature: &str,
        entity_id: &str,
        staleness_tolerance_ms: Option<u64>,
        resolve: F,
    ) -> Result<ResolvedFeature>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResolvedFeature>>,
    {
        if let Some(hit) = self.get(feature, entity_id, staleness_tolerance_ms) {
            debug!(feature, entity_id, "cache hit");
            return Ok(hit);
        }

        let key = (feature.to_string(), entity_id.to_string());
        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _guard = lock.lock().await;

        // A coalesced waiter finds the leader's freshly inserted value here.
        if let Some(hit) = self.get(feature, entity_id, staleness_tolerance_ms) {
            debug!(feature, entity_id, "cache hit after coalesce");
            return Ok(hit);
        }

        let resolved = resolve().await?;
        self.insert(resolved.clone());
        self.inflight.remove(&key);
        Ok(resolved)
    }
}
