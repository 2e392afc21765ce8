//! In-Memory Source
//!
//! A fixture-backed source client used by the test suite and the CLI demo.
//! Rows are registered per statement template; failure modes and artificial
//! latency can be injected to exercise the router's fallback transitions.

use crate::binder::BoundQuery;
use crate::error::{FeatureError, Result};
use crate::source::{SourceClient, SourceResult, SourceRow};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

lazy_static! {
    static ref POSITIONAL: Regex = Regex::new(r"\$\d+").unwrap();
    static ref NAMED: Regex = Regex::new(r"(^|[^:]):[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

/// Statement templates and bound statements normalize to the same key, so
/// fixtures are registered against the template text a definition declares.
fn normalize(statement: &str) -> String {
    let statement = POSITIONAL.replace_all(statement, "?");
    NAMED.replace_all(&statement, "${1}?").into_owned()
}

#[derive(Debug, Clone)]
enum Fixture {
    /// Static rows, optionally gated on an exact parameter match.
    Rows {
        params: Option<Vec<Value>>,
        rows: Vec<SourceRow>,
    },
    /// A single row echoing the bound parameters under the given columns.
    Echo { columns: Vec<String> },
}

/// Injected failure for the next N calls (or every call).
#[derive(Debug, Clone)]
pub enum FailureMode {
    Timeout,
    Connection(String),
    Query(String),
}

struct Injection {
    mode: FailureMode,
    remaining: Option<u64>,
}

pub struct MemorySource {
    source_id: String,
    fixtures: Mutex<HashMap<String, Vec<Fixture>>>,
    injection: Mutex<Option<Injection>>,
    delay: Mutex<Option<Duration>>,
    executions: AtomicU64,
}

impl MemorySource {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            fixtures: Mutex::new(HashMap::new()),
            injection: Mutex::new(None),
            delay: Mutex::new(None),
            executions: AtomicU64::new(0),
        }
    }

    /// Register rows returned for any parameters bound to this template.
    pub fn insert_rows(&self, template: &str, rows: Vec<SourceRow>) {
        self.fixtures
            .lock()
            .unwrap()
            .entry(normalize(template))
            .or_default()
            .push(Fixture::Rows { params: None, rows });
    }

    /// Register rows returned only when the bound parameters match exactly.
    pub fn insert_rows_for_params(&self, template: &str, params: Vec<Value>, rows: Vec<SourceRow>) {
        self.fixtures
            .lock()
            .unwrap()
            .entry(normalize(template))
            .or_default()
            .push(Fixture::Rows {
                params: Some(params),
                rows,
            });
    }

    /// Register a pass-through fixture: one row echoing the bound
    /// parameters under the given column names, in order.
    pub fn insert_echo(&self, template: &str, columns: &[&str]) {
        self.fixtures
            .lock()
            .unwrap()
            .entry(normalize(template))
            .or_default()
            .push(Fixture::Echo {
                columns: columns.iter().map(|c| c.to_string()).collect(),
            });
    }

    pub fn fail_always(&self, mode: FailureMode) {
        *self.injection.lock().unwrap() = Some(Injection {
            mode,
            remaining: None,
        });
    }

    pub fn fail_times(&self, mode: FailureMode, times: u64) {
        *self.injection.lock().unwrap() = Some(Injection {
            mode,
            remaining: Some(times),
        });
    }

    pub fn clear_failures(&self) {
        *self.injection.lock().unwrap() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Total number of execute calls observed, including failed ones.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> Option<FailureMode> {
        let mut guard = self.injection.lock().unwrap();
        let injection = guard.as_mut()?;
        match injection.remaining {
            Some(0) => {
                *guard = None;
                None
            }
            Some(ref mut n) => {
                *n -= 1;
                Some(injection.mode.clone())
            }
            None => Some(injection.mode.clone()),
        }
    }

    fn rows_for(&self, query: &BoundQuery) -> Vec<SourceRow> {
        let fixtures = self.fixtures.lock().unwrap();
        let Some(entries) = fixtures.get(&normalize(&query.statement)) else {
            return Vec::new();
        };
        let bound: Vec<Value> = query.params.iter().map(|p| p.as_json()).collect();

        // Exact parameter matches win over catch-all fixtures.
        for fixture in entries {
            if let Fixture::Rows {
                params: Some(expected),
                rows,
            } = fixture
            {
                if *expected == bound {
                    return rows.clone();
                }
            }
        }
        for fixture in entries {
            match fixture {
                Fixture::Rows { params: None, rows } => return rows.clone(),
                Fixture::Echo { columns } => {
                    let mut row = SourceRow::new();
                    for (column, value) in columns.iter().zip(bound.iter()) {
                        row.insert(column.clone(), value.clone());
                    }
                    return vec![row];
                }
                _ => {}
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn execute(&self, query: &BoundQuery, timeout: Duration) -> Result<SourceResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(mode) = self.take_injected_failure() {
            return Err(match mode {
                FailureMode::Timeout => FeatureError::SourceTimeout {
                    source_name: self.source_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                },
                FailureMode::Connection(msg) => FeatureError::SourceConnection(msg),
                FailureMode::Query(msg) => FeatureError::SourceQuery(msg),
            });
        }

        Ok(SourceResult {
            source_id: self.source_id.clone(),
            rows: self.rows_for(query),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::ParamValue;
    use serde_json::json;

    fn bound(statement: &str, params: Vec<ParamValue>) -> BoundQuery {
        BoundQuery {
            source_id: "mem".to_string(),
            statement: statement.to_string(),
            params,
        }
    }

    #[test]
    fn test_template_and_bound_statement_normalize_alike() {
        assert_eq!(
            normalize("SELECT d FROM t WHERE uid = :route_uid AND p = :postcode"),
            normalize("SELECT d FROM t WHERE uid = $1 AND p = $2"),
        );
        // casts are not placeholders
        assert_ne!(normalize("SELECT x::text"), normalize("SELECT ?::text"));
    }

    #[tokio::test]
    async fn test_param_scoped_fixture_wins() {
        let source = MemorySource::new("mem");
        let template = "SELECT density FROM outcodes WHERE outcode = :outcode";
        source.insert_rows(
            template,
            vec![[("density".to_string(), json!(1000.0))].into_iter().collect()],
        );
        source.insert_rows_for_params(
            template,
            vec![json!("EC1A")],
            vec![[("density".to_string(), json!(8200.0))].into_iter().collect()],
        );

        let result = source
            .execute(
                &bound(
                    "SELECT density FROM outcodes WHERE outcode = $1",
                    vec![ParamValue::Text("EC1A".to_string())],
                ),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(result.rows[0].get("density"), Some(&json!(8200.0)));
        assert_eq!(source.executions(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_is_counted_down() {
        let source = MemorySource::new("mem");
        source.fail_times(FailureMode::Connection("refused".to_string()), 1);

        let query = bound("SELECT 1", Vec::new());
        let err = source
            .execute(&query, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureError::SourceConnection(_)));

        // Injection consumed; subsequent calls succeed with zero rows.
        let result = source.execute(&query, Duration::from_secs(1)).await.unwrap();
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_echo_fixture_reflects_params() {
        let source = MemorySource::new("mem");
        let template = "SELECT :avg_population_density AS avg_population_density";
        source.insert_echo(template, &["avg_population_density"]);

        let result = source
            .execute(
                &bound(
                    "SELECT $1 AS avg_population_density",
                    vec![ParamValue::Float(4210.5)],
                ),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(
            result.rows[0].get("avg_population_density"),
            Some(&json!(4210.5))
        );
    }
}
