use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Duplicate priority {priority} for feature '{feature}'")]
    DuplicatePriority { feature: String, priority: u32 },

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Cyclic feature dependency: {0}")]
    CyclicDependency(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unbound parameter: {0}")]
    UnboundParameter(String),

    #[error("Missing entity key: {0}")]
    MissingKey(String),

    #[error("Source '{source_name}' timed out after {timeout_ms}ms")]
    SourceTimeout { source_name: String, timeout_ms: u64 },

    #[error("Source connection error: {0}")]
    SourceConnection(String),

    #[error("Source query error: {0}")]
    SourceQuery(String),

    #[error("Unresolvable feature: {0}")]
    Unresolvable(String),

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Derivation error: {0}")]
    Derivation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeatureError {
    /// Errors the router recovers from by falling over to the next resolver.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FeatureError::SourceTimeout { .. }
                | FeatureError::SourceConnection(_)
                | FeatureError::SourceQuery(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FeatureError>;
