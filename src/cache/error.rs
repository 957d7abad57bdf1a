use thiserror::Error;

/// Failures surfaced by the cache core itself.
///
/// Tier and handler failures never reach callers; only construction-time
/// problems and explicit lookups of unknown namespaces do.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown cache namespace `{0}`")]
    UnknownNamespace(String),
}

impl CacheError {
    pub fn unknown_namespace(namespace: impl Into<String>) -> Self {
        Self::UnknownNamespace(namespace.into())
    }
}

/// Failures reported by an external key/value store.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    #[error("shared store payload could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl KvError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Failure returned by an event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
