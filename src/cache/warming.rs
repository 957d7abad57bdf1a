//! Cache preloading.
//!
//! A `WarmSource` stands in for the authoritative store. The warmer copies
//! recent rows into the hot namespaces at startup and on a timer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::error::CacheError;
use super::registry::CacheRegistry;

/// Rows requested per namespace.
pub const DEFAULT_WARM_LIMIT: usize = 50;

/// Namespaces warmed by `warm_common`, with the identifier of their list key.
const WARM_TARGETS: [(&str, &str); 3] = [
    ("collection", "all"),
    ("content", "recent"),
    ("media", "recent"),
];

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("warm source failed for `{namespace}`: {message}")]
    Source { namespace: String, message: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl WarmError {
    pub fn source_failed(namespace: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            namespace: namespace.into(),
            message: message.into(),
        }
    }
}

/// One row to preload, keyed by its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmRow {
    pub id: String,
    pub value: Value,
}

impl WarmRow {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

#[async_trait]
pub trait WarmSource: Send + Sync {
    /// Up to `limit` rows for `namespace`, newest first.
    async fn load(&self, namespace: &str, limit: usize) -> Result<Vec<WarmRow>, WarmError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmDetail {
    pub namespace: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub warmed: usize,
    pub errors: usize,
    pub details: Vec<WarmDetail>,
}

pub struct CacheWarmer {
    registry: Arc<CacheRegistry>,
    source: Arc<dyn WarmSource>,
    limit: usize,
}

impl CacheWarmer {
    pub fn new(registry: Arc<CacheRegistry>, source: Arc<dyn WarmSource>) -> Self {
        Self {
            registry,
            source,
            limit: DEFAULT_WARM_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Warm `collection`, `content` and `media`.
    ///
    /// A failing namespace counts as one error and zero entries; the others
    /// are still warmed.
    pub async fn warm_common(&self) -> WarmReport {
        let mut report = WarmReport::default();

        for (namespace, list_id) in WARM_TARGETS {
            let count = match self.warm_target(namespace, list_id).await {
                Ok(count) => count,
                Err(error) => {
                    warn!(namespace, error = %error, "Cache warming failed");
                    report.errors += 1;
                    0
                }
            };
            report.warmed += count;
            report.details.push(WarmDetail {
                namespace: namespace.to_string(),
                count,
            });
        }

        info!(
            warmed = report.warmed,
            namespaces = report.details.len(),
            errors = report.errors,
            "Cache warmed"
        );
        report
    }

    /// Each row under `item:<id>` plus the whole batch under `list:<list_id>`.
    async fn warm_target(&self, namespace: &str, list_id: &str) -> Result<usize, WarmError> {
        let service = self.registry.service(namespace)?;
        let rows = self.source.load(namespace, self.limit).await?;

        for row in &rows {
            let key = service.generate_key("item", &row.id);
            service.set(&key, &row.value, None).await;
        }

        let list: Vec<&Value> = rows.iter().map(|row| &row.value).collect();
        service
            .set(&service.generate_key("list", list_id), &list, None)
            .await;

        Ok(rows.len() + 1)
    }

    /// Re-warm every `period`. The first run happens one period after the
    /// call; run `warm_common` yourself for an immediate preload.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        info!(interval_seconds = period.as_secs(), "Scheduling periodic cache warming");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.warm_common().await;
            }
        })
    }
}

/// Preload caller-supplied entries into one namespace.
pub async fn warm_namespace<T, K>(
    registry: &CacheRegistry,
    namespace: &str,
    entries: Vec<(K, T)>,
) -> Result<usize, CacheError>
where
    T: Serialize,
    K: AsRef<str>,
{
    let service = registry.service(namespace)?;
    let count = entries.len();
    service.set_many(entries, None).await;
    Ok(count)
}
