//! Fixture-backed warming for the `tiercache warm` command.
//!
//! A fixture is a TOML file with one array of tables per namespace:
//!
//! ```toml
//! [[content]]
//! id = "42"
//! value = { title = "Hello" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{
    CacheRegistry, CacheStats, CacheWarmer, WarmError, WarmReport, WarmRow, WarmSource,
};
use crate::config::Settings;
use crate::infra::error::InfraError;
use crate::replay::registry_from_settings;

#[derive(Debug, Clone, Deserialize)]
struct FixtureRow {
    id: String,
    value: Value,
}

/// Rows per namespace read from a fixture file, newest first.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    rows: BTreeMap<String, Vec<FixtureRow>>,
}

impl FixtureSource {
    pub fn parse(text: &str) -> Result<Self, InfraError> {
        let rows = toml::from_str(text)
            .map_err(|err| InfraError::scenario(format!("failed to parse warm fixture: {err}")))?;
        Ok(Self { rows })
    }

    pub async fn load(path: &Path) -> Result<Self, InfraError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }
}

#[async_trait]
impl WarmSource for FixtureSource {
    async fn load(&self, namespace: &str, limit: usize) -> Result<Vec<WarmRow>, WarmError> {
        Ok(self
            .rows
            .get(namespace)
            .map(|rows| {
                rows.iter()
                    .take(limit)
                    .map(|row| WarmRow::new(row.id.clone(), row.value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmSummary {
    pub report: WarmReport,
    pub stats: BTreeMap<String, CacheStats>,
}

/// A registry built from settings plus a warmer scheduled on
/// `cache.warm_interval`.
pub struct WarmCommand {
    registry: Arc<CacheRegistry>,
    warmer: Arc<CacheWarmer>,
    interval: Duration,
}

impl WarmCommand {
    pub fn new(settings: &Settings, source: Arc<dyn WarmSource>) -> Self {
        let registry = Arc::new(registry_from_settings(settings));
        let warmer = Arc::new(CacheWarmer::new(Arc::clone(&registry), source));
        Self {
            registry,
            warmer,
            interval: settings.cache.warm_interval,
        }
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Warm immediately and report per-namespace figures.
    pub async fn run_once(&self) -> WarmSummary {
        let report = self.warmer.warm_common().await;
        WarmSummary {
            report,
            stats: self.registry.all_stats(),
        }
    }

    /// Re-warm every configured interval until the handle is aborted.
    pub fn spawn_periodic(&self) -> JoinHandle<()> {
        info!(interval_seconds = self.interval.as_secs(), "Periodic warming enabled");
        Arc::clone(&self.warmer).spawn_periodic(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::config::SharedStoreKind;

    const FIXTURE: &str = r#"
[[content]]
id = "42"
value = { title = "Hello" }

[[content]]
id = "7"
value = { title = "Draft" }

[[media]]
id = "logo"
value = { path = "/logo.png" }
"#;

    fn settings() -> Settings {
        let mut settings = Settings::defaults();
        settings.cache.shared_store = SharedStoreKind::None;
        settings.cache.memory_budget_bytes = NonZeroUsize::new(1024 * 1024).expect("non-zero");
        settings.cache.warm_interval = Duration::from_secs(60);
        settings
    }

    fn command() -> WarmCommand {
        let source = FixtureSource::parse(FIXTURE).expect("valid fixture");
        WarmCommand::new(&settings(), Arc::new(source))
    }

    #[test]
    fn parses_rows_per_namespace() {
        let source = FixtureSource::parse(FIXTURE).expect("valid fixture");
        assert_eq!(source.namespaces().collect::<Vec<_>>(), vec!["content", "media"]);
    }

    #[test]
    fn malformed_fixture_is_an_error() {
        let error = FixtureSource::parse("[[content]]\nvalue = 1").expect_err("missing id");
        assert!(matches!(error, InfraError::Scenario { .. }));
    }

    #[tokio::test]
    async fn run_once_warms_fixture_rows() {
        let command = command();
        let summary = command.run_once().await;

        assert_eq!(summary.report.errors, 0);
        // Two items and a list in content, one of each in media, an empty list in collection.
        assert_eq!(summary.report.warmed, 3 + 2 + 1);
        assert_eq!(summary.stats["content"].entry_count, 3);

        let content = command.registry().service("content").expect("content");
        assert!(content.has(&content.generate_key("item", "42")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_warming_uses_configured_interval() {
        let command = command();
        assert_eq!(command.interval(), Duration::from_secs(60));
        let content = command.registry().service("content").expect("content");
        let key = content.generate_key("item", "42");

        let handle = command.spawn_periodic();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!content.has(&key).await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(content.has(&key).await);

        handle.abort();
    }
}
