//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    num::NonZeroUsize,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    BUILTIN_NAMESPACES, CacheConfig, DEFAULT_LOG_CAPACITY, DEFAULT_MEMORY_BUDGET_BYTES,
};

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, ReplayArgs, WarmArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tiercache";
const ENV_PREFIX: &str = "TIERCACHE";
const DEFAULT_WARM_INTERVAL_SECS: u64 = 300;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    /// Effective policy for every built-in or configured namespace.
    pub namespaces: BTreeMap<String, CacheConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub memory_budget_bytes: NonZeroUsize,
    pub event_log_capacity: NonZeroUsize,
    pub warm_interval: Duration,
    pub shared_store: SharedStoreKind,
}

/// Backend behind the shared tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedStoreKind {
    /// Memory tier only.
    None,
    /// Process-local key/value store.
    Memory,
}

impl FromStr for SharedStoreKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown shared store `{other}` (expected none|memory)")),
        }
    }
}

impl fmt::Display for SharedStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Memory => "memory",
        })
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    namespaces: HashMap<String, RawNamespaceSettings>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(bytes) = overrides.memory_budget_bytes {
            self.cache.memory_budget_bytes = Some(bytes);
        }
        if let Some(capacity) = overrides.event_log_capacity {
            self.cache.event_log_capacity = Some(capacity);
        }
        if let Some(seconds) = overrides.warm_interval_seconds {
            self.cache.warm_interval_seconds = Some(seconds);
        }
        if let Some(kind) = overrides.shared_store.as_ref() {
            self.cache.shared_store = Some(kind.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            cache: build_cache_settings(raw.cache)?,
            namespaces: build_namespace_policies(raw.namespaces)?,
        })
    }

    /// Built-in defaults without reading files or the environment.
    #[cfg(test)]
    pub(crate) fn defaults() -> Self {
        Self::from_raw(RawSettings::default()).expect("built-in defaults are valid")
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let memory_budget_bytes = non_zero_usize(
        cache
            .memory_budget_bytes
            .unwrap_or(DEFAULT_MEMORY_BUDGET_BYTES as u64),
        "cache.memory_budget_bytes",
    )?;
    let event_log_capacity = non_zero_usize(
        cache
            .event_log_capacity
            .unwrap_or(DEFAULT_LOG_CAPACITY as u64),
        "cache.event_log_capacity",
    )?;

    let warm_interval_seconds = cache
        .warm_interval_seconds
        .unwrap_or(DEFAULT_WARM_INTERVAL_SECS);
    if warm_interval_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.warm_interval_seconds",
            "must be greater than zero",
        ));
    }

    let shared_store = match cache.shared_store {
        Some(kind) => SharedStoreKind::from_str(&kind)
            .map_err(|reason| LoadError::invalid("cache.shared_store", reason))?,
        None => SharedStoreKind::Memory,
    };

    Ok(CacheSettings {
        memory_budget_bytes,
        event_log_capacity,
        warm_interval: Duration::from_secs(warm_interval_seconds),
        shared_store,
    })
}

fn build_namespace_policies(
    namespaces: HashMap<String, RawNamespaceSettings>,
) -> Result<BTreeMap<String, CacheConfig>, LoadError> {
    let mut policies: BTreeMap<String, CacheConfig> = BUILTIN_NAMESPACES
        .iter()
        .map(|name| (name.to_string(), CacheConfig::for_namespace(name)))
        .collect();

    for (name, raw) in namespaces {
        let name = name.trim().to_string();
        if name.is_empty() || name.contains(':') {
            return Err(LoadError::invalid(
                format!("namespaces.{name}"),
                "namespace names must be non-empty and must not contain `:`",
            ));
        }

        let mut policy = CacheConfig::for_namespace(&name);
        if let Some(ttl) = raw.ttl_seconds {
            if ttl == 0 {
                return Err(LoadError::invalid(
                    format!("namespaces.{name}.ttl_seconds"),
                    "must be greater than zero",
                ));
            }
            policy.ttl_seconds = ttl;
        }
        if let Some(enabled) = raw.memory_enabled {
            policy.memory_enabled = enabled;
        }
        if let Some(enabled) = raw.kv_enabled {
            policy.kv_enabled = enabled;
        }
        if let Some(version) = raw.version {
            policy.version = version.trim().to_string();
        }
        policies.insert(name, policy);
    }

    Ok(policies)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    memory_budget_bytes: Option<u64>,
    event_log_capacity: Option<u64>,
    warm_interval_seconds: Option<u64>,
    shared_store: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNamespaceSettings {
    ttl_seconds: Option<u64>,
    memory_enabled: Option<bool>,
    kv_enabled: Option<bool>,
    version: Option<String>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
