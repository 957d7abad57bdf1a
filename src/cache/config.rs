//! Per-namespace cache policy.
//!
//! A `CacheConfig` is fixed once its `CacheService` is built; callers may
//! pass a `CacheOverride` to individual writes.

use serde::{Deserialize, Serialize};

const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_VERSION: &str = "v1";

/// Namespaces with built-in policies, in binding-table order.
pub const BUILTIN_NAMESPACES: [&str; 8] = [
    "content",
    "user",
    "session",
    "config",
    "plugin",
    "media",
    "api",
    "collection",
];

/// Cache policy for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Key prefix owned by this service.
    pub namespace: String,
    /// Time-to-live applied to every write.
    pub ttl_seconds: u64,
    /// Enable the process-local tier.
    pub memory_enabled: bool,
    /// Enable the shared key/value tier.
    pub kv_enabled: bool,
    /// Version tag appended to generated keys.
    pub version: String,
}

/// Partial policy merged over a base config for a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheOverride {
    pub ttl_seconds: Option<u64>,
    pub memory_enabled: Option<bool>,
    pub kv_enabled: Option<bool>,
    pub version: Option<String>,
}

impl CacheOverride {
    pub fn ttl(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds: Some(ttl_seconds),
            ..Default::default()
        }
    }
}

impl CacheConfig {
    /// Default policy for an arbitrary namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            memory_enabled: true,
            kv_enabled: true,
            version: DEFAULT_VERSION.to_string(),
        }
    }

    /// Built-in policy for a known namespace, or the default policy.
    pub fn for_namespace(namespace: &str) -> Self {
        let base = Self::new(namespace);
        match namespace {
            "content" => base,
            "user" => Self {
                ttl_seconds: 900,
                ..base
            },
            "session" => Self {
                ttl_seconds: 1800,
                kv_enabled: false,
                ..base
            },
            "config" => Self {
                ttl_seconds: 7200,
                ..base
            },
            "plugin" => Self {
                ttl_seconds: 7200,
                ..base
            },
            "media" => Self {
                ttl_seconds: 86_400,
                ..base
            },
            "api" => Self {
                ttl_seconds: 300,
                ..base
            },
            "collection" => Self {
                ttl_seconds: 7200,
                ..base
            },
            _ => base,
        }
    }

    /// Effective policy after applying a per-call override.
    pub fn merged(&self, overrides: Option<&CacheOverride>) -> CacheConfig {
        let Some(overrides) = overrides else {
            return self.clone();
        };
        CacheConfig {
            namespace: self.namespace.clone(),
            ttl_seconds: overrides.ttl_seconds.unwrap_or(self.ttl_seconds),
            memory_enabled: overrides.memory_enabled.unwrap_or(self.memory_enabled),
            kv_enabled: overrides.kv_enabled.unwrap_or(self.kv_enabled),
            version: overrides
                .version
                .clone()
                .unwrap_or_else(|| self.version.clone()),
        }
    }

    /// Prefix shared by every key of this namespace.
    pub fn key_prefix(&self) -> String {
        format!("{}:", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::new("anything");
        assert_eq!(config.namespace, "anything");
        assert_eq!(config.ttl_seconds, 3600);
        assert!(config.memory_enabled);
        assert!(config.kv_enabled);
        assert_eq!(config.version, "v1");
    }

    #[test]
    fn builtin_content_policy() {
        let config = CacheConfig::for_namespace("content");
        assert_eq!(config.namespace, "content");
        assert_eq!(config.ttl_seconds, 3600);
    }

    #[test]
    fn unknown_namespace_gets_default_policy() {
        let config = CacheConfig::for_namespace("unknown");
        assert_eq!(config.namespace, "unknown");
        assert_eq!(config.ttl_seconds, 3600);
        assert_eq!(config.version, "v1");
    }

    #[test]
    fn every_builtin_namespace_is_known() {
        for namespace in BUILTIN_NAMESPACES {
            assert_eq!(CacheConfig::for_namespace(namespace).namespace, namespace);
        }
    }

    #[test]
    fn override_replaces_only_given_fields() {
        let base = CacheConfig::for_namespace("content");
        let merged = base.merged(Some(&CacheOverride::ttl(10)));

        assert_eq!(merged.ttl_seconds, 10);
        assert_eq!(merged.version, base.version);
        assert_eq!(merged.memory_enabled, base.memory_enabled);
        assert_eq!(merged.namespace, base.namespace);
    }

    #[test]
    fn no_override_is_identity() {
        let base = CacheConfig::for_namespace("media");
        assert_eq!(base.merged(None), base);
    }
}
