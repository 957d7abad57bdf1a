use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tiercache_memory_hit_total",
            Unit::Count,
            "Total number of memory-tier cache hits."
        );
        describe_counter!(
            "tiercache_memory_miss_total",
            Unit::Count,
            "Total number of memory-tier cache misses."
        );
        describe_counter!(
            "tiercache_kv_hit_total",
            Unit::Count,
            "Total number of shared-tier cache hits."
        );
        describe_counter!(
            "tiercache_kv_miss_total",
            Unit::Count,
            "Total number of shared-tier cache misses."
        );
        describe_counter!(
            "tiercache_memory_evict_total",
            Unit::Count,
            "Total number of memory-tier evictions due to the byte budget."
        );
        describe_counter!(
            "tiercache_kv_error_total",
            Unit::Count,
            "Total number of shared-tier operations that failed and were ignored."
        );
        describe_counter!(
            "tiercache_invalidated_total",
            Unit::Count,
            "Total number of keys removed by pattern invalidation."
        );
        describe_counter!(
            "tiercache_event_handler_error_total",
            Unit::Count,
            "Total number of event handlers that failed or panicked."
        );
        describe_histogram!(
            "tiercache_emit_ms",
            Unit::Milliseconds,
            "Event emit latency including all handlers, in milliseconds."
        );
        describe_gauge!(
            "tiercache_event_log_len",
            Unit::Count,
            "Current number of entries in the event log."
        );
    });
}
