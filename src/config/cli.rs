use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the tiercache binary.
#[derive(Debug, Parser)]
#[command(
    name = "tiercache",
    version,
    about = "Inspect and exercise the tiered content cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TIERCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the resolved per-namespace cache policies as JSON.
    Namespaces,
    /// Print the event invalidation table as JSON.
    Bindings,
    /// Seed a fresh cache, replay events from a TOML scenario and report
    /// what survived.
    Replay(ReplayArgs),
    /// Warm the hot namespaces from a TOML fixture and report the result.
    Warm(WarmArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ReplayArgs {
    /// Scenario file with `[[seed]]` and `[[events]]` tables.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    /// Fixture file with one `[[namespace]]` table of `id`/`value` rows per namespace.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Keep re-warming on `cache.warm_interval_seconds` until interrupted.
    #[arg(long)]
    pub follow: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the per-namespace memory budget in bytes.
    #[arg(long = "cache-memory-budget-bytes", value_name = "BYTES", global = true)]
    pub memory_budget_bytes: Option<u64>,

    /// Override the number of retained event log entries.
    #[arg(long = "cache-event-log-capacity", value_name = "COUNT", global = true)]
    pub event_log_capacity: Option<u64>,

    /// Override the periodic warming interval in seconds.
    #[arg(long = "cache-warm-interval-seconds", value_name = "SECONDS", global = true)]
    pub warm_interval_seconds: Option<u64>,

    /// Override the shared store backend (none|memory).
    #[arg(long = "cache-shared-store", value_name = "KIND", global = true)]
    pub shared_store: Option<String>,
}
