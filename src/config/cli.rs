use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::cache::EntityType;

/// Command-line arguments for the Tessera binary.
#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Tessera query cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TESSERA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Keep entity lists cached and fresh, logging every state transition.
    Watch(Box<WatchArgs>),
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub overrides: WatchOverrides,

    /// Entity lists to watch (`linodes`, `volumes`, ...). Defaults to linodes and volumes.
    #[arg(long = "entity", value_name = "TYPE")]
    pub entities: Vec<EntityType>,

    /// Page size of the watched lists.
    #[arg(long = "page-size", default_value_t = 25, value_parser = clap::value_parser!(u32).range(1..=500))]
    pub page_size: u32,
}

impl Default for WatchArgs {
    fn default() -> Self {
        Self {
            overrides: WatchOverrides::default(),
            entities: Vec::new(),
            page_size: 25,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the API base URL.
    #[arg(long = "api-base-url", value_name = "URL")]
    pub api_base_url: Option<String>,

    /// Override the API bearer token.
    #[arg(long = "api-token", env = "TESSERA_API_TOKEN", value_name = "TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Override the API request timeout.
    #[arg(long = "api-timeout-seconds", value_name = "SECONDS")]
    pub api_timeout_seconds: Option<u64>,

    /// Override the default staleness window in milliseconds.
    #[arg(long = "cache-stale-time-ms", value_name = "MS")]
    pub cache_stale_time_ms: Option<u64>,

    /// Override how long unsubscribed entries survive, in milliseconds.
    #[arg(long = "cache-gc-time-ms", value_name = "MS")]
    pub cache_gc_time_ms: Option<u64>,

    /// Override the maximum number of cached entries.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub cache_max_entries: Option<usize>,

    /// Override the fetch retry budget.
    #[arg(long = "cache-retry-max-attempts", value_name = "COUNT")]
    pub cache_retry_max_attempts: Option<u32>,

    /// Override the maximum event queue length.
    #[arg(long = "cache-event-queue-limit", value_name = "COUNT")]
    pub cache_event_queue_limit: Option<usize>,

    /// Toggle the account events poller.
    #[arg(
        long = "events-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub events_enabled: Option<bool>,

    /// Override the events poll interval in milliseconds.
    #[arg(long = "events-interval-ms", value_name = "MS")]
    pub events_interval_ms: Option<u64>,

    /// Override the events poll interval used while events are in progress.
    #[arg(long = "events-fast-interval-ms", value_name = "MS")]
    pub events_fast_interval_ms: Option<u64>,
}
