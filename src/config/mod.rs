//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::PollerConfig;

mod cli;

pub use cli::{CliArgs, Command, WatchArgs, WatchOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tessera";
const DEFAULT_API_BASE_URL: &str = "https://api.linode.com/v4/";
const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STALE_TIME_MS: u64 = 60_000;
const DEFAULT_GC_TIME_MS: u64 = 300_000;
const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_ENTRIES: usize = 1_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1_024;
const DEFAULT_SEEN_EVENTS_LIMIT: usize = 512;
const DEFAULT_EVENTS_INTERVAL_MS: u64 = 16_000;
const DEFAULT_EVENTS_FAST_INTERVAL_MS: u64 = 2_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub api: ApiSettings,
    pub cache: CacheSettings,
    pub events: EventsSettings,
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
pub struct ApiSettings {
    /// Always ends with `/` so relative paths join below it.
    pub base_url: Url,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub stale_time_ms: u64,
    pub gc_time_ms: u64,
    pub gc_interval_ms: u64,
    pub max_entries: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub consume_batch_limit: usize,
    pub event_queue_limit: usize,
    pub seen_events_limit: usize,
}

#[derive(Debug, Clone)]
pub struct EventsSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub fast_interval_ms: u64,
}

impl EventsSettings {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval_ms: self.interval_ms,
            fast_interval_ms: self.fast_interval_ms,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
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

    builder = builder.add_source(Environment::with_prefix("TESSERA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Watch(args)) => raw.apply_watch_overrides(&args.overrides),
        None => raw.apply_watch_overrides(&WatchOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    api: RawApiSettings,
    cache: RawCacheSettings,
    events: RawEventsSettings,
}

impl RawSettings {
    fn apply_watch_overrides(&mut self, overrides: &WatchOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.api_base_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
        if let Some(token) = overrides.api_token.as_ref() {
            self.api.token = Some(token.clone());
        }
        if let Some(seconds) = overrides.api_timeout_seconds {
            self.api.timeout_seconds = Some(seconds);
        }
        if let Some(ms) = overrides.cache_stale_time_ms {
            self.cache.stale_time_ms = Some(ms);
        }
        if let Some(ms) = overrides.cache_gc_time_ms {
            self.cache.gc_time_ms = Some(ms);
        }
        if let Some(limit) = overrides.cache_max_entries {
            self.cache.max_entries = Some(limit);
        }
        if let Some(attempts) = overrides.cache_retry_max_attempts {
            self.cache.retry_max_attempts = Some(attempts);
        }
        if let Some(limit) = overrides.cache_event_queue_limit {
            self.cache.event_queue_limit = Some(limit);
        }
        if let Some(enabled) = overrides.events_enabled {
            self.events.enabled = Some(enabled);
        }
        if let Some(ms) = overrides.events_interval_ms {
            self.events.interval_ms = Some(ms);
        }
        if let Some(ms) = overrides.events_fast_interval_ms {
            self.events.fast_interval_ms = Some(ms);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            api,
            cache,
            events,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            api: build_api_settings(api)?,
            cache: build_cache_settings(cache)?,
            events: build_events_settings(events)?,
        })
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

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let raw_url = api
        .base_url
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let trimmed = raw_url.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let base_url = Url::parse(&normalized)
        .map_err(|err| LoadError::invalid("api.base_url", format!("invalid url: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "api.base_url",
            "scheme must be http or https",
        ));
    }

    let token = api.token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let timeout_secs = api.timeout_seconds.unwrap_or(DEFAULT_API_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "api.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ApiSettings {
        base_url,
        token,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let retry_base_delay_ms = cache
        .retry_base_delay_ms
        .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);
    let retry_max_delay_ms = cache
        .retry_max_delay_ms
        .unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS);
    if retry_max_delay_ms < retry_base_delay_ms {
        return Err(LoadError::invalid(
            "cache.retry_max_delay_ms",
            "must not be smaller than cache.retry_base_delay_ms",
        ));
    }

    Ok(CacheSettings {
        stale_time_ms: cache.stale_time_ms.unwrap_or(DEFAULT_STALE_TIME_MS),
        gc_time_ms: cache.gc_time_ms.unwrap_or(DEFAULT_GC_TIME_MS),
        gc_interval_ms: positive_u64(
            cache.gc_interval_ms.unwrap_or(DEFAULT_GC_INTERVAL_MS),
            "cache.gc_interval_ms",
        )?,
        max_entries: positive_usize(
            cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
            "cache.max_entries",
        )?,
        retry_max_attempts: cache
            .retry_max_attempts
            .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
        retry_base_delay_ms,
        retry_max_delay_ms,
        consume_batch_limit: positive_usize(
            cache
                .consume_batch_limit
                .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT),
            "cache.consume_batch_limit",
        )?,
        event_queue_limit: positive_usize(
            cache.event_queue_limit.unwrap_or(DEFAULT_EVENT_QUEUE_LIMIT),
            "cache.event_queue_limit",
        )?,
        seen_events_limit: positive_usize(
            cache.seen_events_limit.unwrap_or(DEFAULT_SEEN_EVENTS_LIMIT),
            "cache.seen_events_limit",
        )?,
    })
}

fn build_events_settings(events: RawEventsSettings) -> Result<EventsSettings, LoadError> {
    Ok(EventsSettings {
        enabled: events.enabled.unwrap_or(true),
        interval_ms: positive_u64(
            events.interval_ms.unwrap_or(DEFAULT_EVENTS_INTERVAL_MS),
            "events.interval_ms",
        )?,
        fast_interval_ms: positive_u64(
            events
                .fast_interval_ms
                .unwrap_or(DEFAULT_EVENTS_FAST_INTERVAL_MS),
            "events.fast_interval_ms",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    base_url: Option<String>,
    token: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    stale_time_ms: Option<u64>,
    gc_time_ms: Option<u64>,
    gc_interval_ms: Option<u64>,
    max_entries: Option<usize>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    consume_batch_limit: Option<usize>,
    event_queue_limit: Option<usize>,
    seen_events_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEventsSettings {
    enabled: Option<bool>,
    interval_ms: Option<u64>,
    fast_interval_ms: Option<u64>,
}

fn positive_u64(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn positive_usize(value: usize, key: &'static str) -> Result<usize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
