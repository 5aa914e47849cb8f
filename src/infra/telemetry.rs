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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tessera_cache_hit_total",
            Unit::Count,
            "Reads served from a fresh cache entry."
        );
        describe_counter!(
            "tessera_cache_miss_total",
            Unit::Count,
            "Reads that started a fetch."
        );
        describe_counter!(
            "tessera_cache_coalesced_total",
            Unit::Count,
            "Reads that joined a fetch already in flight."
        );
        describe_counter!(
            "tessera_cache_evict_total",
            Unit::Count,
            "Entries evicted by the garbage collector."
        );
        describe_gauge!(
            "tessera_cache_entries",
            Unit::Count,
            "Current number of cache entries."
        );
        describe_histogram!(
            "tessera_fetch_ms",
            Unit::Milliseconds,
            "Fetch latency including retries, in milliseconds."
        );
        describe_counter!(
            "tessera_fetch_retry_total",
            Unit::Count,
            "Fetch attempts retried after a transient error."
        );
        describe_counter!(
            "tessera_fetch_error_total",
            Unit::Count,
            "Fetches that settled with an error."
        );
        describe_counter!(
            "tessera_invalidate_total",
            Unit::Count,
            "Entries matched by invalidation or removal."
        );
        describe_counter!(
            "tessera_mutation_total",
            Unit::Count,
            "Mutations executed, by operation and result."
        );
        describe_counter!(
            "tessera_mutation_rollback_total",
            Unit::Count,
            "Optimistic updates rolled back after a failed write."
        );
        describe_gauge!(
            "tessera_event_queue_len",
            Unit::Count,
            "Current number of pending server events in the queue."
        );
        describe_counter!(
            "tessera_event_dropped_total",
            Unit::Count,
            "Server events dropped due to queue overflow."
        );
        describe_histogram!(
            "tessera_event_consume_ms",
            Unit::Milliseconds,
            "Event consumption latency in milliseconds."
        );
    });
}
