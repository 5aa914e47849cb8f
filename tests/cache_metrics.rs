use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use serial_test::serial;
use tessera::cache::{
    CacheConfig, EntityRef, EntityType, EventAction, Fetcher, KeyPattern, MutationDefinition,
    MutationEffect, Operation, QueryError, QueryRegistry, ServerEvent, Staleness, Updater,
};
use tessera::client::QueryClient;
use tessera::queries::MutationCatalog;
use tessera_api_types::EventStatus;

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        snapshotter
    })
}

fn metric_names() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

fn counter_total(name: &str) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(composite_key, _, _, _)| composite_key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

fn volume_registry(calls: &Arc<AtomicUsize>) -> QueryRegistry {
    let calls = Arc::clone(calls);
    let registry = QueryRegistry::new();
    registry
        .register_fn(
            "volumes",
            KeyPattern::new().exact("volumes").any("detail"),
            Fetcher::from_fn(move |ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                let id = EntityType::id_of(&ctx.key);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!({"id": id, "label": "data"}))
                }
            }),
            Staleness::Default,
        )
        .expect("register volumes");
    registry
}

#[tokio::test(start_paused = true)]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    snapshotter();

    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        gc_time_ms: 0,
        event_queue_limit: 1,
        ..CacheConfig::default()
    };
    let client = QueryClient::new(config, Arc::new(volume_registry(&calls)), MutationCatalog::new());
    let first = EntityType::Volume.detail_key(1);
    let second = EntityType::Volume.detail_key(2);

    // miss + coalesced, then hit
    let (a, b) = tokio::join!(client.ensure_fresh(&first), client.ensure_fresh(&first));
    a.expect("first reader");
    b.expect("second reader");
    client.ensure_fresh(&first).await.expect("cached read");
    client.ensure_fresh(&second).await.expect("second entity");

    // invalidation + removal
    client.invalidate(&EntityType::Volume.root());
    client.remove(&second);

    // queue overflow, then consumption
    let invalidator = client.invalidator();
    for id in [10, 11] {
        invalidator.enqueue(ServerEvent::new(
            id,
            EntityRef::new(EntityType::Volume, 1),
            EventAction::Updated,
            EventStatus::Finished,
        ));
    }
    invalidator.consumer().consume_all();

    // expired unsubscribed entries
    assert!(client.collect_garbage() >= 1);

    let names = metric_names();
    let expected = [
        "tessera_cache_hit_total",
        "tessera_cache_miss_total",
        "tessera_cache_coalesced_total",
        "tessera_cache_evict_total",
        "tessera_cache_entries",
        "tessera_fetch_ms",
        "tessera_invalidate_total",
        "tessera_event_queue_len",
        "tessera_event_dropped_total",
        "tessera_event_consume_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn failed_optimistic_mutation_counts_a_rollback() {
    snapshotter();
    let rollbacks_before = counter_total("tessera_mutation_rollback_total");

    let calls = Arc::new(AtomicUsize::new(0));
    let client = QueryClient::new(
        CacheConfig::default(),
        Arc::new(volume_registry(&calls)),
        MutationCatalog::new(),
    );
    let detail = EntityType::Volume.detail_key(5);
    client.ensure_fresh(&detail).await.expect("detail loads");

    let patch_key = detail.clone();
    let resize = MutationDefinition::from_fn("volumes.resize", EntityType::Volume, Operation::Action, |_payload| async {
        Err(QueryError::server(503, "Service Unavailable"))
    })
    .optimistic(move |payload| {
        vec![MutationEffect::patch(
            patch_key.clone(),
            Updater::merge(json!({"size": payload["size"]})),
        )]
    });

    client
        .mutate(&resize, json!({"id": 5, "size": 40}))
        .await
        .expect_err("write fails");

    assert!(metric_names().contains("tessera_mutation_total"));
    assert_eq!(counter_total("tessera_mutation_rollback_total"), rollbacks_before + 1);
    assert_eq!(client.read(&detail).data.as_deref().and_then(|data| data.get("size")), None);
}
