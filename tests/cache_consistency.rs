//! End-to-end invalidation, gating and warming behaviour through the public engine API.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cachekeeper::cache::{
    CacheCategory, CacheKey, ComputeError, WarmError, WarmPass, WarmStrategy, WarmingTask, cached,
    warm_fn,
};
use serde_json::json;

use common::{context, engine, failing_engine};

#[test]
fn translation_ttl_jitter_stays_within_ten_percent() {
    let engine = engine();
    for _ in 0..1000 {
        let ttl = engine
            .ttl()
            .ttl_with_jitter(&CacheCategory::Translation, 10);
        assert!((77_760..=95_040).contains(&ttl), "ttl {ttl} escaped the band");
    }
}

#[tokio::test]
async fn patient_update_cascades_into_record_keys() {
    let engine = engine();
    let adapter = engine.adapter();
    for key in [
        "patient:42",
        "patient:42:records",
        "health_record:vitals:42",
        "health_record:labs:42",
        "health_record:vitals:7",
        "patient:7",
    ] {
        assert!(adapter.set(key, Bytes::from_static(b"{}"), None).await);
    }

    let report = engine
        .trigger_invalidation("patient_update", &context(&[("patient_id", "42")]))
        .await;

    assert_eq!(report.rules_applied, ["patient_update", "patient_records_update"]);
    assert_eq!(report.store_errors, 0);
    assert!(!adapter.exists("patient:42").await);
    assert!(!adapter.exists("patient:42:records").await);
    assert!(!adapter.exists("health_record:vitals:42").await);
    assert!(!adapter.exists("health_record:labs:42").await);
    assert!(adapter.exists("health_record:vitals:7").await);
    assert!(adapter.exists("patient:7").await);
}

#[tokio::test]
async fn oversized_results_are_never_written() {
    let engine = engine();
    let query = engine.query();
    let key = query.build_key("patients_list", &json!({"ward": "north"}), None);
    let rows: Vec<u32> = (0..1500).collect();

    let stored = query
        .cache_result("patients_list", &key, &rows, &CacheCategory::Record)
        .await;

    assert!(!stored);
    assert!(!engine.adapter().exists(key.as_str()).await);
    assert_eq!(query.stats().skipped_writes, 1);
}

#[tokio::test]
async fn lazy_invalidation_forces_one_refresh() {
    let engine = engine();
    let query = engine.query();
    let key = CacheKey::from_raw("document:d1");

    assert!(
        query
            .cache_result("document", &key, &json!({"body": "v1"}), &CacheCategory::Document)
            .await
    );

    let report = engine
        .trigger_invalidation("document_rendered", &context(&[("document_id", "d1")]))
        .await;
    assert_eq!(report.keys_deleted, 0);
    assert!(report.keys_marked_stale >= 1);
    assert!(engine.adapter().exists(key.as_str()).await);

    let stale: Option<serde_json::Value> = query.get_cached("document", &key).await;
    assert!(stale.is_none());

    assert!(
        query
            .cache_result("document", &key, &json!({"body": "v2"}), &CacheCategory::Document)
            .await
    );
    let fresh: Option<serde_json::Value> = query.get_cached("document", &key).await;
    assert_eq!(fresh, Some(json!({"body": "v2"})));
}

#[tokio::test]
async fn lazy_invalidation_survives_a_failed_refresh() {
    let engine = engine();
    let query = engine.query();
    let key = CacheKey::from_raw("document:d1");
    assert!(
        query
            .cache_result("document", &key, &json!({"body": "v1"}), &CacheCategory::Document)
            .await
    );
    engine
        .trigger_invalidation("document_rendered", &context(&[("document_id", "d1")]))
        .await;

    let first: Option<serde_json::Value> = query.get_cached("document", &key).await;
    assert!(first.is_none());
    assert!(
        !query
            .cache_result("document", &key, &json!({}), &CacheCategory::Document)
            .await
    );

    let second: Option<serde_json::Value> = query.get_cached("document", &key).await;
    assert!(second.is_none());
    assert!(!engine.adapter().exists(key.as_str()).await);
}

#[tokio::test(start_paused = true)]
async fn delayed_rule_deletes_after_its_delay() {
    let engine = engine();
    let adapter = engine.adapter();
    assert!(
        adapter
            .set("query:search:abc", Bytes::from_static(b"[1]"), None)
            .await
    );

    let report = engine
        .trigger_invalidation("search_reindex", &context(&[]))
        .await;
    assert_eq!(report.delayed_scheduled, 1);
    assert!(adapter.exists("query:search:abc").await);

    tokio::time::sleep(Duration::from_secs(31)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!adapter.exists("query:search:abc").await);
}

#[tokio::test]
async fn store_outage_degrades_without_failing_callers() {
    let engine = failing_engine();
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let lookup = cached(
        engine.query().clone(),
        "profile",
        CacheCategory::Profile,
        move |params: serde_json::Value| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(json!({"id": params["id"]}))
        },
    );

    let first: serde_json::Value = lookup.call(json!({"id": 1}), Some("u1")).await.expect("computed");
    let second: serde_json::Value = lookup.call(json!({"id": 1}), Some("u1")).await.expect("computed");
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let report = engine
        .trigger_invalidation("user_profile_update", &context(&[("user_id", "u1")]))
        .await;
    assert!(report.store_errors > 0);
    assert_eq!(report.keys_deleted, 0);
    assert!(engine.adapter().counters().errors > 0);
}

#[tokio::test]
async fn compute_errors_propagate_unchanged() {
    let engine = engine();
    let key = engine.query().build_key("broken", &json!({}), None);
    let result: Result<Vec<u8>, _> = engine
        .query()
        .get_or_compute("broken", &key, &CacheCategory::Record, || async {
            Err(std::io::Error::other("upstream down"))
        })
        .await;

    match result {
        Err(ComputeError::Failed(err)) => assert_eq!(err.to_string(), "upstream down"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!engine.adapter().exists(key.as_str()).await);
}

#[tokio::test(start_paused = true)]
async fn concurrent_warming_passes_are_excluded() {
    let engine = Arc::new(engine());
    engine
        .register_warming_task(
            WarmingTask::new("translations", 1, WarmStrategy::Eager),
            warm_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, WarmError>(3)
            }),
        )
        .expect("registered");

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.warm_on_startup().await })
    };
    while !engine.warming().is_warming() {
        tokio::task::yield_now().await;
    }

    assert_eq!(engine.warming().warm(None).await, WarmPass::AlreadyRunning);

    let pass = first.await.expect("first pass joins");
    assert_eq!(pass.results().len(), 1);
    assert!(pass.results()[0].success);
    assert_eq!(engine.warming().stats().skipped_passes, 1);
    assert!(!engine.warming().is_warming());
}

#[tokio::test]
async fn warming_runs_in_priority_order_and_retries() {
    let engine = engine();
    let attempts = Arc::new(AtomicUsize::new(0));
    let flaky_attempts = attempts.clone();

    engine
        .register_warming_task(
            WarmingTask::new("documents", 3, WarmStrategy::Eager),
            warm_fn(|_| async { Ok(1) }),
        )
        .expect("registered");
    engine
        .register_warming_task(
            WarmingTask::new("sessions", 1, WarmStrategy::Eager).retry(
                cachekeeper::cache::RetryPolicy {
                    retry_on_failure: true,
                    max_retries: 2,
                    retry_delay: Duration::ZERO,
                },
            ),
            warm_fn(move |_| {
                let attempts = flaky_attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(WarmError::failed("cold start"))
                    } else {
                        Ok(5)
                    }
                }
            }),
        )
        .expect("registered");

    let pass = engine.warm_on_startup().await;
    let order: Vec<&str> = pass.results().iter().map(|r| r.task.as_str()).collect();
    assert_eq!(order, ["sessions", "documents"]);
    assert_eq!(pass.results()[0].attempts, 2);
    assert_eq!(pass.results()[0].errors.len(), 1);
    assert!(pass.results()[0].success);
}
