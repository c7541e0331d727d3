//! End-to-end pipeline tests against `wiremock`-stubbed upstream API and
//! local store, matching scenarios S1-S6 in the design's testable
//! properties.

use std::sync::Arc;
use std::time::Duration;

use edge_bridge_core::config::MainConfig;
use edge_bridge_core::controller::{self, ControllerConfig};
use edge_bridge_core::http::StoreClient;
use edge_bridge_core::model::ResourceRef;
use edge_bridge_core::pool::{ClientPool, PoolConfig};
use edge_bridge_core::pool_manager::WorkerSet;
use edge_bridge_core::queue::WorkQueue;
use edge_bridge_core::stats::Stats;
use edge_bridge_core::worker::WorkerConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_config(upstream: &str, couch: &str) -> MainConfig {
    let yaml = format!(
        r#"
main:
  resources_api_server: "{upstream}"
  resources_api_version: "2.5"
  resource: tenders
  couch_url: "{couch}"
  public_db: tenders_db
  logs_db: logs_db
  workers_min: 1
  workers_max: 2
  retry_workers_min: 1
  retry_workers_max: 1
  filter_workers_count: 1
  watch_interval: 50ms
  resource_items_limit: 100
  resource_items_queue_size: 100
  retry_resource_items_queue_size: 100
  workers_inc_threshold: 75.0
  workers_dec_threshold: 25.0
  queues_controller_timeout: 50ms
  client_inc_step_timeout: 10ms
  client_dec_step_timeout: 10ms
  drop_threshold_client_cookies: 5
  worker_sleep: 1ms
  retry_default_timeout: 10ms
  retries_count: 3
  queue_timeout: 20ms
  user_agent: edge-bridge-test
  shutdown_grace_period: 200ms
"#
    );
    let path = std::env::temp_dir().join(format!("edge-bridge-pipeline-test-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(&path, yaml).unwrap();
    let cfg = MainConfig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    cfg
}

/// S1: fresh sync. Empty store, upstream advertises three items; after one
/// pass the store should have received exactly three inserting PUTs.
#[tokio::test]
async fn fresh_sync_saves_every_advertised_item() {
    let upstream = MockServer::start().await;
    let couch = MockServer::start().await;

    let now = chrono::Utc::now().to_rfc3339();
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "a", "dateModified": now},
                {"id": "b", "dateModified": now},
                {"id": "c", "dateModified": now},
            ],
            "next_page": {"offset": "cursor-1"}
        })))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "next_page": {}})))
        .mount(&upstream)
        .await;

    for id in ["a", "b", "c"] {
        Mock::given(method("GET"))
            .and(path(format!("/api/2.5/tenders/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": id, "dateModified": now})))
            .mount(&upstream)
            .await;
    }

    Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;
    Mock::given(method("GET")).and(path_regex(r"^/tenders_db/.*")).respond_with(ResponseTemplate::new(404)).mount(&couch).await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/tenders_db/.*"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true, "rev": "1-x"})))
        .expect(3)
        .mount(&couch)
        .await;
    Mock::given(method("POST")).and(path("/logs_db")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;

    let cfg = base_config(&upstream.uri(), &couch.uri());
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(edge_bridge_core::run(cfg, shutdown_clone));

    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    couch.verify().await;
}

/// S2: no-op. The store already holds the advertised version, so the
/// staleness filter must drop the item before any upstream GET-by-id is
/// issued, and nothing is written.
#[tokio::test]
async fn noop_sync_skips_without_fetching_document() {
    let upstream = MockServer::start().await;
    let couch = MockServer::start().await;

    let now = chrono::Utc::now().to_rfc3339();
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "a", "dateModified": now}],
            "next_page": {"offset": "cursor-1"}
        })))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "next_page": {}})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a", "dateModified": now})))
        .expect(0)
        .mount(&upstream)
        .await;

    Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;
    Mock::given(method("GET"))
        .and(path("/tenders_db/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a", "dateModified": now, "_rev": "1-x"})))
        .mount(&couch)
        .await;
    Mock::given(method("PUT")).and(path_regex(r"^/tenders_db/.*")).respond_with(ResponseTemplate::new(201)).expect(0).mount(&couch).await;
    Mock::given(method("POST")).and(path("/logs_db")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;

    let cfg = base_config(&upstream.uri(), &couch.uri());
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(edge_bridge_core::run(cfg, shutdown_clone));

    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    upstream.verify().await;
    couch.verify().await;
}

/// S3: update wins. The store holds an older version and the feed
/// advertises a newer one; the worker writes the update using the
/// revision it reads back from the store.
#[tokio::test]
async fn newer_advertised_version_overwrites_the_stored_one() {
    let upstream = MockServer::start().await;
    let couch = MockServer::start().await;

    let t1 = (chrono::Utc::now() - chrono::Duration::seconds(60)).to_rfc3339();
    let t2 = chrono::Utc::now().to_rfc3339();

    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "a", "dateModified": t2}],
            "next_page": {"offset": "cursor-1"}
        })))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "next_page": {}})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a", "dateModified": t2})))
        .mount(&upstream)
        .await;

    Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;
    Mock::given(method("GET"))
        .and(path("/tenders_db/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a", "dateModified": t1, "_rev": "1-x"})))
        .mount(&couch)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tenders_db/a"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true, "rev": "2-x"})))
        .expect(1)
        .mount(&couch)
        .await;
    Mock::given(method("POST")).and(path("/logs_db")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;

    let cfg = base_config(&upstream.uri(), &couch.uri());
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(edge_bridge_core::run(cfg, shutdown_clone));

    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    couch.verify().await;
}

/// S4: stale fetch. The feed advertises a newer version than the one the
/// first fetch returns; the worker treats the response as not yet caught
/// up on that client, re-enqueues to the retry queue, and writes once a
/// later fetch returns the advertised version.
#[tokio::test]
async fn stale_first_fetch_is_retried_until_it_catches_up() {
    let upstream = MockServer::start().await;
    let couch = MockServer::start().await;

    let t1 = (chrono::Utc::now() - chrono::Duration::seconds(60)).to_rfc3339();
    let t2 = chrono::Utc::now().to_rfc3339();

    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "a", "dateModified": t2}],
            "next_page": {"offset": "cursor-1"}
        })))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "next_page": {}})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a", "dateModified": t1})))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a", "dateModified": t2})))
        .mount(&upstream)
        .await;

    Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;
    Mock::given(method("GET")).and(path_regex(r"^/tenders_db/.*")).respond_with(ResponseTemplate::new(404)).mount(&couch).await;
    Mock::given(method("PUT"))
        .and(path("/tenders_db/a"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true, "rev": "1-x"})))
        .expect(1)
        .mount(&couch)
        .await;
    Mock::given(method("POST")).and(path("/logs_db")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;

    let cfg = base_config(&upstream.uri(), &couch.uri());
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(edge_bridge_core::run(cfg, shutdown_clone));

    tokio::time::sleep(Duration::from_millis(600)).await;
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    couch.verify().await;
}

/// S5: exhaustion. Upstream GET-by-id always returns 500; after
/// `retries_count` attempts the item is dropped and the store sees no PUT.
#[tokio::test]
async fn exhausted_retries_drop_without_writing() {
    let upstream = MockServer::start().await;
    let couch = MockServer::start().await;

    let now = chrono::Utc::now().to_rfc3339();
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "a", "dateModified": now}],
            "next_page": {"offset": "cursor-1"}
        })))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/2.5/tenders"))
        .and(query_param("mode", "_all_"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "next_page": {}})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET")).and(path("/api/2.5/tenders/a")).respond_with(ResponseTemplate::new(500)).mount(&upstream).await;

    Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;
    Mock::given(method("GET")).and(path_regex(r"^/tenders_db/.*")).respond_with(ResponseTemplate::new(404)).mount(&couch).await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/tenders_db/.*"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true, "rev": "1-x"})))
        .expect(0)
        .mount(&couch)
        .await;
    Mock::given(method("POST")).and(path("/logs_db")).respond_with(ResponseTemplate::new(200)).mount(&couch).await;

    let cfg = base_config(&upstream.uri(), &couch.uri());
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(edge_bridge_core::run(cfg, shutdown_clone));

    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    couch.verify().await;
}

/// S6: scale-up. The primary queue is held saturated above
/// `workers_inc_threshold`; the queue controller must grow the worker pool
/// one step per tick up to `workers_max`, and never past it.
#[tokio::test]
async fn controller_scales_primary_workers_up_to_max_and_holds() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/2\.5/tenders/.*"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&upstream)
        .await;

    let pool = ClientPool::new(PoolConfig {
        user_agent_prefix: "controller-test".to_string(),
        request_timeout: Duration::from_secs(5),
        ceiling: 10,
        inc_step: Duration::from_millis(1),
        dec_step: Duration::from_millis(1),
        cookie_threshold: 5,
        create_backoff_step: Duration::from_millis(1),
        create_backoff_max: Duration::from_millis(5),
    });
    // Never hit: the fetches in this test all return 404 before the worker
    // would read or write the store.
    let store = Arc::new(StoreClient::new(reqwest::Client::new(), "http://127.0.0.1:1"));
    let primary = WorkQueue::new(Some(20));
    let retry = WorkQueue::new(Some(20));
    let workers = Arc::new(WorkerSet::new());
    let worker_cfg = Arc::new(WorkerConfig {
        base: upstream.uri(),
        version: "2.5".to_string(),
        resource: "tenders".to_string(),
        public_db: "tenders_db".to_string(),
        queue_timeout: Duration::from_millis(5),
        worker_sleep: Duration::ZERO,
        retry_default_timeout: Duration::ZERO,
        retries_count: 3,
        is_retry_worker: false,
    });
    let controller_cfg = ControllerConfig {
        tick: Duration::from_millis(20),
        inc_threshold: 75.0,
        dec_threshold: 25.0,
        workers_min: 1,
        workers_max: 5,
    };
    let stats = Stats::new();
    let shutdown = CancellationToken::new();

    // Seed the one worker the supervisor would have started at boot.
    controller::spawn_one_primary_worker(&primary, &retry, &workers, &pool, &store, &worker_cfg, &stats, &shutdown).await;

    let controller_handle = tokio::spawn(controller::run(
        controller_cfg,
        primary.clone(),
        retry.clone(),
        workers.clone(),
        pool.clone(),
        store.clone(),
        worker_cfg.clone(),
        stats.clone(),
        shutdown.clone(),
    ));

    // Keep the primary queue saturated: `put` blocks once it is full, so
    // this loop naturally holds the queue at its bound no matter how fast
    // the growing worker pool drains it.
    let filler_primary = primary.clone();
    let filler = tokio::spawn(async move {
        loop {
            if !filler_primary.put(ResourceRef::new("filler", chrono::Utc::now())).await {
                return;
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(workers.count().await, 5);

    // Hold a few more ticks at the saturated queue; the pool must not grow
    // past `workers_max`.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(workers.count().await, 5);

    shutdown.cancel();
    filler.abort();
    let _ = tokio::time::timeout(Duration::from_secs(2), controller_handle).await;
}
