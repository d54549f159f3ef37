//! SQLite store tests
//!
//! Tests for:
//! - Source and endpoint persistence
//! - Atomic event + task dispatch
//! - Lease, ack, nack and extend semantics
//! - Attempt history

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use relay_common::{
    Attempt, AttemptRequest, AttemptResponse, AttemptStatus, Endpoint, Event, EventId, PluginConfig, ResponseOverride,
    RetryPolicy, Source, Task,
};
use relay_queue::{QueueError, TaskQueue};
use relay_store::{SqliteStore, Store, StoreError};

const LEASE: Duration = Duration::from_secs(30);

async fn store_with_endpoints(count: usize) -> (SqliteStore, Source, Vec<Endpoint>) {
    let store = SqliteStore::in_memory().await.unwrap();
    let source = Source::new("ws", "/", &["POST"]);
    store.upsert_source(&source).await.unwrap();

    let mut endpoints = Vec::new();
    for i in 0..count {
        let endpoint = Endpoint::new("ws", format!("http://localhost:1/{}", i));
        store.upsert_endpoint(&endpoint).await.unwrap();
        endpoints.push(endpoint);
    }
    (store, source, endpoints)
}

async fn dispatch(store: &SqliteStore, source: &Source, event: &Event) -> Vec<Task> {
    let endpoints = store.resolve_endpoints(source, &event.event_type).await.unwrap();
    let ids: Vec<String> = endpoints.into_iter().map(|e| e.id).collect();
    store.dispatch(event, &ids).await.unwrap()
}

fn attempt(task: &Task, number: u32, status: AttemptStatus) -> Attempt {
    Attempt {
        id: relay_common::generate_id(),
        task_id: task.id.clone(),
        event_id: task.event_id,
        endpoint_id: task.endpoint_id.clone(),
        attempt_number: number,
        status,
        status_code: Some(500),
        request: AttemptRequest {
            method: "POST".into(),
            url: "http://localhost:1/0".into(),
            headers: Default::default(),
        },
        response: Some(AttemptResponse {
            status_code: 500,
            headers: Default::default(),
            body: Some("oops".into()),
        }),
        error: None,
        duration_ms: 12,
        exhausted: false,
        created_at: Utc::now(),
    }
}

// ============================================================================
// Configuration Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_source_roundtrip_preserves_order_and_fields() {
    let store = SqliteStore::in_memory().await.unwrap();

    let first = Source::new("ws", "/first", &["POST", "PUT"])
        .with_plugin(PluginConfig::new("jsonschema-validator", json!({"event_schemas": []})))
        .with_response(ResponseOverride {
            code: 202,
            content_type: "text/plain".into(),
            body: "ok".into(),
        });
    let second = Source::new("ws", "/second", &["POST"]).with_endpoints(vec!["ep-1".into()]);

    store.upsert_source(&first).await.unwrap();
    store.upsert_source(&second).await.unwrap();

    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources, vec![first.clone(), second]);

    // updating keeps the original position
    let mut updated = first;
    updated.enabled = false;
    store.upsert_source(&updated).await.unwrap();
    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources[0].path, "/first");
    assert!(!sources[0].enabled);
}

#[tokio::test]
async fn test_endpoint_roundtrip() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut endpoint = Endpoint::new("ws", "http://example.com/hook")
        .with_header("Authorization", "Bearer x")
        .with_retry(RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        });
    endpoint.timeout_ms = Some(2_000);
    endpoint.events = vec!["order.created".into()];

    store.upsert_endpoint(&endpoint).await.unwrap();
    let loaded = store.get_endpoint(&endpoint.id).await.unwrap().unwrap();
    assert_eq!(loaded, endpoint);
    assert!(store.get_endpoint("missing").await.unwrap().is_none());
}

// ============================================================================
// Dispatch Tests
// ============================================================================

#[tokio::test]
async fn test_dispatch_persists_event_and_tasks() {
    let (store, source, _) = store_with_endpoints(2).await;
    let event = Event::new("ws", "foo.bar", json!({"key": "value"}));

    let tasks = dispatch(&store, &source, &event).await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(store.count_tasks_for_event(&event.id).await.unwrap(), 2);

    let loaded = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, event.id);
    assert_eq!(loaded.event_type, "foo.bar");
    assert_eq!(loaded.data, json!({"key": "value"}));
}

#[tokio::test]
async fn test_dispatch_without_endpoints_keeps_event() {
    let (store, source, _) = store_with_endpoints(0).await;
    let event = Event::new("ws", "foo.bar", json!({}));

    let tasks = dispatch(&store, &source, &event).await;
    assert!(tasks.is_empty());
    assert!(store.get_event(&event.id).await.unwrap().is_some());
    assert_eq!(store.count_tasks_for_event(&event.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_dispatch_rolls_back() {
    let (store, source, endpoints) = store_with_endpoints(1).await;
    let event = Event::new("ws", "foo.bar", json!({}));
    dispatch(&store, &source, &event).await;

    // same event id again: the event insert fails, so no extra task may appear
    let ids = vec![endpoints[0].id.clone()];
    assert!(store.dispatch(&event, &ids).await.is_err());
    assert_eq!(store.count_tasks_for_event(&event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_enqueue_rejects_orphan_task() {
    let store = SqliteStore::in_memory().await.unwrap();
    let orphan = Task::new(EventId::new(), "ep");
    assert!(store.enqueue(orphan, Utc::now()).await.is_err());
}

// ============================================================================
// Lease Tests
// ============================================================================

#[tokio::test]
async fn test_lease_is_exclusive() {
    let (store, source, _) = store_with_endpoints(3).await;
    dispatch(&store, &source, &Event::new("ws", "foo.bar", json!({}))).await;

    let first = store.lease(10, LEASE).await.unwrap();
    assert_eq!(first.len(), 3);
    assert!(store.lease(10, LEASE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_leasers_never_share_a_task() {
    let (store, source, _) = store_with_endpoints(5).await;
    for _ in 0..4 {
        dispatch(&store, &source, &Event::new("ws", "foo.bar", json!({}))).await;
    }
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = store.lease(3, LEASE).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                ids.extend(batch.into_iter().map(|l| l.task.id));
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for result in futures::future::join_all(handles).await {
        for id in result.unwrap() {
            assert!(seen.insert(id), "task leased twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn test_leasers_on_separate_connections_never_share_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("relay.db").display());
    let store = SqliteStore::connect(&url, 8).await.unwrap();
    store.init_schema().await.unwrap();

    let source = Source::new("ws", "/", &["POST"]);
    store.upsert_source(&source).await.unwrap();
    let mut endpoint_ids = Vec::new();
    for i in 0..20 {
        let endpoint = Endpoint::new("ws", format!("http://localhost:1/{}", i));
        store.upsert_endpoint(&endpoint).await.unwrap();
        endpoint_ids.push(endpoint.id);
    }
    for _ in 0..10 {
        store
            .dispatch(&Event::new("ws", "foo.bar", json!({})), &endpoint_ids)
            .await
            .unwrap();
    }
    let store = Arc::new(store);
    let leased_total = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let leased_total = leased_total.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..500 {
                if leased_total.load(Ordering::SeqCst) >= 200 {
                    break;
                }
                // a busy database only delays this leaser
                if let Ok(batch) = store.lease(10, LEASE).await {
                    leased_total.fetch_add(batch.len(), Ordering::SeqCst);
                    ids.extend(batch.into_iter().map(|l| l.task.id));
                }
                tokio::task::yield_now().await;
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for result in futures::future::join_all(handles).await {
        for id in result.unwrap() {
            assert!(seen.insert(id), "task leased twice");
        }
    }
    assert_eq!(seen.len(), 200);
    store.close().await;
}

#[tokio::test]
async fn test_huge_lease_duration_saturates() {
    let (store, source, _) = store_with_endpoints(1).await;
    dispatch(&store, &source, &Event::new("ws", "foo.bar", json!({}))).await;

    let leased = store.lease(1, Duration::MAX).await.unwrap().remove(0);
    assert_eq!(leased.lease_expires_at, DateTime::<Utc>::MAX_UTC);
    store.extend(&leased.token, Duration::MAX).await.unwrap();
    assert!(store.lease(1, LEASE).await.unwrap().is_empty());
    store.ack(&leased.token).await.unwrap();
}

#[tokio::test]
async fn test_oversized_retry_override_rejected() {
    let store = SqliteStore::in_memory().await.unwrap();
    let endpoint = Endpoint::new("ws", "http://example.com/hook").with_retry(RetryPolicy {
        initial_interval_ms: 10u64.pow(16),
        max_interval_ms: 10u64.pow(16),
        ..RetryPolicy::default()
    });

    assert!(matches!(
        store.upsert_endpoint(&endpoint).await,
        Err(StoreError::InvalidEndpoint { .. })
    ));
    assert!(store.get_endpoint(&endpoint.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ack_removes_task() {
    let (store, source, _) = store_with_endpoints(1).await;
    let event = Event::new("ws", "foo.bar", json!({}));
    dispatch(&store, &source, &event).await;

    let leased = store.lease(1, LEASE).await.unwrap().remove(0);
    store.ack(&leased.token).await.unwrap();

    assert_eq!(store.count_tasks_for_event(&event.id).await.unwrap(), 0);
    assert!(matches!(store.ack(&leased.token).await, Err(QueueError::LeaseLost(_))));
}

#[tokio::test]
async fn test_nack_reschedules_and_counts_attempt() {
    let (store, source, _) = store_with_endpoints(1).await;
    dispatch(&store, &source, &Event::new("ws", "foo.bar", json!({}))).await;

    let leased = store.lease(1, LEASE).await.unwrap().remove(0);
    store
        .nack(&leased.token, Utc::now() + chrono::Duration::milliseconds(200))
        .await
        .unwrap();

    // not visible before its retry time
    assert!(store.lease(1, LEASE).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(250)).await;
    let again = store.lease(1, LEASE).await.unwrap().remove(0);
    assert_eq!(again.task.id, leased.task.id);
    assert_eq!(again.task.attempts, 1);
    assert_ne!(again.token, leased.token);
}

#[tokio::test]
async fn test_expired_lease_is_recoverable() {
    let (store, source, _) = store_with_endpoints(1).await;
    dispatch(&store, &source, &Event::new("ws", "foo.bar", json!({}))).await;

    let crashed = store.lease(1, Duration::from_millis(50)).await.unwrap().remove(0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let recovered = store.lease(1, LEASE).await.unwrap().remove(0);
    assert_eq!(recovered.task.id, crashed.task.id);

    // the crashed holder lost ownership
    assert!(store.nack(&crashed.token, Utc::now()).await.is_err());
    assert!(store.extend(&crashed.token, LEASE).await.is_err());
    store.ack(&recovered.token).await.unwrap();
}

#[tokio::test]
async fn test_extend_prolongs_lease() {
    let (store, source, _) = store_with_endpoints(1).await;
    dispatch(&store, &source, &Event::new("ws", "foo.bar", json!({}))).await;

    let leased = store.lease(1, Duration::from_millis(100)).await.unwrap().remove(0);
    store.extend(&leased.token, LEASE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(store.lease(1, LEASE).await.unwrap().is_empty());
    store.ack(&leased.token).await.unwrap();
}

#[tokio::test]
async fn test_wait_for_work_wakes_after_dispatch() {
    let (store, source, _) = store_with_endpoints(1).await;
    let store = Arc::new(store);

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            store.wait_for_work(Duration::from_secs(10)).await;
            started.elapsed()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    dispatch(&store, &source, &Event::new("ws", "foo.bar", json!({}))).await;

    assert!(waiter.await.unwrap() < Duration::from_secs(5));
}

// ============================================================================
// Attempt History Tests
// ============================================================================

#[tokio::test]
async fn test_attempts_are_listed_in_order() {
    let (store, source, _) = store_with_endpoints(1).await;
    let event = Event::new("ws", "foo.bar", json!({}));
    let task = dispatch(&store, &source, &event).await.remove(0);

    let mut second = attempt(&task, 2, AttemptStatus::Succeeded);
    second.status_code = Some(200);
    second.response = None;
    second.exhausted = true;
    store.insert_attempt(&second).await.unwrap();
    store.insert_attempt(&attempt(&task, 1, AttemptStatus::Failed)).await.unwrap();

    let attempts = store.list_attempts(&task.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].response.as_ref().unwrap().body.as_deref(), Some("oops"));
    assert_eq!(attempts[1].attempt_number, 2);
    assert!(attempts[1].exhausted);

    assert_eq!(store.list_attempts_for_event(&event.id).await.unwrap().len(), 2);
}
