//! In-process store and task queue
//!
//! One mutex guards events, tasks and attempts together, which gives
//! `dispatch` the same all-or-nothing behavior as a database transaction.
//! Failure switches let tests simulate an unavailable backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_common::{Attempt, Endpoint, EndpointId, Event, EventId, LeaseToken, LeasedTask, Source, Task};
use relay_queue::memory::wait_until_due;
use relay_queue::{QueueError, QueueState, TaskQueue, WorkSignal};
use tokio::sync::Notify;

use crate::{select_endpoints, validate_endpoint, Result, Store, StoreError};

#[derive(Default)]
struct Inner {
    sources: Vec<Source>,
    endpoints: Vec<Endpoint>,
    events: HashMap<EventId, Event>,
    attempts: Vec<Attempt>,
    queue: QueueState,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
    fail_dispatch: AtomicBool,
    fail_list_sources: AtomicBool,
    /// Number of upcoming `insert_attempt` calls that fail
    failing_attempt_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_dispatch(&self, fail: bool) {
        self.fail_dispatch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_list_sources(&self, fail: bool) {
        self.fail_list_sources.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_attempt_writes(&self, count: u32) {
        self.failing_attempt_writes.store(count, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.lock().queue.tasks().cloned().collect()
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.inner.lock().attempts.clone()
    }

    fn unavailable(what: &str) -> StoreError {
        StoreError::Unavailable(format!("{} failed (injected)", what))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_sources(&self) -> Result<Vec<Source>> {
        if self.fail_list_sources.load(Ordering::SeqCst) {
            return Err(Self::unavailable("list_sources"));
        }
        Ok(self.inner.lock().sources.clone())
    }

    async fn resolve_endpoints(&self, source: &Source, event_type: &str) -> Result<Vec<Endpoint>> {
        Ok(select_endpoints(source, event_type, &self.inner.lock().endpoints))
    }

    async fn dispatch(&self, event: &Event, endpoint_ids: &[EndpointId]) -> Result<Vec<Task>> {
        if self.fail_dispatch.load(Ordering::SeqCst) {
            return Err(Self::unavailable("dispatch"));
        }

        let tasks: Vec<Task> = endpoint_ids
            .iter()
            .map(|endpoint_id| Task::new(event.id, endpoint_id.clone()))
            .collect();

        {
            let mut inner = self.inner.lock();
            if inner.events.contains_key(&event.id) {
                return Err(StoreError::InvalidData(format!("event {} already exists", event.id)));
            }
            // check everything before the first write
            if let Some(task) = tasks.iter().find(|t| inner.queue.get(&t.id).is_some()) {
                return Err(StoreError::InvalidData(format!("task {} already exists", task.id)));
            }
            inner.events.insert(event.id, event.clone());
            for task in &tasks {
                inner
                    .queue
                    .enqueue(task.clone(), task.scheduled_at)
                    .map_err(|e| StoreError::InvalidData(e.to_string()))?;
            }
        }

        self.notify.notify_waiters();
        Ok(tasks)
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>> {
        Ok(self.inner.lock().events.get(id).cloned())
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>> {
        Ok(self.inner.lock().endpoints.iter().find(|e| e.id == id).cloned())
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        let remaining = self.failing_attempt_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_attempt_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unavailable("insert_attempt"));
        }
        self.inner.lock().attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, task_id: &str) -> Result<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .inner
            .lock()
            .attempts
            .iter()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn list_attempts_for_event(&self, event_id: &EventId) -> Result<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .inner
            .lock()
            .attempts
            .iter()
            .filter(|a| &a.event_id == event_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.attempt_number.cmp(&b.attempt_number)));
        Ok(attempts)
    }

    async fn count_tasks_for_event(&self, event_id: &EventId) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .queue
            .tasks()
            .filter(|t| &t.event_id == event_id)
            .count() as u64)
    }

    async fn upsert_source(&self, source: &Source) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => *existing = source.clone(),
            None => inner.sources.push(source.clone()),
        }
        Ok(())
    }

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        validate_endpoint(endpoint)?;
        let mut inner = self.inner.lock();
        match inner.endpoints.iter_mut().find(|e| e.id == endpoint.id) {
            Some(existing) => *existing = endpoint.clone(),
            None => inner.endpoints.push(endpoint.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn enqueue(&self, task: Task, not_before: DateTime<Utc>) -> relay_queue::Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.events.contains_key(&task.event_id) {
                return Err(QueueError::Backend(format!("event {} does not exist", task.event_id)));
            }
            inner.queue.enqueue(task, not_before)?;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn lease(&self, batch_size: usize, lease_duration: Duration) -> relay_queue::Result<Vec<LeasedTask>> {
        Ok(self.inner.lock().queue.lease(Utc::now(), batch_size, lease_duration))
    }

    async fn ack(&self, token: &LeaseToken) -> relay_queue::Result<()> {
        self.inner.lock().queue.ack(token).map(|_| ())
    }

    async fn nack(&self, token: &LeaseToken, next_not_before: DateTime<Utc>) -> relay_queue::Result<()> {
        self.inner.lock().queue.nack(token, next_not_before)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, token: &LeaseToken, duration: Duration) -> relay_queue::Result<()> {
        self.inner.lock().queue.extend(token, Utc::now(), duration).map(|_| ())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let notified = self.notify.notified();
        let wait = wait_until_due(self.inner.lock().queue.next_due_at(), max_wait);
        let _ = tokio::time::timeout(wait, notified).await;
    }
}

impl WorkSignal for MemoryStore {
    fn notify_work(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, Source, Vec<Endpoint>) {
        let store = MemoryStore::new();
        let source = Source::new("ws", "/", &["POST"]);
        store.upsert_source(&source).await.unwrap();
        let endpoints = vec![
            Endpoint::new("ws", "http://localhost:1/a"),
            Endpoint::new("ws", "http://localhost:1/b"),
        ];
        for e in &endpoints {
            store.upsert_endpoint(e).await.unwrap();
        }
        (store, source, endpoints)
    }

    #[tokio::test]
    async fn test_dispatch_creates_one_task_per_endpoint() {
        let (store, source, _) = seeded().await;
        let event = Event::new("ws", "foo.bar", json!({"key": "value"}));

        let endpoints = store.resolve_endpoints(&source, &event.event_type).await.unwrap();
        let ids: Vec<String> = endpoints.iter().map(|e| e.id.clone()).collect();
        let tasks = store.dispatch(&event, &ids).await.unwrap();

        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.attempts == 0 && t.event_id == event.id));
        assert_eq!(store.count_tasks_for_event(&event.id).await.unwrap(), 2);
        assert!(store.get_event(&event.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_nothing() {
        let (store, _, endpoints) = seeded().await;
        store.set_fail_dispatch(true);

        let event = Event::new("ws", "foo.bar", json!({}));
        let ids: Vec<String> = endpoints.iter().map(|e| e.id.clone()).collect();
        assert!(store.dispatch(&event, &ids).await.is_err());

        assert_eq!(store.event_count(), 0);
        assert_eq!(store.task_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_event_rejected_without_side_effects() {
        let (store, _, endpoints) = seeded().await;
        let event = Event::new("ws", "foo.bar", json!({}));
        let ids = vec![endpoints[0].id.clone()];
        store.dispatch(&event, &ids).await.unwrap();

        assert!(store.dispatch(&event, &ids).await.is_err());
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_requires_existing_event() {
        let store = MemoryStore::new();
        let task = Task::new(EventId::new(), "ep");
        assert!(store.enqueue(task, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_attempt_write_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_attempt_writes(1);
        let attempt = Attempt {
            id: "a1".into(),
            task_id: "t1".into(),
            event_id: EventId::new(),
            endpoint_id: "ep".into(),
            attempt_number: 1,
            status: relay_common::AttemptStatus::Succeeded,
            status_code: Some(200),
            request: relay_common::AttemptRequest {
                method: "POST".into(),
                url: "http://localhost".into(),
                headers: Default::default(),
            },
            response: None,
            error: None,
            duration_ms: 1,
            exhausted: false,
            created_at: Utc::now(),
        };

        assert!(store.insert_attempt(&attempt).await.is_err());
        store.insert_attempt(&attempt).await.unwrap();
        assert_eq!(store.list_attempts("t1").await.unwrap().len(), 1);
    }
}
