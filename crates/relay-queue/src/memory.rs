//! In-process task queue
//!
//! Not durable: tasks are lost when the process exits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_common::{LeaseToken, LeasedTask, Task};
use tokio::sync::Notify;
use tracing::debug;

use crate::{QueueState, Result, TaskQueue, WorkSignal};

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: Task, not_before: DateTime<Utc>) -> Result<()> {
        debug!(task_id = %task.id, "Enqueued task");
        self.state.lock().enqueue(task, not_before)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn lease(&self, batch_size: usize, lease_duration: Duration) -> Result<Vec<LeasedTask>> {
        Ok(self.state.lock().lease(Utc::now(), batch_size, lease_duration))
    }

    async fn ack(&self, token: &LeaseToken) -> Result<()> {
        self.state.lock().ack(token).map(|_| ())
    }

    async fn nack(&self, token: &LeaseToken, next_not_before: DateTime<Utc>) -> Result<()> {
        self.state.lock().nack(token, next_not_before)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, token: &LeaseToken, duration: Duration) -> Result<()> {
        self.state.lock().extend(token, Utc::now(), duration).map(|_| ())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        // register before inspecting state so a concurrent enqueue is not missed
        let notified = self.notify.notified();
        let wait = wait_until_due(self.state.lock().next_due_at(), max_wait);
        let _ = tokio::time::timeout(wait, notified).await;
    }
}

impl WorkSignal for MemoryQueue {
    fn notify_work(&self) {
        self.notify.notify_waiters();
    }
}

/// Shorten `max_wait` so a sleeper wakes when the next task becomes due
pub fn wait_until_due(next_due: Option<DateTime<Utc>>, max_wait: Duration) -> Duration {
    match next_due {
        Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(max_wait),
        None => max_wait,
    }
}
