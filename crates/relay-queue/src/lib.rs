//! Task queue abstraction for delivery work
//!
//! - `TaskQueue`: lease-based, at-least-once work queue contract
//! - `QueueState`: lease bookkeeping shared by the in-process backends
//! - `MemoryQueue`: non-durable queue for tests and single-process runs
//!
//! Durable backends live next to the store they share a transaction with.

pub mod memory;
pub mod state;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::{LeaseToken, LeasedTask, Task};
use thiserror::Error;

pub use memory::MemoryQueue;
pub use state::QueueState;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The token no longer owns a lease: it expired and was re-leased, or
    /// the task was already settled.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("task already queued: {0}")]
    DuplicateTask(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn lease_lost(token: &LeaseToken) -> Self {
        Self::LeaseLost(token.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Lease-based work queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make a task visible for leasing at or after `not_before`
    async fn enqueue(&self, task: Task, not_before: DateTime<Utc>) -> Result<()>;

    /// Lease up to `batch_size` due tasks, hiding each from other leasers for
    /// `lease_duration`. Returns immediately, possibly with nothing.
    async fn lease(&self, batch_size: usize, lease_duration: Duration) -> Result<Vec<LeasedTask>>;

    /// Terminal outcome: remove the task
    async fn ack(&self, token: &LeaseToken) -> Result<()>;

    /// Return the task to the visible set at `next_not_before` and count the attempt
    async fn nack(&self, token: &LeaseToken, next_not_before: DateTime<Utc>) -> Result<()>;

    /// Push the lease expiry to `now + duration`
    async fn extend(&self, token: &LeaseToken, duration: Duration) -> Result<()>;

    /// Resolve when new work may be available, or after `max_wait`
    async fn wait_for_work(&self, max_wait: Duration);
}

/// Wake-up hook fired after tasks are committed
pub trait WorkSignal: Send + Sync {
    fn notify_work(&self);
}

/// Signal for setups where workers rely on polling alone
pub struct NoopSignal;

impl WorkSignal for NoopSignal {
    fn notify_work(&self) {}
}
