//! Persistence for sources, endpoints, events, tasks and attempts
//!
//! Backends implement both `Store` and `TaskQueue` so that an event and its
//! delivery tasks are written in one transaction.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use relay_common::{Attempt, Endpoint, EndpointId, Event, EventId, Source, Task};
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid endpoint {id}: {reason}")]
    InvalidEndpoint { id: EndpointId, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// All sources, in creation order
    async fn list_sources(&self) -> Result<Vec<Source>>;

    /// Enabled endpoints an event of `event_type` from `source` fans out to
    async fn resolve_endpoints(&self, source: &Source, event_type: &str) -> Result<Vec<Endpoint>>;

    /// Persist the event and one task per endpoint atomically.
    /// Either everything is written or nothing is.
    async fn dispatch(&self, event: &Event, endpoint_ids: &[EndpointId]) -> Result<Vec<Task>>;

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>>;

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>>;

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()>;

    /// Attempts for a task, ordered by attempt number
    async fn list_attempts(&self, task_id: &str) -> Result<Vec<Attempt>>;

    async fn list_attempts_for_event(&self, event_id: &EventId) -> Result<Vec<Attempt>>;

    /// Tasks still queued for an event
    async fn count_tasks_for_event(&self, event_id: &EventId) -> Result<u64>;

    async fn upsert_source(&self, source: &Source) -> Result<()>;

    /// Rejects endpoints whose retry override is out of bounds
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<()>;
}

/// Bounds check applied before an endpoint is persisted
pub fn validate_endpoint(endpoint: &Endpoint) -> Result<()> {
    match &endpoint.retry {
        Some(policy) => policy.validate().map_err(|reason| StoreError::InvalidEndpoint {
            id: endpoint.id.clone(),
            reason: format!("retry.{}", reason),
        }),
        None => Ok(()),
    }
}

/// Apply fan-out rules to a set of candidate endpoints.
///
/// A source with static bindings delivers to exactly those endpoints (in
/// binding order). Otherwise every endpoint in the source's workspace that
/// subscribes to the event type is selected. Disabled endpoints never are.
pub fn select_endpoints<'a, I>(source: &Source, event_type: &str, candidates: I) -> Vec<Endpoint>
where
    I: IntoIterator<Item = &'a Endpoint>,
{
    let candidates: Vec<&Endpoint> = candidates
        .into_iter()
        .filter(|e| e.enabled && e.workspace_id == source.workspace_id)
        .collect();

    match &source.endpoints {
        Some(bindings) => bindings
            .iter()
            .filter_map(|id| candidates.iter().find(|e| &e.id == id))
            .map(|e| (*e).clone())
            .collect(),
        None => candidates
            .into_iter()
            .filter(|e| e.subscribes_to(event_type))
            .cloned()
            .collect(),
    }
}
