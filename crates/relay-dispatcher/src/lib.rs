//! Event dispatcher
//!
//! Turns an admitted event into durable state: the event row plus one
//! delivery task per resolved endpoint, written in a single store
//! transaction. Workers are signaled once the transaction commits; if the
//! signal is lost they still find the tasks on their next poll.

use std::sync::Arc;

use relay_common::{EndpointId, Event, EventId, Source};
use relay_queue::WorkSignal;
use relay_store::{Store, StoreError};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to resolve endpoints: {0}")]
    Resolve(#[source] StoreError),

    #[error("failed to persist event: {0}")]
    Persist(#[source] StoreError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Outcome of a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub event_id: EventId,
    pub task_count: usize,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    signal: Arc<dyn WorkSignal>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, signal: Arc<dyn WorkSignal>) -> Self {
        Self { store, signal }
    }

    /// Persist `event` and enqueue its delivery tasks atomically.
    ///
    /// An event with no matching endpoints is still stored, with zero tasks.
    pub async fn dispatch(&self, source: &Source, event: &Event) -> Result<DispatchReceipt> {
        let endpoints = self
            .store
            .resolve_endpoints(source, &event.event_type)
            .await
            .map_err(|e| {
                error!(source_id = %source.id, event_id = %event.id, error = %e, "Failed to resolve endpoints");
                DispatchError::Resolve(e)
            })?;
        let endpoint_ids: Vec<EndpointId> = endpoints.into_iter().map(|e| e.id).collect();

        let tasks = self.store.dispatch(event, &endpoint_ids).await.map_err(|e| {
            error!(event_id = %event.id, error = %e, "Failed to persist event");
            DispatchError::Persist(e)
        })?;

        metrics::counter!("relay_events_dispatched_total").increment(1);
        metrics::counter!("relay_tasks_enqueued_total").increment(tasks.len() as u64);

        if tasks.is_empty() {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Event stored without endpoints"
            );
        } else {
            self.signal.notify_work();
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                tasks = tasks.len(),
                "Event dispatched"
            );
        }

        Ok(DispatchReceipt {
            event_id: event.id,
            task_count: tasks.len(),
        })
    }
}
