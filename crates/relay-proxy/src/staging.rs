//! In-memory staging for async-ingest sources
//!
//! Accepted events are queued here and dispatched by a background task after
//! the client has been answered. The buffer is NOT durable: events still
//! staged when the process dies are lost, and a full buffer rejects new
//! events with 503 rather than blocking the request.

use std::sync::Arc;

use relay_common::Event;
use relay_dispatcher::Dispatcher;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::GatewayError;
use crate::router::Route;

type Staged = (Arc<Route>, Event);

#[derive(Clone)]
pub struct Stager {
    tx: mpsc::Sender<Staged>,
}

impl Stager {
    /// Start the drain task. On shutdown the buffer stops accepting events
    /// and everything already staged is dispatched before the task exits.
    pub fn spawn(
        capacity: usize,
        dispatcher: Arc<Dispatcher>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Staged>(capacity.max(1));

        let handle = tokio::spawn(
            async move {
                info!(capacity, "Staging buffer started");
                loop {
                    tokio::select! {
                        staged = rx.recv() => match staged {
                            Some((route, event)) => drain_one(&dispatcher, &route, &event).await,
                            None => break,
                        },
                        _ = shutdown_rx.recv() => {
                            rx.close();
                            let mut drained = 0usize;
                            while let Some((route, event)) = rx.recv().await {
                                drain_one(&dispatcher, &route, &event).await;
                                drained += 1;
                            }
                            info!(drained, "Staging buffer shutting down");
                            break;
                        }
                    }
                }
            }
            .instrument(info_span!("staging")),
        );

        (Self { tx }, handle)
    }

    /// Queue an event for background dispatch without waiting
    pub fn stage(&self, route: Arc<Route>, event: Event) -> Result<(), GatewayError> {
        self.tx.try_send((route, event)).map_err(|e| {
            let event_id = match &e {
                mpsc::error::TrySendError::Full((_, ev)) | mpsc::error::TrySendError::Closed((_, ev)) => ev.id,
            };
            warn!(event_id = %event_id, "Staging buffer rejected event");
            metrics::counter!("relay_staging_rejected_total").increment(1);
            GatewayError::StagingFull
        })
    }
}

async fn drain_one(dispatcher: &Dispatcher, route: &Route, event: &Event) {
    match dispatcher.dispatch(&route.source, event).await {
        Ok(receipt) => debug!(event_id = %receipt.event_id, tasks = receipt.task_count, "Staged event dispatched"),
        Err(e) => {
            // the client already got its response; the event is dropped
            error!(event_id = %event.id, source_id = %route.source.id, error = %e, "Staged event lost");
            metrics::counter!("relay_staging_lost_total").increment(1);
        }
    }
}
