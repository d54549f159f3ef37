//! WorkerPool - independent lease, deliver, settle loops
//!
//! Each loop leases a batch of due tasks, delivers them concurrently,
//! records one attempt per delivery and then settles the lease:
//! - success: ack
//! - failure with attempts left: nack to `now + backoff`
//! - failure on the last allowed attempt: attempt marked exhausted, ack
//!
//! Loops share nothing in-process; coordination happens through the queue.
//! A loop whose lease call fails backs off exponentially from the poll
//! interval and resets after the next successful lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use relay_common::{generate_id, later_by, Attempt, AttemptStatus, LeasedTask, RetryPolicy};
use relay_config::WorkerConfig;
use relay_queue::{QueueError, TaskQueue};
use relay_store::Store;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::Backoff;
use crate::deliverer::Deliverer;

/// Ceiling for the pause between failed lease calls
const MAX_LEASE_BACKOFF_MS: u64 = 30_000;

pub struct WorkerPool {
    config: WorkerConfig,
    lease_backoff: RetryPolicy,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn Store>,
    deliverer: Arc<dyn Deliverer>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn Store>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Self {
        let lease_backoff = RetryPolicy {
            max_attempts: u32::MAX,
            initial_interval_ms: config.poll_interval_ms,
            max_interval_ms: MAX_LEASE_BACKOFF_MS.max(config.poll_interval_ms),
            multiplier: 2.0,
            jitter: 0.1,
        };
        Self {
            config,
            lease_backoff,
            queue,
            store,
            deliverer,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `concurrency` worker loops that run until `shutdown` fires
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.config.concurrency {
            let pool = Arc::clone(self);
            let shutdown_rx = shutdown.subscribe();
            let span = info_span!("worker", worker_id);
            handles.push(tokio::spawn(pool.run_worker(shutdown_rx).instrument(span)));
        }
        info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "Worker pool started"
        );
    }

    /// Wait for every loop to finish its in-flight batch, up to `timeout`.
    /// Returns false if the deadline passed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown_by(Instant::now() + timeout).await
    }

    /// Like `shutdown`, against a deadline shared with other shutdown steps
    pub async fn shutdown_by(&self, deadline: Instant) -> bool {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        match tokio::time::timeout_at(deadline, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Worker pool stopped");
                true
            }
            Err(_) => {
                warn!("Worker pool did not stop before the shutdown deadline");
                false
            }
        }
    }

    async fn run_worker(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Worker started");
        let mut lease_failures = 0u32;
        loop {
            if !matches!(shutdown_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                break;
            }

            let processed = match self.process_batch().await {
                Ok(n) => {
                    lease_failures = 0;
                    n
                }
                Err(e) => {
                    lease_failures = lease_failures.saturating_add(1);
                    let delay = self.lease_retry_delay(lease_failures);
                    warn!(
                        error = %e,
                        failures = lease_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to lease tasks, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                    continue;
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = self.queue.wait_for_work(self.config.poll_interval()) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }
        debug!("Worker stopped");
    }

    fn lease_retry_delay(&self, failures: u32) -> Duration {
        Backoff::new(&self.lease_backoff).delay(failures)
    }

    /// Lease one batch and process it to completion. Returns how many tasks
    /// were leased.
    pub async fn process_batch(&self) -> Result<usize, QueueError> {
        let leased = self
            .queue
            .lease(self.config.batch_size, self.config.lease_duration())
            .await?;
        let count = leased.len();
        if count > 0 {
            futures::future::join_all(leased.into_iter().map(|t| self.process_task(t))).await;
        }
        Ok(count)
    }

    async fn process_task(&self, leased: LeasedTask) {
        let task = &leased.task;

        let event = match self.store.get_event(&task.event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(task_id = %task.id, event_id = %task.event_id, "Event missing, dropping task");
                self.ack(&leased).await;
                return;
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to load event, lease left to expire");
                return;
            }
        };
        let endpoint = match self.store.get_endpoint(&task.endpoint_id).await {
            Ok(Some(endpoint)) if endpoint.enabled => endpoint,
            Ok(Some(_)) => {
                warn!(task_id = %task.id, endpoint_id = %task.endpoint_id, "Endpoint disabled, dropping task");
                self.ack(&leased).await;
                return;
            }
            Ok(None) => {
                warn!(task_id = %task.id, endpoint_id = %task.endpoint_id, "Endpoint missing, dropping task");
                self.ack(&leased).await;
                return;
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to load endpoint, lease left to expire");
                return;
            }
        };

        let policy = endpoint.retry.clone().unwrap_or_else(|| self.config.retry.clone());
        let request_timeout = self.config.request_timeout();
        let timeout = endpoint.timeout().map_or(request_timeout, |t| t.min(request_timeout));
        let attempt_number = task.attempts + 1;

        let outcome = self.deliverer.deliver(&endpoint, &event, timeout).await;
        let succeeded = outcome.status == AttemptStatus::Succeeded;
        let exhausted = !succeeded && attempt_number >= policy.max_attempts;

        metrics::counter!("relay_delivery_attempts_total", "status" => outcome.status.as_str()).increment(1);

        let attempt = Attempt {
            id: generate_id(),
            task_id: task.id.clone(),
            event_id: task.event_id,
            endpoint_id: task.endpoint_id.clone(),
            attempt_number,
            status: outcome.status,
            status_code: outcome.status_code,
            request: outcome.request,
            response: outcome.response,
            error: outcome.error,
            duration_ms: outcome.duration.as_millis() as u64,
            exhausted,
            created_at: Utc::now(),
        };

        if !self.record_attempt(&attempt).await {
            // the task comes back once the lease expires
            return;
        }

        if succeeded {
            debug!(task_id = %task.id, attempt_number, "Delivered");
            self.ack(&leased).await;
        } else if exhausted {
            metrics::counter!("relay_tasks_exhausted_total").increment(1);
            warn!(
                task_id = %task.id,
                event_id = %task.event_id,
                endpoint_id = %task.endpoint_id,
                attempts = attempt_number,
                "Delivery exhausted"
            );
            self.ack(&leased).await;
        } else {
            let delay = Backoff::new(&policy).delay(attempt_number);
            debug!(
                task_id = %task.id,
                attempt_number,
                status = %attempt.status,
                delay_ms = delay.as_millis() as u64,
                "Delivery failed, rescheduling"
            );
            self.nack(&leased, delay).await;
        }
    }

    /// Returns false when every try failed
    async fn record_attempt(&self, attempt: &Attempt) -> bool {
        let mut retries = 0;
        loop {
            match self.store.insert_attempt(attempt).await {
                Ok(()) => return true,
                Err(e) if retries < self.config.attempt_write_retries => {
                    retries += 1;
                    warn!(task_id = %attempt.task_id, retries, error = %e, "Failed to record attempt, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(retries))).await;
                }
                Err(e) => {
                    error!(
                        task_id = %attempt.task_id,
                        error = %e,
                        "Failed to record attempt, lease left to expire"
                    );
                    return false;
                }
            }
        }
    }

    async fn ack(&self, leased: &LeasedTask) {
        if let Err(e) = self.queue.ack(&leased.token).await {
            log_settle_error("ack", leased, e);
        }
    }

    async fn nack(&self, leased: &LeasedTask, delay: Duration) {
        let next = later_by(Utc::now(), delay);
        if let Err(e) = self.queue.nack(&leased.token, next).await {
            log_settle_error("nack", leased, e);
        }
    }
}

fn log_settle_error(op: &str, leased: &LeasedTask, e: QueueError) {
    match e {
        QueueError::LeaseLost(_) => {
            warn!(task_id = %leased.task.id, op, "Lease lost before settling, task will be redelivered");
        }
        e => error!(task_id = %leased.task.id, op, error = %e, "Failed to settle task"),
    }
}
