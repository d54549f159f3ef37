//! Relay Worker
//!
//! Delivers queued tasks to their endpoints:
//! - `WorkerPool`: lease loops with retry scheduling
//! - `Deliverer` / `HttpDeliverer`: one HTTP call per attempt
//! - `Backoff`: exponential retry delays with jitter

pub mod backoff;
pub mod deliverer;
pub mod pool;

use thiserror::Error;

pub use backoff::Backoff;
pub use deliverer::{Deliverer, DeliveryOutcome, HttpDeliverer, HttpDelivererConfig};
pub use pool::WorkerPool;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
