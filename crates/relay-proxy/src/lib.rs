//! Relay Proxy
//!
//! The inbound edge of the relay:
//! - `Router`: reloadable source route table
//! - `Gateway`: axum service admitting webhook requests as events
//! - `Stager`: background dispatch for async-ingest sources

pub mod error;
pub mod gateway;
pub mod router;
pub mod staging;

pub use error::GatewayError;
pub use gateway::{Gateway, GatewayConfig};
pub use router::{Route, RouteTable, Router};
pub use staging::Stager;
