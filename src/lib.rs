//! Eventide - consumer-group coordination for event streams
//!
//! Lets a cluster of identical stateless processes share consumption of
//! durable per-subject event streams. Each event is applied at most once per
//! aggregate version by every consuming service, out-of-order deliveries are
//! deferred until their predecessor lands, and a single elected leader
//! provisions streams and runs trimming and reclamation.

pub mod admin;
pub mod cold_storage;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod handler;
pub mod identity;
pub mod maintenance;
pub mod reconciler;
pub mod runtime;
pub mod services;
pub mod store;
pub mod subject;
pub mod transport;
pub mod upcast;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
