//! Cached per-partition receiving from Azure Event Hubs for micro-batch
//! workers.
//!
//! For each (connection string, consumer group, partition) key a worker
//! keeps one long-lived AMQP reader whose cursor is reused across successive
//! micro-batches, avoiding reconnect cost and letting the service prefetch
//! ahead of the batch boundary. The entry point is
//! [`ReceiverCache::receive`], which produces exactly the half-open
//! sequence-number range `[request, request + batch_size)` and recovers from
//! cursor drift, retention trimming, and link theft along the way.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod pool;
mod reader;
pub mod registry;
pub mod reporter;
pub mod simulated;

pub use crate::cache::ReceiverCache;
pub use crate::config::{ConfigError, EventHubsConf};
pub use crate::core::{
    ErrorKind, EventData, EventHubClient, EventHubsError, EventPosition, PartitionReceiver,
    PartitionRuntimeInformation, ReceiverOptions,
};
pub use crate::engine::CursorEngine;
pub use crate::pool::{ClientConnectionPool, ClientFactory, PooledClient};
pub use crate::reporter::{
    DriverGateway, PartitionPerformanceMetric, TaskContext, PARTITION_PERFORMANCE_RECEIVER,
};
