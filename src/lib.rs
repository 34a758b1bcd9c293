//! Cached Azure Event Hubs partition receiver for micro-batch streaming
//! engines.
//!
//! Worker tasks call [`ReceiverCache::receive`] with the exact half-open
//! sequence-number range their batch covers; the cache keeps one long-lived
//! receiver per (connection string, consumer group, partition) whose cursor
//! is reused across successive batches, recovering from cursor drift,
//! expired events, and stolen or dead links along the way.

pub mod evstream;

// Re-export the main API
pub use evstream::client::pool::ClientConnectionPool;
pub use evstream::client::{
    register_client_factory, ClientFactory, EventHubClient, PartitionReceiver,
    PartitionRuntimeInfo, ReceiverOptions,
};
pub use evstream::conf::{ConnectionString, EventHubsConf};
pub use evstream::error::{EventHubsError, Result};
pub use evstream::event::EventData;
pub use evstream::receiver::{
    DriverEndpoint, PartitionPerformanceMetric, ReceiverCache, PARTITION_PERFORMANCE_RECEIVER,
};
pub use evstream::types::{EventPosition, NameAndPartition, SequenceNumber, TaskContext};
