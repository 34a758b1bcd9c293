//! The service-client contract the receiver stack is written against.
//!
//! The AMQP SDK is an external collaborator; this module pins down the
//! observable contract the cursor engine relies on and nothing more. Real
//! bindings register a [`ClientFactory`] under [`DEFAULT_CLIENT_FACTORY`] at
//! process init; the in-memory [`simulated`] backend is selected by the
//! `useSimulatedClient` option and backs the test suite.

pub mod pool;
pub mod simulated;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::evstream::conf::EventHubsConf;
use crate::evstream::error::{EventHubsError, Result};
use crate::evstream::event::EventData;
use crate::evstream::types::{EventPosition, SequenceNumber};

/// Options applied when a receiver link is created.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Unique per worker and task; shows up in service-side diagnostics
    pub identifier: String,
    /// Advisory prefetch depth; the batch boundary is enforced by the engine
    pub prefetch_count: u32,
    /// Open as an epoch receiver, evicting any other receiver on the
    /// partition and consumer group
    pub exclusive: bool,
    /// Ask the service to attach runtime metrics to deliveries
    pub enable_runtime_metrics: bool,
}

/// Snapshot of a partition's retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRuntimeInfo {
    pub partition_id: i32,
    /// Lowest sequence number still retained; events below it are gone
    pub begin_sequence_number: SequenceNumber,
    /// Sequence number of the last enqueued event, `-1` when empty
    pub last_sequence_number: SequenceNumber,
}

/// One AMQP connection to an event hub.
#[async_trait]
pub trait EventHubClient: Send + Sync {
    async fn create_receiver(
        &self,
        consumer_group: &str,
        partition_id: i32,
        position: EventPosition,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn PartitionReceiver>>;

    async fn partition_runtime_info(&self, partition_id: i32) -> Result<PartitionRuntimeInfo>;

    async fn close(&self) -> Result<()>;
}

/// One live receiver link on one partition.
///
/// Implementations may assume at most one `receive_one` is in flight at a
/// time; the owning reader serializes calls.
#[async_trait]
pub trait PartitionReceiver: Send + Sync {
    /// The next event, or `None` when nothing arrived within `timeout`.
    async fn receive_one(&self, timeout: Duration) -> Result<Option<EventData>>;

    /// Transport liveness of the link.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Builds a client for a validated configuration.
pub type ClientFactory =
    Arc<dyn Fn(EventHubsConf) -> BoxFuture<'static, Result<Arc<dyn EventHubClient>>> + Send + Sync>;

/// Name the production AMQP binding registers itself under.
pub const DEFAULT_CLIENT_FACTORY: &str = "amqp";

static FACTORIES: OnceLock<Mutex<HashMap<String, ClientFactory>>> = OnceLock::new();

fn factories() -> &'static Mutex<HashMap<String, ClientFactory>> {
    FACTORIES.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register_client_factory(name: &str, factory: ClientFactory) {
    factories().lock().unwrap().insert(name.to_string(), factory);
}

/// Construct a client for `conf`, honoring the `useSimulatedClient` option.
pub(crate) async fn create_client(conf: &EventHubsConf) -> Result<Arc<dyn EventHubClient>> {
    if conf.use_simulated_client() {
        return simulated::SimulatedClient::connect(conf);
    }
    let factory = factories()
        .lock()
        .unwrap()
        .get(DEFAULT_CLIENT_FACTORY)
        .cloned()
        .ok_or_else(|| {
            EventHubsError::Configuration(format!(
                "no '{}' client factory registered; register one at process init \
                 or enable the simulated client",
                DEFAULT_CLIENT_FACTORY
            ))
        })?;
    factory(conf.clone()).await
}
