//! In-memory Event Hubs used by the test suite and by the
//! `useSimulatedClient` option.
//!
//! A simulated hub is registered globally under its event hub name so that a
//! client constructed from a connection string can find it. Tests seed
//! events, advance the retention window with [`SimulatedEventHubs::trim`],
//! and inject failures; per-partition counters expose how many receivers
//! were created, receive calls made, and links closed, which is how the
//! recreate/close behavior of the cursor engine is asserted.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::evstream::client::{
    EventHubClient, PartitionReceiver, PartitionRuntimeInfo, ReceiverOptions,
};
use crate::evstream::conf::EventHubsConf;
use crate::evstream::error::{EventHubsError, Result};
use crate::evstream::event::EventData;
use crate::evstream::types::{EventPosition, SequenceNumber};

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<SimulatedEventHubs>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<SimulatedEventHubs>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Default)]
struct SimulatedPartition {
    events: BTreeMap<SequenceNumber, EventData>,
    next_seq: SequenceNumber,
    begin: SequenceNumber,
    pending_failures: VecDeque<EventHubsError>,
    epoch: u64,
    receivers_created: u64,
    receive_calls: u64,
    closes: u64,
}

/// One simulated event hub with a fixed partition set.
pub struct SimulatedEventHubs {
    name: String,
    partitions: Mutex<HashMap<i32, SimulatedPartition>>,
    clients_created: AtomicU64,
}

impl SimulatedEventHubs {
    /// Create and globally register a hub. The name must match the
    /// `EntityPath` of the connection string tests use.
    pub fn create(name: &str, partition_count: i32) -> Arc<Self> {
        let mut partitions = HashMap::new();
        for id in 0..partition_count {
            partitions.insert(id, SimulatedPartition::default());
        }
        let hubs = Arc::new(Self {
            name: name.to_string(),
            partitions: Mutex::new(partitions),
            clients_created: AtomicU64::new(0),
        });
        registry()
            .lock()
            .unwrap()
            .insert(name.to_string(), hubs.clone());
        hubs
    }

    pub fn lookup(name: &str) -> Option<Arc<Self>> {
        registry().lock().unwrap().get(name).cloned()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append events to a partition; sequence numbers are assigned
    /// monotonically from zero.
    pub fn send<I, B>(&self, partition_id: i32, bodies: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let mut guard = self.partitions.lock().unwrap();
        let partition = guard
            .get_mut(&partition_id)
            .unwrap_or_else(|| panic!("no simulated partition {}", partition_id));
        for body in bodies {
            let seq = partition.next_seq;
            let event = EventData::new(body.into(), seq, seq.to_string())
                .with_enqueued_time(Utc::now());
            partition.events.insert(seq, event);
            partition.next_seq = seq + 1;
        }
    }

    /// Advance the retention window: events below `new_begin` are gone, the
    /// way the service garbage-collects an expired retention period.
    pub fn trim(&self, partition_id: i32, new_begin: SequenceNumber) {
        let mut guard = self.partitions.lock().unwrap();
        if let Some(partition) = guard.get_mut(&partition_id) {
            partition.begin = new_begin;
            partition.events.retain(|seq, _| *seq >= new_begin);
        }
    }

    /// Queue an error for the next `receive_one` on the partition.
    pub fn inject_receive_failure(&self, partition_id: i32, error: EventHubsError) {
        let mut guard = self.partitions.lock().unwrap();
        if let Some(partition) = guard.get_mut(&partition_id) {
            partition.pending_failures.push_back(error);
        }
    }

    pub fn receivers_created(&self, partition_id: i32) -> u64 {
        self.partitions
            .lock()
            .unwrap()
            .get(&partition_id)
            .map(|p| p.receivers_created)
            .unwrap_or(0)
    }

    pub fn receive_calls(&self, partition_id: i32) -> u64 {
        self.partitions
            .lock()
            .unwrap()
            .get(&partition_id)
            .map(|p| p.receive_calls)
            .unwrap_or(0)
    }

    pub fn closes(&self, partition_id: i32) -> u64 {
        self.partitions
            .lock()
            .unwrap()
            .get(&partition_id)
            .map(|p| p.closes)
            .unwrap_or(0)
    }

    pub fn clients_created(&self) -> u64 {
        self.clients_created.load(Ordering::SeqCst)
    }
}

/// Simulated connection to one registered hub.
pub struct SimulatedClient {
    hubs: Arc<SimulatedEventHubs>,
    closed: AtomicBool,
}

impl SimulatedClient {
    pub fn connect(conf: &EventHubsConf) -> Result<Arc<dyn EventHubClient>> {
        let name = conf.name()?;
        let hubs = SimulatedEventHubs::lookup(&name).ok_or_else(|| {
            EventHubsError::Configuration(format!(
                "no simulated event hub named '{}' has been created",
                name
            ))
        })?;
        hubs.clients_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedClient {
            hubs,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl EventHubClient for SimulatedClient {
    async fn create_receiver(
        &self,
        _consumer_group: &str,
        partition_id: i32,
        position: EventPosition,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn PartitionReceiver>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventHubsError::Connection(
                "simulated client is closed".to_string(),
            ));
        }
        let mut guard = self.hubs.partitions.lock().unwrap();
        let partition = guard.get_mut(&partition_id).ok_or_else(|| {
            EventHubsError::Configuration(format!(
                "event hub '{}' has no partition {}",
                self.hubs.name, partition_id
            ))
        })?;
        partition.receivers_created += 1;
        if options.exclusive {
            // A new epoch receiver evicts whoever held the partition before.
            partition.epoch += 1;
        }
        let cursor = match position {
            // The service starts at the first retained event at or after the
            // requested position.
            EventPosition::SequenceNumber(seq) => seq.max(partition.begin),
            EventPosition::Earliest => partition.begin,
            EventPosition::Latest => partition.next_seq,
        };
        Ok(Box::new(SimulatedReceiver {
            hubs: self.hubs.clone(),
            partition_id,
            cursor: AtomicI64::new(cursor),
            open: AtomicBool::new(true),
            epoch: partition.epoch,
        }))
    }

    async fn partition_runtime_info(&self, partition_id: i32) -> Result<PartitionRuntimeInfo> {
        let guard = self.hubs.partitions.lock().unwrap();
        let partition = guard.get(&partition_id).ok_or_else(|| {
            EventHubsError::Configuration(format!(
                "event hub '{}' has no partition {}",
                self.hubs.name, partition_id
            ))
        })?;
        Ok(PartitionRuntimeInfo {
            partition_id,
            begin_sequence_number: partition.begin,
            last_sequence_number: partition.next_seq - 1,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SimulatedReceiver {
    hubs: Arc<SimulatedEventHubs>,
    partition_id: i32,
    cursor: AtomicI64,
    open: AtomicBool,
    epoch: u64,
}

#[async_trait]
impl PartitionReceiver for SimulatedReceiver {
    async fn receive_one(&self, _timeout: Duration) -> Result<Option<EventData>> {
        let mut guard = self.hubs.partitions.lock().unwrap();
        let partition = guard.get_mut(&self.partition_id).ok_or_else(|| {
            EventHubsError::Internal(format!("partition {} disappeared", self.partition_id))
        })?;
        partition.receive_calls += 1;

        if let Some(err) = partition.pending_failures.pop_front() {
            if matches!(err, EventHubsError::ReceiverDisconnected(_)) {
                self.open.store(false, Ordering::SeqCst);
            }
            return Err(err);
        }

        if partition.epoch != self.epoch {
            self.open.store(false, Ordering::SeqCst);
            return Err(EventHubsError::ReceiverDisconnected(format!(
                "epoch receiver {} owns partition {}",
                partition.epoch, self.partition_id
            )));
        }

        if !self.open.load(Ordering::SeqCst) {
            return Err(EventHubsError::ReceiverDisconnected(
                "receiver link is closed".to_string(),
            ));
        }

        let mut cursor = self.cursor.load(Ordering::SeqCst);
        if cursor < partition.begin {
            // Requested events were trimmed; the service resumes at the
            // earliest retained one.
            cursor = partition.begin;
        }
        match partition.events.get(&cursor) {
            Some(event) => {
                self.cursor.store(cursor + 1, Ordering::SeqCst);
                Ok(Some(event.clone()))
            }
            // Nothing available: the simulated service reports an empty
            // receive immediately instead of waiting out the timeout.
            None => Ok(None),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let mut guard = self.hubs.partitions.lock().unwrap();
        if let Some(partition) = guard.get_mut(&self.partition_id) {
            partition.closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ReceiverOptions {
        ReceiverOptions {
            identifier: "worker-test-0".to_string(),
            prefetch_count: 500,
            exclusive: false,
            enable_runtime_metrics: true,
        }
    }

    fn sim_conf(hub: &str) -> EventHubsConf {
        EventHubsConf::new(format!(
            "Endpoint=sb://sim.servicebus.windows.net/;SharedAccessKeyName=policy;\
             SharedAccessKey=secret;EntityPath={}",
            hub
        ))
        .set_use_simulated_client(true)
    }

    #[tokio::test]
    async fn test_receive_walks_the_partition_in_order() {
        let hubs = SimulatedEventHubs::create("sim-order", 1);
        hubs.send(0, (0..5).map(|i| format!("event-{}", i).into_bytes()));
        let client = SimulatedClient::connect(&sim_conf("sim-order")).unwrap();
        let receiver = client
            .create_receiver("$Default", 0, EventPosition::SequenceNumber(0), &options())
            .await
            .unwrap();

        for expected in 0..5 {
            let event = receiver
                .receive_one(Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.sequence_number(), expected);
        }
        assert!(receiver.receive_one(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trim_moves_the_cursor_to_the_retention_begin() {
        let hubs = SimulatedEventHubs::create("sim-trim", 1);
        hubs.send(0, (0..10).map(|i| vec![i as u8]));
        let client = SimulatedClient::connect(&sim_conf("sim-trim")).unwrap();
        let receiver = client
            .create_receiver("$Default", 0, EventPosition::SequenceNumber(2), &options())
            .await
            .unwrap();
        hubs.trim(0, 7);

        let event = receiver
            .receive_one(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sequence_number(), 7);

        let info = client.partition_runtime_info(0).await.unwrap();
        assert_eq!(info.begin_sequence_number, 7);
        assert_eq!(info.last_sequence_number, 9);
    }

    #[tokio::test]
    async fn test_epoch_receiver_evicts_the_previous_link() {
        let hubs = SimulatedEventHubs::create("sim-epoch", 1);
        hubs.send(0, (0..4).map(|i| vec![i as u8]));
        let client = SimulatedClient::connect(&sim_conf("sim-epoch")).unwrap();
        let mut exclusive = options();
        exclusive.exclusive = true;

        let first = client
            .create_receiver("$Default", 0, EventPosition::SequenceNumber(0), &exclusive)
            .await
            .unwrap();
        let _second = client
            .create_receiver("$Default", 0, EventPosition::SequenceNumber(0), &exclusive)
            .await
            .unwrap();

        let err = first.receive_one(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EventHubsError::ReceiverDisconnected(_)));
        assert!(!first.is_open());
    }
}
