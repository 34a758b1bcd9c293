//! Ownership of one live partition receiver link.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::evstream::client::{EventHubClient, PartitionReceiver, ReceiverOptions};
use crate::evstream::conf::EventHubsConf;
use crate::evstream::error::{EventHubsError, Result};
use crate::evstream::event::EventData;
use crate::evstream::retry::retry_on_error;
use crate::evstream::types::{EventPosition, NameAndPartition, SequenceNumber, TaskContext};

/// Owns one AMQP receiver link and its cursor bookkeeping.
///
/// After an open, the next event `receive_one` hands out has sequence number
/// `last_received_sequence() + 1`, unless `recreate` intervened or the
/// service trimmed events below the requested position.
pub struct PartitionReader {
    name_and_partition: NameAndPartition,
    client: Arc<dyn EventHubClient>,
    receiver: Option<Box<dyn PartitionReceiver>>,
    consumer_group: String,
    prefetch_count: u32,
    exclusive: bool,
    operation_timeout: Duration,
    // -1 until the first event is handed out
    last_received: AtomicI64,
    last_activity: Mutex<Instant>,
    identifier: Mutex<String>,
}

impl PartitionReader {
    pub fn new(
        conf: &EventHubsConf,
        name_and_partition: &NameAndPartition,
        client: Arc<dyn EventHubClient>,
    ) -> Self {
        Self {
            name_and_partition: name_and_partition.clone(),
            client,
            receiver: None,
            consumer_group: conf.consumer_group(),
            prefetch_count: conf.prefetch_count(),
            exclusive: conf.use_exclusive_receiver(),
            operation_timeout: conf.operation_timeout(),
            last_received: AtomicI64::new(-1),
            last_activity: Mutex::new(Instant::now()),
            identifier: Mutex::new(String::new()),
        }
    }

    /// Refresh the receiver identifier for the task currently driving this
    /// reader; it is applied on the next open.
    pub fn update_task(&self, ctx: &TaskContext) {
        *self.identifier.lock().unwrap() = ctx.receiver_identifier();
    }

    /// Open a receiver link at `start_seq_no`.
    pub async fn open(&mut self, start_seq_no: SequenceNumber) -> Result<()> {
        let options = ReceiverOptions {
            identifier: self.identifier.lock().unwrap().clone(),
            prefetch_count: self.prefetch_count,
            exclusive: self.exclusive,
            enable_runtime_metrics: true,
        };
        let partition_id = self.name_and_partition.partition_id();
        let client = &self.client;
        let consumer_group = &self.consumer_group;
        let receiver = retry_on_error(
            "creating a partition receiver",
            self.operation_timeout,
            || {
                client.create_receiver(
                    consumer_group,
                    partition_id,
                    EventPosition::from_sequence_number(start_seq_no),
                    &options,
                )
            },
            None,
        )
        .await
        .map_err(|err| match err {
            EventHubsError::Timeout { budget, .. } => EventHubsError::Connection(format!(
                "could not create a receiver for {} at sequence number {} within {:?}",
                self.name_and_partition, start_seq_no, budget
            )),
            other => other,
        })?;
        self.receiver = Some(receiver);
        self.touch();
        log::debug!(
            "{}: opened receiver at sequence number {} (prefetch {}, exclusive {})",
            self.name_and_partition,
            start_seq_no,
            self.prefetch_count,
            self.exclusive
        );
        Ok(())
    }

    /// The next event, or `None` when nothing arrived within `timeout`.
    /// Transient transport errors are retried; the caller decides whether an
    /// empty result is fatal.
    pub async fn receive_one(&self, timeout: Duration) -> Result<Option<EventData>> {
        let receiver = self.receiver.as_ref().ok_or_else(|| {
            EventHubsError::Internal(format!(
                "{}: receive on a reader with no open receiver",
                self.name_and_partition
            ))
        })?;
        let received = retry_on_error(
            "receiving an event",
            self.operation_timeout,
            || receiver.receive_one(timeout),
            None,
        )
        .await?;
        if let Some(event) = &received {
            self.last_received
                .store(event.sequence_number(), Ordering::SeqCst);
        }
        self.touch();
        Ok(received)
    }

    /// Sequence number of the last event handed out, if any.
    pub fn last_received_sequence(&self) -> Option<SequenceNumber> {
        match self.last_received.load(Ordering::SeqCst) {
            seq if seq < 0 => None,
            seq => Some(seq),
        }
    }

    pub fn is_open(&self) -> bool {
        self.receiver.as_ref().map_or(false, |r| r.is_open())
    }

    /// How long since this reader last touched the service.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Best-effort termination: transient failures fall back to success,
    /// anything else is logged and swallowed.
    pub async fn close(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            let result = retry_on_error(
                "closing a partition receiver",
                self.operation_timeout,
                || receiver.close(),
                Some(()),
            )
            .await;
            if let Err(err) = result {
                log::warn!(
                    "{}: closing the receiver failed; continuing: {}",
                    self.name_and_partition,
                    err
                );
            }
        }
    }

    /// Tear down the current link and open a fresh one at `start_seq_no`.
    /// In exclusive mode the old link is dropped without closing: the service
    /// evicts it when the replacement epoch receiver opens.
    pub async fn recreate(&mut self, start_seq_no: SequenceNumber) -> Result<()> {
        log::info!(
            "{}: recreating receiver at sequence number {}",
            self.name_and_partition,
            start_seq_no
        );
        if self.exclusive {
            self.receiver = None;
        } else {
            self.close().await;
        }
        self.last_received.store(-1, Ordering::SeqCst);
        self.open(start_seq_no).await
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}
