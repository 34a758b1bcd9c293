//! The cursor state machine: exact-range batch delivery over one reader.

use std::sync::Arc;
use std::time::Instant;

use crate::evstream::client::pool::ClientConnectionPool;
use crate::evstream::client::EventHubClient;
use crate::evstream::conf::EventHubsConf;
use crate::evstream::error::{EventHubsError, Result};
use crate::evstream::event::EventData;
use crate::evstream::plugins::MetricPlugin;
use crate::evstream::receiver::partition_reader::PartitionReader;
use crate::evstream::receiver::perf::{PartitionPerformanceMetric, PerfReporter};
use crate::evstream::retry::{retry_on_error, retry_while_none};
use crate::evstream::types::{NameAndPartition, SequenceNumber, TaskContext};

/// The most recent successfully served batch, kept so that a re-executed
/// request for the same range is answered without I/O. Only an exact
/// `(request_seq_no, batch_size)` match uses it.
#[derive(Debug, Clone)]
struct CachedBatch {
    request_seq_no: SequenceNumber,
    batch_size: u32,
    events: Vec<EventData>,
}

/// Drives one [`PartitionReader`] to produce exact sequence-number ranges.
///
/// The surrounding framework runs at most one task per partition at a time,
/// so `receive` is never called concurrently on one engine and no internal
/// locking is needed beyond what ownership requires.
pub struct CursorEngine {
    conf: EventHubsConf,
    name_and_partition: NameAndPartition,
    client: Arc<dyn EventHubClient>,
    reader: PartitionReader,
    cached: Option<CachedBatch>,
    metric_plugin: Option<Arc<dyn MetricPlugin>>,
    reporter: PerfReporter,
}

impl CursorEngine {
    pub async fn new(
        conf: &EventHubsConf,
        name_and_partition: &NameAndPartition,
        start_seq_no: SequenceNumber,
    ) -> Result<Self> {
        conf.validate()?;
        let client = ClientConnectionPool::borrow(conf).await?;
        let reader = PartitionReader::new(conf, name_and_partition, client.clone());
        log::info!(
            "{}: caching a new receiver starting at sequence number {}",
            name_and_partition,
            start_seq_no
        );
        Ok(Self {
            conf: conf.clone(),
            name_and_partition: name_and_partition.clone(),
            client,
            reader,
            cached: None,
            metric_plugin: conf.metric_plugin()?,
            reporter: PerfReporter::new(),
        })
    }

    /// Produce the events `[request_seq_no, request_seq_no + batch_size)`, in
    /// ascending sequence-number order.
    ///
    /// When the requested range has been trimmed by the service, delivery
    /// starts at the partition's begin sequence number instead and the batch
    /// shrinks accordingly (possibly to empty).
    pub async fn receive(
        &mut self,
        ctx: &TaskContext,
        request_seq_no: SequenceNumber,
        batch_size: u32,
    ) -> Result<Vec<EventData>> {
        if let Some(cached) = &self.cached {
            if cached.request_seq_no == request_seq_no && cached.batch_size == batch_size {
                log::debug!(
                    "{}: serving the batch at {} (size {}) from the last-batch cache",
                    self.name_and_partition,
                    request_seq_no,
                    batch_size
                );
                return Ok(cached.events.clone());
            }
        }

        let started = Instant::now();
        self.reader.update_task(ctx);

        let first = self.check_cursor(request_seq_no).await?;
        let first_seq = first.sequence_number();
        let batch_count = request_seq_no + i64::from(batch_size) - first_seq;
        if batch_count <= 0 {
            // The whole requested range sits below the earliest available
            // event; an empty batch is the normal terminal outcome here.
            log::info!(
                "{}: request at {} (size {}) is entirely below the earliest available event {}; \
                 returning an empty batch",
                self.name_and_partition,
                request_seq_no,
                batch_size,
                first_seq
            );
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(batch_count as usize);
        events.push(first);
        // Fail the whole batch on a mid-batch timeout rather than deliver a
        // gapped one; receive_or_reset leaves a fresh receiver behind.
        for _ in 1..batch_count {
            let event = self
                .receive_or_reset("receiving a batch event", request_seq_no)
                .await?;
            events.push(event);
        }

        // The service delivers in order, but sorting is cheap and the batch
        // contract is strict.
        events.sort_by_key(|e| e.sequence_number());
        assert_eq!(
            events.len(),
            batch_count as usize,
            "{}: batch at {} materialized {} events, expected {}",
            self.name_and_partition,
            request_seq_no,
            events.len(),
            batch_count
        );

        let elapsed = started.elapsed();
        if let Some(plugin) = &self.metric_plugin {
            let batch_bytes = events.iter().map(|e| e.body().len() as u64).sum();
            plugin.on_receive_metric(&self.name_and_partition, events.len(), batch_bytes, elapsed);
        }
        if self.conf.slow_partition_adjustment() {
            self.reporter.report(PartitionPerformanceMetric {
                partition: self.name_and_partition.clone(),
                task: ctx.clone(),
                batch_start_seq_no: request_seq_no,
                batch_count: events.len() as u32,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        self.cached = Some(CachedBatch {
            request_seq_no,
            batch_size,
            events: events.clone(),
        });
        Ok(events)
    }

    /// Align the reader on `request_seq_no` and return the first event of the
    /// batch.
    ///
    /// A cursor that is closed, idle too long, or not adjacent to the request
    /// gets one recreate. If the first delivery still misses, one more
    /// recreate is tried; after that, either the request has been trimmed
    /// (delivery resumed at the partition's begin, which is accepted) or the
    /// cursor is genuinely lost.
    async fn check_cursor(&mut self, request_seq_no: SequenceNumber) -> Result<EventData> {
        let adjacent = match self.reader.last_received_sequence() {
            Some(last) => last + 1 == request_seq_no,
            None => true,
        };
        let idle_too_long = self.reader.idle_for() > self.conf.max_silent_time();
        if !adjacent || !self.reader.is_open() || idle_too_long {
            log::info!(
                "{}: cursor is out of place for {} (last received {:?}, open {}, idle {:?}); \
                 recreating the receiver",
                self.name_and_partition,
                request_seq_no,
                self.reader.last_received_sequence(),
                self.reader.is_open(),
                self.reader.idle_for()
            );
            self.reader.recreate(request_seq_no).await?;
        }

        let first = self
            .receive_or_reset("receiving the first event", request_seq_no)
            .await?;
        if first.sequence_number() == request_seq_no {
            return Ok(first);
        }

        log::warn!(
            "{}: expected event {} but the service delivered {}; recreating the receiver once more",
            self.name_and_partition,
            request_seq_no,
            first.sequence_number()
        );
        self.reader.recreate(request_seq_no).await?;
        let moved = self
            .receive_or_reset("receiving the first event after realignment", request_seq_no)
            .await?;
        if moved.sequence_number() == request_seq_no {
            return Ok(moved);
        }

        let partition_id = self.name_and_partition.partition_id();
        let client = &self.client;
        let info = retry_on_error(
            "fetching partition runtime information",
            self.conf.operation_timeout(),
            || client.partition_runtime_info(partition_id),
            None,
        )
        .await?;
        if request_seq_no < info.begin_sequence_number
            && moved.sequence_number() == info.begin_sequence_number
        {
            // The requested events were garbage-collected by the service;
            // advance to the earliest available instead of failing.
            log::warn!(
                "{}: events at {} have expired; continuing from the earliest retained event {}",
                self.name_and_partition,
                request_seq_no,
                info.begin_sequence_number
            );
            return Ok(moved);
        }

        Err(EventHubsError::CursorLost {
            partition: self.name_and_partition.to_string(),
            requested: request_seq_no,
            received: moved.sequence_number(),
            begin: info.begin_sequence_number,
            last: info.last_sequence_number,
        })
    }

    /// One event off the reader, retrying empty receives. A timeout recreates
    /// the receiver at `request_seq_no` before surfacing, so the next call
    /// starts from a clean slate.
    async fn receive_or_reset(
        &mut self,
        label: &str,
        request_seq_no: SequenceNumber,
    ) -> Result<EventData> {
        match self.next_event(label).await {
            Err(err @ EventHubsError::Timeout { .. }) => {
                log::warn!(
                    "{}: {} timed out; recreating the receiver at {} before surfacing",
                    self.name_and_partition,
                    label,
                    request_seq_no
                );
                if let Err(recreate_err) = self.reader.recreate(request_seq_no).await {
                    log::warn!(
                        "{}: receiver recreation after a timeout failed: {}",
                        self.name_and_partition,
                        recreate_err
                    );
                }
                Err(err)
            }
            other => other,
        }
    }

    async fn next_event(&self, label: &str) -> Result<EventData> {
        let timeout = self.conf.receiver_timeout();
        let reader = &self.reader;
        retry_while_none(label, self.conf.operation_timeout(), || {
            reader.receive_one(timeout)
        })
        .await
    }

    pub fn name_and_partition(&self) -> &NameAndPartition {
        &self.name_and_partition
    }
}
