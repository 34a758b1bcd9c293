//! The event record handed out by a partition receiver.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::evstream::types::SequenceNumber;

/// One event as delivered by the service.
///
/// Carries the opaque body plus the broker-assigned metadata the cursor
/// engine needs: the sequence number orders events within a partition, the
/// offset and enqueued time ride along for checkpointing and latency
/// accounting upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    body: Vec<u8>,
    sequence_number: SequenceNumber,
    offset: String,
    enqueued_time: Option<DateTime<Utc>>,
    partition_key: Option<String>,
    properties: HashMap<String, String>,
}

impl EventData {
    pub fn new(body: Vec<u8>, sequence_number: SequenceNumber, offset: impl Into<String>) -> Self {
        Self {
            body,
            sequence_number,
            offset: offset.into(),
            enqueued_time: None,
            partition_key: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_enqueued_time(mut self, enqueued_time: DateTime<Utc>) -> Self {
        self.enqueued_time = Some(enqueued_time);
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn offset(&self) -> &str {
        &self.offset
    }

    pub fn enqueued_time(&self) -> Option<DateTime<Utc>> {
        self.enqueued_time
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}
