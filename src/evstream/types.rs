//! Identifiers shared across the receiver stack.

use serde::Serialize;
use std::fmt;

/// Broker-assigned, monotone per-partition event identifier.
pub type SequenceNumber = i64;

/// Stable identity of one partition of one event hub.
///
/// The string form is `"<name>-<id>"` and is what shows up in logs and in
/// driver-side performance metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NameAndPartition {
    event_hub_name: String,
    partition_id: i32,
}

impl NameAndPartition {
    pub fn new(event_hub_name: impl Into<String>, partition_id: i32) -> Self {
        assert!(partition_id >= 0, "partition id must be non-negative");
        Self {
            event_hub_name: event_hub_name.into(),
            partition_id,
        }
    }

    pub fn event_hub_name(&self) -> &str {
        &self.event_hub_name
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }
}

impl fmt::Display for NameAndPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.event_hub_name, self.partition_id)
    }
}

/// Where a newly created receiver starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPosition {
    /// The first event with a sequence number at or after the given one
    SequenceNumber(SequenceNumber),
    /// The earliest event still retained by the service
    Earliest,
    /// Only events enqueued after the receiver opens
    Latest,
}

impl EventPosition {
    pub fn from_sequence_number(seq_no: SequenceNumber) -> Self {
        EventPosition::SequenceNumber(seq_no)
    }
}

/// Identity of the host-framework task driving a `receive` call.
///
/// Supplied by the surrounding compute framework; the receiver only needs it
/// to build a unique receiver identifier and to tag performance metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskContext {
    executor_id: String,
    task_id: i64,
    attempt_number: i32,
}

impl TaskContext {
    pub fn new(executor_id: impl Into<String>, task_id: i64, attempt_number: i32) -> Self {
        Self {
            executor_id: executor_id.into(),
            task_id,
            attempt_number,
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn attempt_number(&self) -> i32 {
        self.attempt_number
    }

    /// Receiver identifier, unique per worker and task.
    pub fn receiver_identifier(&self) -> String {
        format!("worker-{}-{}", self.executor_id, self.task_id)
    }
}
