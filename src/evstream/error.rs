//! Receiver error types and classification.

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Message fragment the service embeds when an AMQP reactor dispatcher has
/// been shut down underneath a live receiver. Detection is a substring match
/// on the rendered error; keep it behind [`is_reactor_dispatcher_closed`] so
/// it can be retuned if the transport ever types this condition properly.
pub const REACTOR_DISPATCHER_CLOSED: &str = "ReactorDispatcher instance is closed";

pub type Result<T> = std::result::Result<T, EventHubsError>;

#[derive(Debug, Clone)]
pub enum EventHubsError {
    /// Invalid or incomplete configuration; raised at validate time, never mid-batch
    Configuration(String),
    /// A receiver could not be created within the operation timeout
    Connection(String),
    /// Transient transport condition (timeout, server busy, reactor busy); retried
    Transient(String),
    /// The operation-timeout wall clock or the retry budget was exhausted
    Timeout { label: String, budget: Duration },
    /// The cursor could not be re-aligned and the delivered event is not at the
    /// partition's begin sequence number
    CursorLost {
        partition: String,
        requested: i64,
        received: i64,
        begin: i64,
        last: i64,
    },
    /// Another exclusive (epoch) receiver took over the partition link
    ReceiverDisconnected(String),
    /// Anything else the transport surfaces
    Internal(String),
}

impl EventHubsError {
    pub fn timeout(label: &str, budget: Duration) -> Self {
        EventHubsError::Timeout {
            label: label.to_string(),
            budget,
        }
    }

    /// Whether the retry policy may re-issue the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, EventHubsError::Transient(_))
    }
}

impl fmt::Display for EventHubsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventHubsError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            EventHubsError::Connection(msg) => write!(f, "Connection error: {}", msg),
            EventHubsError::Transient(msg) => write!(f, "Transient service error: {}", msg),
            EventHubsError::Timeout { label, budget } => {
                write!(f, "Operation timed out: {} exceeded {:?}", label, budget)
            }
            EventHubsError::CursorLost {
                partition,
                requested,
                received,
                begin,
                last,
            } => write!(
                f,
                "Cursor lost on {}: requested sequence number {} but the service delivered {} \
                 (partition retains [{}, {}])",
                partition, requested, received, begin, last
            ),
            EventHubsError::ReceiverDisconnected(msg) => {
                write!(f, "Receiver disconnected: {}", msg)
            }
            EventHubsError::Internal(msg) => write!(f, "Event Hubs error: {}", msg),
        }
    }
}

impl Error for EventHubsError {}

/// True when the rendered error carries the reactor-dispatcher-closed marker.
/// The cache recovers from this by force-closing the pooled client and
/// rebuilding the whole engine.
pub fn is_reactor_dispatcher_closed(err: &EventHubsError) -> bool {
    err.to_string().contains(REACTOR_DISPATCHER_CLOSED)
}
