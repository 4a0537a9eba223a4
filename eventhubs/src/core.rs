//! Contract of the Event Hubs SDK surface this crate drives.
//!
//! The AMQP SDK itself is an external collaborator; this module captures its
//! observable behavior as object-safe async traits so the connector can be
//! exercised against an in-memory implementation (see [`crate::simulated`]).

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use backoff::RetryError;
use data_types::{PartitionId, SequenceNumber};

/// Message fragment by which a closed reactor dispatcher announces itself.
///
/// The SDK surfaces a closed reactor as a nested rejected-execution error
/// that carries this string; there is no typed discriminant for it. The
/// match is isolated in [`EventHubsError::is_reactor_closed`] so it can be
/// retuned when the SDK error taxonomy improves.
pub const REACTOR_CLOSED_MESSAGE: &str = "ReactorDispatcher instance is closed";

/// Generic boxed error type that is used in this crate.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// transport implementations.
#[derive(Debug)]
pub struct EventHubsError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: ErrorKind,
}

impl EventHubsError {
    pub fn new(
        kind: ErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    pub fn transient(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::Transient, e)
    }

    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::InvalidInput, e)
    }

    pub fn receiver_disconnected(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::ReceiverDisconnected, e)
    }

    pub fn operation_timeout(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::OperationTimeout, e)
    }

    pub fn cursor_lost(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::CursorLost, e)
    }

    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the inner error
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }

    /// Whether the retry layer may try this operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient)
    }

    /// Whether this failure is a closed reactor dispatcher.
    ///
    /// Scans the error chain for [`REACTOR_CLOSED_MESSAGE`]. The receiver
    /// cache recovers from this by force-closing the pooled client and
    /// rebuilding the whole engine.
    pub fn is_reactor_closed(&self) -> bool {
        let mut current: Option<&dyn std::error::Error> = Some(self.inner.as_ref());
        while let Some(e) = current {
            if e.to_string().contains(REACTOR_CLOSED_MESSAGE) {
                return true;
            }
            current = e.source();
        }
        false
    }
}

impl Display for EventHubsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventHubsError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for EventHubsError {}

impl From<RetryError<EventHubsError>> for EventHubsError {
    fn from(e: RetryError<EventHubsError>) -> Self {
        match e {
            RetryError::Terminal { source } => source,
            e @ RetryError::OperationTimeout { .. } => Self::new(ErrorKind::OperationTimeout, e),
        }
    }
}

impl From<String> for EventHubsError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: ErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for EventHubsError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// This operation failed for an unknown reason
    Unknown,

    /// This operation was provided with invalid input (including invalid
    /// configuration)
    InvalidInput,

    /// Transport timeout, reactor busy, server busy: safe to retry
    Transient,

    /// The per-call wall-clock budget was exhausted
    OperationTimeout,

    /// Another exclusive (epoch) receiver took over the link
    ReceiverDisconnected,

    /// The cursor could not be re-aligned to the requested sequence number
    CursorLost,
}

/// A single event as delivered by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Opaque payload bytes.
    pub body: Vec<u8>,

    /// Broker-assigned position of this event within its partition.
    pub sequence_number: SequenceNumber,

    /// Broker-assigned byte offset within the partition.
    pub offset: i64,

    /// Milliseconds since the Unix epoch at which the service accepted the
    /// event.
    pub enqueued_time_millis: i64,

    /// Application-set properties.
    pub properties: HashMap<String, String>,
}

/// Position at which a new receiver attaches to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPosition {
    /// Start at the given sequence number (inclusive).
    FromSequenceNumber(SequenceNumber),

    /// Earliest event still retained by the service.
    StartOfStream,

    /// Only events enqueued after the receiver opens.
    EndOfStream,
}

/// Options applied when creating a receiver.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Link identifier, unique per worker and task.
    pub identifier: String,

    /// Number of events the SDK pulls eagerly into its local buffer.
    pub prefetch_count: u32,

    /// When set, open an epoch (exclusive) receiver. The service evicts any
    /// other receiver on the same partition and consumer group.
    pub epoch: Option<i64>,

    /// Ask the service to piggyback partition runtime metrics on deliveries.
    pub enable_runtime_metrics: bool,
}

/// Snapshot of a partition's retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRuntimeInformation {
    /// The partition described by this snapshot.
    pub partition_id: PartitionId,

    /// Lowest sequence number still retained by the service. Events below
    /// this have been garbage-collected.
    pub begin_sequence_number: SequenceNumber,

    /// Sequence number of the most recently enqueued event.
    pub last_enqueued_sequence_number: SequenceNumber,

    /// Byte offset of the most recently enqueued event.
    pub last_enqueued_offset: i64,
}

/// One live AMQP link onto a single partition.
///
/// At most one `receive_one` call may be in flight at a time; the cursor
/// engine upholds this by owning its receiver exclusively.
#[async_trait]
pub trait PartitionReceiver: Sync + Send + Debug + 'static {
    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `Ok(None)` when the wait elapsed without a delivery; the
    /// caller decides whether that is fatal.
    async fn receive_one(&self, timeout: Duration) -> Result<Option<EventData>, EventHubsError>;

    /// Tear down the link. Safe to call more than once.
    async fn close(&self) -> Result<(), EventHubsError>;
}

#[async_trait]
impl PartitionReceiver for Box<dyn PartitionReceiver> {
    async fn receive_one(&self, timeout: Duration) -> Result<Option<EventData>, EventHubsError> {
        self.as_ref().receive_one(timeout).await
    }

    async fn close(&self) -> Result<(), EventHubsError> {
        self.as_ref().close().await
    }
}

/// Connection-level handle onto one Event Hubs namespace entity.
///
/// Instances are shared through [`crate::pool::ClientConnectionPool`]; the
/// pool tears the connection down when the last borrower returns it.
#[async_trait]
pub trait EventHubClient: Sync + Send + Debug + 'static {
    /// Open a receiver on `partition_id` at `position`.
    async fn create_receiver(
        &self,
        consumer_group: &str,
        partition_id: PartitionId,
        position: EventPosition,
        options: ReceiverOptions,
    ) -> Result<Box<dyn PartitionReceiver>, EventHubsError>;

    /// Fetch the partition's current retention window.
    async fn partition_runtime_information(
        &self,
        partition_id: PartitionId,
    ) -> Result<PartitionRuntimeInformation, EventHubsError>;

    /// Tear down the connection and every link on it.
    async fn close(&self) -> Result<(), EventHubsError>;
}
