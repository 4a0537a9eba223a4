//! Shared data types for the Event Hubs connector.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Add;

/// Sequence number assigned by the broker to each event within a partition.
///
/// Monotonically increasing per partition. "No event delivered yet" is
/// expressed as `Option::<SequenceNumber>::None`, never as a sentinel value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

#[allow(missing_docs)]
impl SequenceNumber {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Add<i64> for SequenceNumber {
    type Output = Self;

    fn add(self, other: i64) -> Self {
        Self(self.0 + other)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition index within an event hub. Always `>= 0`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PartitionId(i32);

#[allow(missing_docs)]
impl PartitionId {
    pub fn new(v: i32) -> Self {
        assert!(v >= 0, "partition id must be non-negative, got {v}");
        Self(v)
    }
    pub fn get(&self) -> i32 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for one partition of one event hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameAndPartition {
    /// Name of the event hub (the `EntityPath` of the connection string).
    pub event_hub_name: String,

    /// Partition within the event hub.
    pub partition_id: PartitionId,
}

impl NameAndPartition {
    /// Create a new identifier for the given hub/partition pair.
    pub fn new(event_hub_name: impl Into<String>, partition_id: PartitionId) -> Self {
        Self {
            event_hub_name: event_hub_name.into(),
            partition_id,
        }
    }
}

impl Display for NameAndPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.event_hub_name, self.partition_id)
    }
}
