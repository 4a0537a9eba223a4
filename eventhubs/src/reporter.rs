//! Per-batch performance reporting to the driver.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use data_types::{NameAndPartition, SequenceNumber};
use observability_deps::tracing::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::EventHubsError;

/// Well-known name of the driver endpoint that consumes
/// [`PartitionPerformanceMetric`] messages.
pub const PARTITION_PERFORMANCE_RECEIVER: &str = "PartitionPerformanceReceiver";

/// Identity of the running task, supplied by the compute framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Identity of the executor process hosting the task.
    pub executor_id: String,

    /// Unique id of this task attempt.
    pub task_attempt_id: i64,
}

impl TaskContext {
    pub fn new(executor_id: impl Into<String>, task_attempt_id: i64) -> Self {
        Self {
            executor_id: executor_id.into(),
            task_attempt_id,
        }
    }
}

/// One successful batch, measured. Enough for the driver to build an
/// adaptive rate plan; the worker never reads a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPerformanceMetric {
    /// Partition the batch was served from.
    pub name_and_partition: NameAndPartition,

    /// Task that consumed the batch.
    pub task_context: TaskContext,

    /// First sequence number requested.
    pub batch_start: SequenceNumber,

    /// Number of events delivered.
    pub batch_count: usize,

    /// Wall-clock time spent serving the batch.
    pub elapsed: Duration,
}

/// One-way RPC surface to the driver.
#[async_trait]
pub trait DriverGateway: Sync + Send + Debug + 'static {
    /// Post a message to a named driver endpoint without reading a response.
    async fn send_one_way(
        &self,
        endpoint: &str,
        metric: PartitionPerformanceMetric,
    ) -> Result<(), EventHubsError>;
}

/// Fire-and-forget notifier used when slow-partition adjustment is on.
///
/// Losing a metric must never fail a batch: sends happen on a spawned task
/// and failures are logged at error level and dropped.
#[derive(Debug, Clone)]
pub(crate) struct PerfReporter {
    gateway: Arc<dyn DriverGateway>,
}

impl PerfReporter {
    pub(crate) fn new(gateway: Arc<dyn DriverGateway>) -> Self {
        Self { gateway }
    }

    pub(crate) fn report(&self, metric: PartitionPerformanceMetric) {
        let gateway = Arc::clone(&self.gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway
                .send_one_way(PARTITION_PERFORMANCE_RECEIVER, metric)
                .await
            {
                error!(e=%e, "failed to report partition performance to the driver");
            }
        });
    }
}
