//! The cursor state machine serving exact micro-batch ranges.

use std::sync::Arc;
use std::time::Instant;

use backoff::{Backoff, BackoffConfig};
use data_types::{NameAndPartition, SequenceNumber};
use observability_deps::tracing::{debug, info, warn};

use crate::config::EventHubsConf;
use crate::core::{
    ErrorKind, EventData, EventHubsError, PartitionRuntimeInformation,
};
use crate::pool::PooledClient;
use crate::reader::PartitionReader;
use crate::registry;
use crate::registry::MetricPlugin;
use crate::reporter::{PartitionPerformanceMetric, PerfReporter, TaskContext};

/// The batch most recently served, kept so a re-executed range is answered
/// without I/O.
#[derive(Debug)]
struct CachedBatch {
    start: SequenceNumber,
    batch_size: i64,
    events: Arc<[EventData]>,
}

/// Serves `[request, request + batch_size)` from one partition, healing the
/// underlying reader on drift, expiration, and disconnection.
///
/// An engine exclusively owns its reader and is driven by one task at a time
/// (the framework schedules at most one task per partition); `receive` takes
/// `&mut self` accordingly.
#[derive(Debug)]
pub struct CursorEngine {
    conf: EventHubsConf,
    n_and_p: NameAndPartition,
    client: PooledClient,
    reader: PartitionReader,
    cached: Option<CachedBatch>,
    metric_plugin: Option<Arc<dyn MetricPlugin>>,
    reporter: Option<PerfReporter>,
}

impl CursorEngine {
    pub(crate) fn new(
        conf: &EventHubsConf,
        n_and_p: NameAndPartition,
        client: PooledClient,
        task: &TaskContext,
        reporter: Option<PerfReporter>,
    ) -> Self {
        let metric_plugin = match conf.metric_plugin() {
            Some(name) => {
                let plugin = registry::metric_plugin(name);
                if plugin.is_none() {
                    warn!(name, "configured metric plugin is not registered");
                }
                plugin
            }
            None => None,
        };

        let reader = PartitionReader::new(
            Arc::clone(client.client()),
            conf,
            n_and_p.clone(),
            receiver_identifier(task),
        );

        Self {
            conf: conf.clone(),
            n_and_p,
            client,
            reader,
            cached: None,
            metric_plugin,
            reporter,
        }
    }

    /// Produce the ordered events `[request, request + batch_size)`.
    ///
    /// When the requested range has been trimmed by retention the batch
    /// starts at the partition's begin sequence number instead and its
    /// length shrinks accordingly (down to empty).
    pub async fn receive(
        &mut self,
        request: SequenceNumber,
        batch_size: i64,
        task: &TaskContext,
    ) -> Result<Arc<[EventData]>, EventHubsError> {
        let started = Instant::now();

        if let Some(cached) = &self.cached {
            if cached.start == request && cached.batch_size == batch_size {
                debug!(
                    partition=%self.n_and_p,
                    start=%request,
                    batch_size,
                    "serving re-executed batch from memory",
                );
                return Ok(Arc::clone(&cached.events));
            }
        }

        self.reader.set_identifier(receiver_identifier(task));

        let first = self.check_cursor(request).await?;
        let first_seq = first.sequence_number;
        let batch_count = request.get() + batch_size - first_seq.get();
        if batch_count <= 0 {
            // the earliest available event already lies past the requested
            // range; nothing left to serve
            return Ok(Vec::new().into());
        }

        let receiver_timeout = self.conf.receiver_timeout();
        let mut events = Vec::with_capacity(batch_count as usize);
        events.push(first);
        while (events.len() as i64) < batch_count {
            match self.reader.receive_one(receiver_timeout).await {
                Ok(event) => events.push(event),
                Err(e) if e.kind() == ErrorKind::OperationTimeout => {
                    // leave a clean slate for the next call, then fail the
                    // batch rather than hand out a gapped range
                    if let Err(recreate_err) = self.reader.recreate(request).await {
                        warn!(
                            e=%recreate_err,
                            partition=%self.n_and_p,
                            "receiver recreation after timeout failed",
                        );
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        events.sort_by_key(|e| e.sequence_number);
        assert_eq!(
            events.len() as i64,
            batch_count,
            "materialized batch for {} does not match the computed count",
            self.n_and_p,
        );

        let events: Arc<[EventData]> = events.into();
        self.cached = Some(CachedBatch {
            start: request,
            batch_size,
            events: Arc::clone(&events),
        });

        self.report(request, &events, started.elapsed(), task);
        Ok(events)
    }

    /// Align the reader on `request` and return the first event of the batch.
    async fn check_cursor(
        &mut self,
        request: SequenceNumber,
    ) -> Result<EventData, EventHubsError> {
        let receiver_timeout = self.conf.receiver_timeout();

        let misaligned = matches!(
            self.reader.last_received_sequence(),
            Some(last) if last + 1 != request
        );
        if misaligned || !self.reader.is_open() || self.reader.silent_for_too_long() {
            self.reader.recreate(request).await?;
        }

        let first = self.reader.receive_one(receiver_timeout).await?;
        if first.sequence_number == request {
            return Ok(first);
        }

        // cursor is somewhere else entirely; rebuild the link at the
        // requested position and probe once more
        self.reader.recreate(request).await?;
        let moved = self.reader.receive_one(receiver_timeout).await?;
        if moved.sequence_number == request {
            return Ok(moved);
        }

        let info = self.partition_runtime_information().await?;
        if request < info.begin_sequence_number
            && moved.sequence_number == info.begin_sequence_number
        {
            info!(
                partition=%self.n_and_p,
                request=%request,
                begin=%info.begin_sequence_number,
                "requested events were trimmed by retention - continuing from the earliest available",
            );
            return Ok(moved);
        }

        Err(EventHubsError::cursor_lost(format!(
            "could not align on sequence number {request} for {}: receiver delivered {} and, \
             after seeking, {}; the partition currently retains [{}, {}]",
            self.n_and_p,
            first.sequence_number,
            moved.sequence_number,
            info.begin_sequence_number,
            info.last_enqueued_sequence_number,
        )))
    }

    async fn partition_runtime_information(
        &self,
    ) -> Result<PartitionRuntimeInformation, EventHubsError> {
        let client = self.client.client();
        let partition_id = self.n_and_p.partition_id;
        let operation_timeout = self.conf.operation_timeout();

        let mut backoff = Backoff::new(&BackoffConfig {
            budget: operation_timeout,
            ..Default::default()
        });
        let info = backoff
            .retry_on_error(
                "get partition runtime information",
                EventHubsError::is_transient,
                None,
                || {
                    let fetch = client.partition_runtime_information(partition_id);
                    async move {
                        tokio::time::timeout(operation_timeout, fetch)
                            .await
                            .map_err(|_| {
                                EventHubsError::operation_timeout(format!(
                                    "partition runtime information took longer than \
                                     {operation_timeout:?}"
                                ))
                            })?
                    }
                },
            )
            .await?;
        Ok(info)
    }

    fn report(
        &self,
        request: SequenceNumber,
        events: &Arc<[EventData]>,
        elapsed: std::time::Duration,
        task: &TaskContext,
    ) {
        if let Some(plugin) = &self.metric_plugin {
            let bytes = events.iter().map(|e| e.body.len()).sum();
            plugin.on_receive_metric(&self.n_and_p, events.len(), bytes, elapsed);
        }

        if let Some(reporter) = &self.reporter {
            reporter.report(PartitionPerformanceMetric {
                name_and_partition: self.n_and_p.clone(),
                task_context: task.clone(),
                batch_start: request,
                batch_count: events.len(),
                elapsed,
            });
        }
    }
}

fn receiver_identifier(task: &TaskContext) -> String {
    format!("worker-{}-{}", task.executor_id, task.task_attempt_id)
}
