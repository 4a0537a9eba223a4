//! A long-lived reader over one Event Hubs partition.

use std::sync::Arc;
use std::time::Duration;

use backoff::{Backoff, BackoffConfig};
use data_types::{NameAndPartition, SequenceNumber};
use observability_deps::tracing::{info, warn};
use tokio::time::Instant;

use crate::config::EventHubsConf;
use crate::core::{
    ErrorKind, EventData, EventHubClient, EventHubsError, EventPosition, PartitionReceiver,
    ReceiverOptions,
};

/// Epoch value used for exclusive receivers. All workers share it; opening a
/// new link at the same epoch evicts the previous one server-side.
const DEFAULT_EPOCH: i64 = 1;

/// Owns one live AMQP receiver and its cursor bookkeeping.
///
/// The next event delivered has sequence number `last_received_sequence() + 1`
/// unless [`recreate`](Self::recreate) intervened or the service trimmed
/// events below the requested position.
#[derive(Debug)]
pub(crate) struct PartitionReader {
    client: Arc<dyn EventHubClient>,
    n_and_p: NameAndPartition,
    consumer_group: String,
    prefetch_count: u32,
    exclusive: bool,
    max_silent_time: Duration,
    operation_timeout: Duration,
    identifier: String,
    receiver: Option<Box<dyn PartitionReceiver>>,
    last_received: Option<SequenceNumber>,
    last_activity: Instant,
}

impl PartitionReader {
    /// A reader starts closed; the first [`recreate`](Self::recreate) opens it.
    pub(crate) fn new(
        client: Arc<dyn EventHubClient>,
        conf: &EventHubsConf,
        n_and_p: NameAndPartition,
        identifier: String,
    ) -> Self {
        Self {
            client,
            n_and_p,
            consumer_group: conf.consumer_group().to_string(),
            prefetch_count: conf.prefetch_count(),
            exclusive: conf.use_exclusive_receiver(),
            max_silent_time: conf.max_silent_time(),
            operation_timeout: conf.operation_timeout(),
            identifier,
            receiver: None,
            last_received: None,
            last_activity: Instant::now(),
        }
    }

    /// Sequence number of the last event handed out, if any.
    pub(crate) fn last_received_sequence(&self) -> Option<SequenceNumber> {
        self.last_received
    }

    /// Transport liveness.
    pub(crate) fn is_open(&self) -> bool {
        self.receiver.is_some()
    }

    /// Whether the reader has been idle past its configured threshold.
    pub(crate) fn silent_for_too_long(&self) -> bool {
        self.last_activity.elapsed() > self.max_silent_time
    }

    /// Rename the link for the task currently driving this reader.
    pub(crate) fn set_identifier(&mut self, identifier: String) {
        self.identifier = identifier;
    }

    /// Open an AMQP link at `start`, replacing any previous receiver.
    ///
    /// In exclusive mode the old link is abandoned without `close()`: the
    /// epoch receiver about to open evicts it server-side.
    pub(crate) async fn recreate(&mut self, start: SequenceNumber) -> Result<(), EventHubsError> {
        info!(
            partition=%self.n_and_p,
            start=%start,
            "recreating partition receiver",
        );
        if self.exclusive {
            self.receiver = None;
        } else {
            self.close().await;
        }
        self.open(start).await
    }

    async fn open(&mut self, start: SequenceNumber) -> Result<(), EventHubsError> {
        let position = EventPosition::FromSequenceNumber(start);
        let options = ReceiverOptions {
            identifier: self.identifier.clone(),
            prefetch_count: self.prefetch_count,
            epoch: self.exclusive.then_some(DEFAULT_EPOCH),
            enable_runtime_metrics: true,
        };

        let client = Arc::clone(&self.client);
        let consumer_group = self.consumer_group.clone();
        let partition_id = self.n_and_p.partition_id;
        let operation_timeout = self.operation_timeout;

        let mut backoff = Backoff::new(&self.retry_config());
        let receiver = backoff
            .retry_on_error("create receiver", EventHubsError::is_transient, None, || {
                let create =
                    client.create_receiver(&consumer_group, partition_id, position, options.clone());
                async move {
                    tokio::time::timeout(operation_timeout, create)
                        .await
                        .map_err(|_| {
                            EventHubsError::operation_timeout(format!(
                                "creating receiver took longer than {operation_timeout:?}"
                            ))
                        })?
                }
            })
            .await?;

        self.receiver = Some(receiver);
        self.last_received = None;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Wait for the next event, retrying empty deliveries and transient
    /// failures within the operation-timeout budget.
    ///
    /// `timeout` is the per-attempt wait handed to the SDK.
    pub(crate) async fn receive_one(
        &mut self,
        timeout: Duration,
    ) -> Result<EventData, EventHubsError> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| EventHubsError::unknown("partition receiver is not open"))?;

        let mut backoff = Backoff::new(&self.retry_config());
        let res = backoff
            .retry_while_none("receive event", EventHubsError::is_transient, || {
                receiver.receive_one(timeout)
            })
            .await;

        match res {
            Ok(event) => {
                self.last_received = Some(event.sequence_number);
                self.last_activity = Instant::now();
                Ok(event)
            }
            Err(e) => {
                let e = EventHubsError::from(e);
                if e.kind() == ErrorKind::ReceiverDisconnected {
                    // the service evicted this link; force a rebuild next call
                    self.receiver = None;
                }
                Err(e)
            }
        }
    }

    /// Best-effort link teardown; errors are logged and swallowed.
    pub(crate) async fn close(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            let mut backoff = Backoff::new(&self.retry_config());
            let res = backoff
                .retry_on_error(
                    "close receiver",
                    EventHubsError::is_transient,
                    Some(()),
                    || receiver.close(),
                )
                .await;
            if let Err(e) = res {
                warn!(e=%e, partition=%self.n_and_p, "failed to close partition receiver");
            }
            self.last_received = None;
        }
    }

    fn retry_config(&self) -> BackoffConfig {
        BackoffConfig {
            budget: self.operation_timeout,
            ..Default::default()
        }
    }
}
