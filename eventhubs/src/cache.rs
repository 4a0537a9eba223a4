//! Process-local cache of cursor engines, one per receiver identity.
//!
//! The framework guarantees partition-to-worker stickiness across
//! micro-batches, so entries are never evicted: a hot entry saves the AMQP
//! reconnect and lets the service prefetch ahead of the batch boundary.

use std::sync::Arc;

use data_types::{NameAndPartition, SequenceNumber};
use hashbrown::HashMap;
use observability_deps::tracing::{error, warn};
use parking_lot::Mutex;

use crate::config::EventHubsConf;
use crate::core::{ErrorKind, EventData, EventHubsError};
use crate::engine::CursorEngine;
use crate::pool::ClientConnectionPool;
use crate::reporter::{DriverGateway, PerfReporter, TaskContext};

/// One engine per receiver key, for the lifetime of the worker process.
///
/// The worker runtime owns a single instance and passes it to tasks by
/// reference. The map mutex covers map operations only; every engine sits
/// behind its own lock which is uncontended because the framework runs at
/// most one task per partition at a time.
#[derive(Debug)]
pub struct ReceiverCache {
    pool: Arc<ClientConnectionPool>,
    gateway: Option<Arc<dyn DriverGateway>>,
    engines: Mutex<HashMap<String, Arc<tokio::sync::Mutex<CursorEngine>>>>,
}

impl ReceiverCache {
    pub fn new(pool: Arc<ClientConnectionPool>, gateway: Option<Arc<dyn DriverGateway>>) -> Self {
        Self {
            pool,
            gateway,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Produce the ordered events `[request, request + batch_size)` for the
    /// given partition, reusing the cached engine for its key.
    ///
    /// Two failures are handled here rather than surfaced:
    ///
    /// - a closed reactor dispatcher tears the whole engine down (pooled
    ///   client included) and the call is retried once on a fresh one;
    /// - a disconnected receiver (another epoch receiver stole the link) is
    ///   rethrown for the driver to reschedule, but the entry is kept - the
    ///   retried task heals it by recreating the receiver.
    pub async fn receive(
        &self,
        conf: &EventHubsConf,
        n_and_p: &NameAndPartition,
        request: SequenceNumber,
        batch_size: i64,
        task: &TaskContext,
    ) -> Result<Arc<[EventData]>, EventHubsError> {
        let key = receiver_key(conf, n_and_p);
        let engine = self.get_or_create(&key, conf, n_and_p, task)?;

        let res = engine.lock().await.receive(request, batch_size, task).await;
        match res {
            Ok(events) => Ok(events),
            Err(e) if e.is_reactor_closed() => {
                warn!(
                    partition=%n_and_p,
                    e=%e,
                    "reactor dispatcher is closed - rebuilding the receiver from scratch",
                );
                self.pool.force_close(conf);
                let fresh = self.rebuild(&key, conf, n_and_p, task)?;
                let res = fresh.lock().await.receive(request, batch_size, task).await;
                res
            }
            Err(e) if e.kind() == ErrorKind::ReceiverDisconnected => {
                error!(
                    partition=%n_and_p,
                    e=%e,
                    "partition receiver was disconnected by another epoch receiver",
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn get_or_create(
        &self,
        key: &str,
        conf: &EventHubsConf,
        n_and_p: &NameAndPartition,
        task: &TaskContext,
    ) -> Result<Arc<tokio::sync::Mutex<CursorEngine>>, EventHubsError> {
        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(key) {
            return Ok(Arc::clone(engine));
        }
        let engine = Arc::new(tokio::sync::Mutex::new(self.make_engine(conf, n_and_p, task)?));
        engines.insert(key.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    /// Replace the entry for `key` with a freshly constructed engine.
    fn rebuild(
        &self,
        key: &str,
        conf: &EventHubsConf,
        n_and_p: &NameAndPartition,
        task: &TaskContext,
    ) -> Result<Arc<tokio::sync::Mutex<CursorEngine>>, EventHubsError> {
        let engine = Arc::new(tokio::sync::Mutex::new(self.make_engine(conf, n_and_p, task)?));
        self.engines
            .lock()
            .insert(key.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    fn make_engine(
        &self,
        conf: &EventHubsConf,
        n_and_p: &NameAndPartition,
        task: &TaskContext,
    ) -> Result<CursorEngine, EventHubsError> {
        conf.validate().map_err(EventHubsError::invalid_input)?;
        let client = self.pool.borrow(conf)?;
        let reporter = (conf.slow_partition_adjustment())
            .then(|| self.gateway.as_ref().map(|g| PerfReporter::new(Arc::clone(g))))
            .flatten();
        Ok(CursorEngine::new(
            conf,
            n_and_p.clone(),
            client,
            task,
            reporter,
        ))
    }
}

/// One live reader per worker per key: lowercased connection string plus
/// consumer group plus partition id.
fn receiver_key(conf: &EventHubsConf, n_and_p: &NameAndPartition) -> String {
    format!(
        "{}{}{}",
        conf.connection_string(),
        conf.consumer_group(),
        n_and_p.partition_id,
    )
    .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::REACTOR_CLOSED_MESSAGE;
    use crate::reporter::test_utils::{drain_reporter_tasks, RecordingGateway};
    use crate::simulated::{random_hub_name, SimulatedEventHubs};
    use data_types::PartitionId;

    const PARTITION: i32 = 0;

    struct Fixture {
        hubs: SimulatedEventHubs,
        cache: ReceiverCache,
        conf: EventHubsConf,
        n_and_p: NameAndPartition,
        task: TaskContext,
    }

    impl Fixture {
        fn new(events: usize) -> Self {
            Self::with_gateway(events, None)
        }

        fn with_gateway(events: usize, gateway: Option<Arc<dyn DriverGateway>>) -> Self {
            let name = random_hub_name();
            let hubs = SimulatedEventHubs::new(&name);
            for i in 0..events {
                hubs.append(PartitionId::new(PARTITION), format!("event-{i}"));
            }

            let mut conf = EventHubsConf::new(format!(
                "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=k;\
                 SharedAccessKey=v;EntityPath={name}"
            ));
            conf.set_use_simulated_client(true);

            let pool = Arc::new(ClientConnectionPool::new(hubs.client_factory()));
            Self {
                cache: ReceiverCache::new(pool, gateway),
                n_and_p: NameAndPartition::new(&name, PartitionId::new(PARTITION)),
                task: TaskContext::new("exec-1", 1),
                hubs,
                conf,
            }
        }

        async fn receive(&self, start: i64, size: i64) -> Result<Arc<[EventData]>, EventHubsError> {
            self.cache
                .receive(
                    &self.conf,
                    &self.n_and_p,
                    SequenceNumber::new(start),
                    size,
                    &self.task,
                )
                .await
        }

        fn engine_ptr(&self) -> usize {
            let key = receiver_key(&self.conf, &self.n_and_p);
            let engines = self.cache.engines.lock();
            Arc::as_ptr(engines.get(&key).unwrap()) as usize
        }
    }

    fn assert_contiguous(events: &[EventData], start: i64, len: usize) {
        assert_eq!(events.len(), len);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_number, SequenceNumber::new(start + i as i64));
        }
    }

    #[tokio::test]
    async fn happy_path_batches_are_contiguous() {
        let fx = Fixture::new(100);

        let batch = fx.receive(0, 10).await.unwrap();
        assert_contiguous(&batch, 0, 10);
        let creates = fx.hubs.counters().creates;

        // the cursor is adjacent; no reconnect happens
        let batch = fx.receive(10, 5).await.unwrap();
        assert_contiguous(&batch, 10, 5);
        assert_eq!(fx.hubs.counters().creates, creates);
    }

    #[tokio::test]
    async fn re_executed_batches_are_served_without_io() {
        let fx = Fixture::new(100);

        let first = fx.receive(0, 10).await.unwrap();
        let counters = fx.hubs.counters();

        let again = fx.receive(0, 10).await.unwrap();
        assert_eq!(first, again);
        assert!(Arc::ptr_eq(&first, &again));
        // no SDK traffic at all for the memo hit
        assert_eq!(fx.hubs.counters(), counters);
    }

    #[tokio::test]
    async fn drifted_cursor_heals_with_a_single_reconnect() {
        let fx = Fixture::new(100);

        fx.receive(0, 10).await.unwrap();
        let creates = fx.hubs.counters().creates;

        let batch = fx.receive(20, 3).await.unwrap();
        assert_contiguous(&batch, 20, 3);
        assert_eq!(fx.hubs.counters().creates, creates + 1);
    }

    #[tokio::test]
    async fn trimmed_ranges_shrink_to_the_retained_window() {
        let fx = Fixture::new(100);
        fx.hubs
            .trim_to(PartitionId::new(PARTITION), SequenceNumber::new(50));

        // 30 + 20 <= 50: everything requested is gone
        let batch = fx.receive(30, 20).await.unwrap();
        assert!(batch.is_empty());

        // 30 + 40 > 50: the surviving tail is served
        let batch = fx.receive(30, 40).await.unwrap();
        assert_contiguous(&batch, 50, 20);
    }

    #[tokio::test]
    async fn unreachable_cursors_surface_as_cursor_lost() {
        let fx = Fixture::new(100);
        // a hole right at the requested position: the receiver can only
        // deliver the event after it, and the request is not below begin
        fx.hubs
            .remove(PartitionId::new(PARTITION), SequenceNumber::new(10));

        let err = fx.receive(10, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CursorLost);
        let msg = err.to_string();
        assert!(msg.contains("10"), "positions missing from: {msg}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_readers_are_recreated() {
        let fx = {
            let mut fx = Fixture::new(100);
            fx.conf
                .set_max_silent_time(std::time::Duration::from_secs(30));
            fx
        };

        fx.receive(0, 5).await.unwrap();
        let creates = fx.hubs.counters().creates;

        tokio::time::advance(std::time::Duration::from_secs(31)).await;

        // the cursor is adjacent, but the link sat idle past the threshold
        let batch = fx.receive(5, 5).await.unwrap();
        assert_contiguous(&batch, 5, 5);
        assert_eq!(fx.hubs.counters().creates, creates + 1);
    }

    #[tokio::test]
    async fn reactor_closed_rebuilds_the_engine_and_retries() {
        let fx = Fixture::new(100);

        // prime the cache so an engine identity exists to compare against
        fx.receive(0, 5).await.unwrap();
        let stale_ptr = fx.engine_ptr();

        fx.hubs.inject_receive_fault(EventHubsError::unknown(format!(
            "dispatch rejected: {REACTOR_CLOSED_MESSAGE}"
        )));

        let batch = fx.receive(5, 5).await.unwrap();
        assert_contiguous(&batch, 5, 5);
        assert_ne!(fx.engine_ptr(), stale_ptr);
    }

    #[tokio::test]
    async fn stolen_receivers_propagate_and_the_entry_survives() {
        let fx = Fixture::new(100);

        fx.receive(0, 5).await.unwrap();
        let engine_ptr = fx.engine_ptr();
        let creates = fx.hubs.counters().creates;

        fx.hubs.inject_receive_fault(EventHubsError::receiver_disconnected(
            "new receiver with higher epoch of '1' is created",
        ));

        let err = fx.receive(5, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReceiverDisconnected);
        assert_eq!(fx.engine_ptr(), engine_ptr);

        // the rescheduled task reuses the entry and heals the dead link
        let batch = fx.receive(5, 5).await.unwrap();
        assert_contiguous(&batch, 5, 5);
        assert_eq!(fx.hubs.counters().creates, creates + 1);
    }

    #[tokio::test]
    async fn exclusive_mode_never_closes_the_old_receiver() {
        let fx = {
            let mut fx = Fixture::new(100);
            fx.conf.set_use_exclusive_receiver(true);
            fx
        };

        fx.receive(0, 5).await.unwrap();
        // drift forces a rebuild of the link
        fx.receive(50, 5).await.unwrap();
        assert_eq!(fx.hubs.counters().closes, 0);
    }

    #[tokio::test]
    async fn non_exclusive_rebuilds_close_the_old_receiver() {
        let fx = Fixture::new(100);

        fx.receive(0, 5).await.unwrap();
        fx.receive(50, 5).await.unwrap();
        assert_eq!(fx.hubs.counters().closes, 1);
    }

    #[tokio::test]
    async fn slow_partition_adjustment_reports_each_batch_once() {
        let gateway = Arc::new(RecordingGateway::default());
        let fx = {
            let mut fx =
                Fixture::with_gateway(100, Some(Arc::clone(&gateway) as Arc<dyn DriverGateway>));
            fx.conf.set_slow_partition_adjustment(true);
            fx
        };

        fx.receive(0, 10).await.unwrap();
        fx.receive(10, 5).await.unwrap();
        drain_reporter_tasks().await;

        let sent = gateway.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].batch_start, SequenceNumber::new(0));
        assert_eq!(sent[0].batch_count, 10);
        assert_eq!(sent[0].task_context, fx.task);
        assert_eq!(sent[1].batch_start, SequenceNumber::new(10));
        assert_eq!(sent[1].batch_count, 5);
    }

    #[tokio::test]
    async fn reporting_failures_do_not_fail_the_batch() {
        let gateway = Arc::new(RecordingGateway::failing());
        let fx = {
            let mut fx =
                Fixture::with_gateway(100, Some(Arc::clone(&gateway) as Arc<dyn DriverGateway>));
            fx.conf.set_slow_partition_adjustment(true);
            fx
        };

        let batch = fx.receive(0, 10).await.unwrap();
        assert_contiguous(&batch, 0, 10);
        drain_reporter_tasks().await;
        assert!(gateway.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn memo_hits_are_not_reported_twice() {
        let gateway = Arc::new(RecordingGateway::default());
        let fx = {
            let mut fx =
                Fixture::with_gateway(100, Some(Arc::clone(&gateway) as Arc<dyn DriverGateway>));
            fx.conf.set_slow_partition_adjustment(true);
            fx
        };

        fx.receive(0, 10).await.unwrap();
        fx.receive(0, 10).await.unwrap();
        drain_reporter_tasks().await;
        assert_eq!(gateway.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_before_any_io() {
        let fx = {
            let mut fx = Fixture::new(10);
            fx.conf.set_prefetch_count(5);
            fx
        };

        let err = fx.receive(0, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(fx.hubs.counters().creates, 0);
    }
}
