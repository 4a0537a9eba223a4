//! In-memory Event Hubs service, selected by the `useSimulatedClient`
//! option.
//!
//! Backs the test suite and local development runs: a per-partition event
//! log with an advanceable retention window, scripted fault injection, and
//! counters for every SDK call so tests can assert the exact I/O a receive
//! performs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use data_types::{PartitionId, SequenceNumber};
use hashbrown::HashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::EventHubsConf;
use crate::core::{
    EventData, EventHubClient, EventHubsError, EventPosition, PartitionReceiver,
    PartitionRuntimeInformation, ReceiverOptions,
};
use crate::pool::ClientFactory;

/// Byte distance between consecutive simulated events.
const OFFSET_STRIDE: i64 = 64;

/// Generated random hub name for testing.
pub fn random_hub_name() -> String {
    format!("test_hub_{}", Uuid::new_v4())
}

#[derive(Debug, Default)]
struct PartitionState {
    /// Retained events, keyed by sequence number.
    events: BTreeMap<i64, EventData>,

    /// Lowest sequence number still retained.
    begin: i64,

    /// Sequence number the next appended event gets.
    next: i64,
}

/// Counts of SDK calls issued against the simulated service.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SdkCallCounters {
    /// `create_receiver` calls.
    pub creates: usize,

    /// `receive_one` attempts.
    pub receives: usize,

    /// Receiver `close` calls.
    pub closes: usize,

    /// `partition_runtime_information` calls.
    pub runtime_infos: usize,
}

#[derive(Debug, Default)]
struct HubState {
    partitions: HashMap<i32, PartitionState>,
    receive_faults: VecDeque<EventHubsError>,
    create_faults: VecDeque<EventHubsError>,
    counters: SdkCallCounters,
}

/// Handle on one simulated event hub. Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedEventHubs {
    name: String,
    state: Arc<Mutex<HubState>>,
}

impl SimulatedEventHubs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Default::default(),
        }
    }

    /// Name of the simulated hub (its `EntityPath`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append one event, returning its sequence number.
    pub fn append(&self, partition: PartitionId, body: impl Into<Vec<u8>>) -> SequenceNumber {
        let mut state = self.state.lock();
        let p = state.partitions.entry(partition.get()).or_default();
        let seq = p.next;
        p.next += 1;
        p.events.insert(
            seq,
            EventData {
                body: body.into(),
                sequence_number: SequenceNumber::new(seq),
                offset: seq * OFFSET_STRIDE,
                enqueued_time_millis: unix_millis(),
                properties: Default::default(),
            },
        );
        SequenceNumber::new(seq)
    }

    /// Advance the retention window: events below `begin` are dropped, the
    /// way service-side retention garbage-collects old data.
    pub fn trim_to(&self, partition: PartitionId, begin: SequenceNumber) {
        let mut state = self.state.lock();
        let p = state.partitions.entry(partition.get()).or_default();
        p.begin = begin.get();
        p.events.retain(|seq, _| *seq >= begin.get());
    }

    /// Drop a single retained event.
    pub fn remove(&self, partition: PartitionId, seq: SequenceNumber) {
        let mut state = self.state.lock();
        if let Some(p) = state.partitions.get_mut(&partition.get()) {
            p.events.remove(&seq.get());
        }
    }

    /// Fail the next `receive_one` attempt with `e`.
    pub fn inject_receive_fault(&self, e: EventHubsError) {
        self.state.lock().receive_faults.push_back(e);
    }

    /// Fail the next `create_receiver` call with `e`.
    pub fn inject_create_fault(&self, e: EventHubsError) {
        self.state.lock().create_faults.push_back(e);
    }

    /// Snapshot of the SDK call counters.
    pub fn counters(&self) -> SdkCallCounters {
        self.state.lock().counters
    }

    /// Factory for [`crate::pool::ClientConnectionPool`]. Rejects
    /// configurations that do not select the simulated client.
    pub fn client_factory(&self) -> ClientFactory {
        let hubs = self.clone();
        Arc::new(move |conf: &EventHubsConf| {
            if !conf.use_simulated_client() {
                return Err(EventHubsError::invalid_input(
                    "configuration does not select the simulated client",
                ));
            }
            Ok(Arc::new(SimulatedEventHubClient { hubs: hubs.clone() })
                as Arc<dyn EventHubClient>)
        })
    }
}

/// Connection-level handle onto a [`SimulatedEventHubs`].
#[derive(Debug)]
pub struct SimulatedEventHubClient {
    hubs: SimulatedEventHubs,
}

#[async_trait]
impl EventHubClient for SimulatedEventHubClient {
    async fn create_receiver(
        &self,
        _consumer_group: &str,
        partition_id: PartitionId,
        position: EventPosition,
        _options: ReceiverOptions,
    ) -> Result<Box<dyn PartitionReceiver>, EventHubsError> {
        let mut state = self.hubs.state.lock();
        if let Some(e) = state.create_faults.pop_front() {
            return Err(e);
        }
        state.counters.creates += 1;

        let p = state.partitions.entry(partition_id.get()).or_default();
        // a receiver below the retention window attaches at the earliest
        // retained event, exactly like the live service
        let cursor = match position {
            EventPosition::FromSequenceNumber(s) => s.get().max(p.begin),
            EventPosition::StartOfStream => p.begin,
            EventPosition::EndOfStream => p.next,
        };

        Ok(Box::new(SimulatedPartitionReceiver {
            hubs: self.hubs.clone(),
            partition_id,
            cursor: Mutex::new(cursor),
        }))
    }

    async fn partition_runtime_information(
        &self,
        partition_id: PartitionId,
    ) -> Result<PartitionRuntimeInformation, EventHubsError> {
        let mut state = self.hubs.state.lock();
        state.counters.runtime_infos += 1;
        let p = state.partitions.entry(partition_id.get()).or_default();
        Ok(PartitionRuntimeInformation {
            partition_id,
            begin_sequence_number: SequenceNumber::new(p.begin),
            last_enqueued_sequence_number: SequenceNumber::new(p.next - 1),
            last_enqueued_offset: (p.next - 1) * OFFSET_STRIDE,
        })
    }

    async fn close(&self) -> Result<(), EventHubsError> {
        Ok(())
    }
}

/// One simulated AMQP link.
#[derive(Debug)]
pub struct SimulatedPartitionReceiver {
    hubs: SimulatedEventHubs,
    partition_id: PartitionId,
    cursor: Mutex<i64>,
}

#[async_trait]
impl PartitionReceiver for SimulatedPartitionReceiver {
    async fn receive_one(
        &self,
        _timeout: Duration,
    ) -> Result<Option<EventData>, EventHubsError> {
        let mut state = self.hubs.state.lock();
        if let Some(e) = state.receive_faults.pop_front() {
            return Err(e);
        }
        state.counters.receives += 1;

        let p = match state.partitions.get(&self.partition_id.get()) {
            Some(p) => p,
            // an empty window behaves like an SDK timeout
            None => return Ok(None),
        };

        let mut cursor = self.cursor.lock();
        match p.events.range(*cursor..).next() {
            Some((_, event)) => {
                let event = event.clone();
                *cursor = event.sequence_number.get() + 1;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), EventHubsError> {
        self.hubs.state.lock().counters.closes += 1;
        Ok(())
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> PartitionId {
        PartitionId::new(0)
    }

    fn conf_for(hubs: &SimulatedEventHubs) -> EventHubsConf {
        let mut conf = EventHubsConf::new(format!(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=k;\
             SharedAccessKey=v;EntityPath={}",
            hubs.name()
        ));
        conf.set_use_simulated_client(true);
        conf
    }

    async fn receiver_at(
        hubs: &SimulatedEventHubs,
        seq: i64,
    ) -> Box<dyn PartitionReceiver> {
        let client = (hubs.client_factory())(&conf_for(hubs)).unwrap();
        client
            .create_receiver(
                "$Default",
                partition(),
                EventPosition::FromSequenceNumber(SequenceNumber::new(seq)),
                ReceiverOptions {
                    identifier: "worker-test-0".to_string(),
                    prefetch_count: 500,
                    epoch: None,
                    enable_runtime_metrics: true,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn events_are_delivered_in_sequence() {
        let hubs = SimulatedEventHubs::new(random_hub_name());
        for i in 0..3 {
            hubs.append(partition(), format!("event-{i}"));
        }

        let receiver = receiver_at(&hubs, 0).await;
        for i in 0..3 {
            let event = receiver
                .receive_one(Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.sequence_number, SequenceNumber::new(i));
            assert_eq!(event.body, format!("event-{i}").into_bytes());
        }
        // exhausted: behaves like an SDK timeout
        assert!(receiver
            .receive_one(Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn receivers_below_the_retention_window_attach_at_begin() {
        let hubs = SimulatedEventHubs::new(random_hub_name());
        for i in 0..10 {
            hubs.append(partition(), format!("event-{i}"));
        }
        hubs.trim_to(partition(), SequenceNumber::new(6));

        let receiver = receiver_at(&hubs, 2).await;
        let event = receiver
            .receive_one(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sequence_number, SequenceNumber::new(6));
    }

    #[tokio::test]
    async fn runtime_information_tracks_the_window() {
        let hubs = SimulatedEventHubs::new(random_hub_name());
        for i in 0..10 {
            hubs.append(partition(), format!("event-{i}"));
        }
        hubs.trim_to(partition(), SequenceNumber::new(4));

        let client = (hubs.client_factory())(&conf_for(&hubs)).unwrap();
        let info = client.partition_runtime_information(partition()).await.unwrap();
        assert_eq!(info.begin_sequence_number, SequenceNumber::new(4));
        assert_eq!(info.last_enqueued_sequence_number, SequenceNumber::new(9));
    }

    #[tokio::test]
    async fn injected_faults_surface_once() {
        let hubs = SimulatedEventHubs::new(random_hub_name());
        hubs.append(partition(), "event-0");
        hubs.inject_receive_fault(EventHubsError::transient("server busy"));

        let receiver = receiver_at(&hubs, 0).await;
        let err = receiver
            .receive_one(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // the queue is drained; the next attempt succeeds
        let event = receiver
            .receive_one(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.sequence_number, SequenceNumber::new(0));
    }

    #[tokio::test]
    async fn counters_observe_every_call() {
        let hubs = SimulatedEventHubs::new(random_hub_name());
        hubs.append(partition(), "event-0");

        let receiver = receiver_at(&hubs, 0).await;
        receiver.receive_one(Duration::from_secs(1)).await.unwrap();
        receiver.close().await.unwrap();

        let counters = hubs.counters();
        assert_eq!(counters.creates, 1);
        assert_eq!(counters.receives, 1);
        assert_eq!(counters.closes, 1);
    }

    #[tokio::test]
    async fn the_factory_rejects_non_simulated_configurations() {
        let hubs = SimulatedEventHubs::new(random_hub_name());
        let mut conf = conf_for(&hubs);
        conf.set_use_simulated_client(false);
        assert!((hubs.client_factory())(&conf).is_err());
    }
}
