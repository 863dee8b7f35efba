//! Publish → consume → process → store, entirely in-process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use devicio_rs::error::{Error, Result};
use devicio_rs::model::{DeviceRoutine, DeviceStatus, ReportedStatus, RoutineEvent};
use devicio_rs::processor::unstable::{
    LatencyTier, TierSelection, UnstableApi, UnstableApiConfig,
};
use devicio_rs::processor::{ProcessingService, RoutineRepository};
use devicio_rs::queue::memory::{InMemoryBroker, Settlement};
use devicio_rs::queue::{QueueClient, RequeuePolicy};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingRepository {
    stored: Mutex<Vec<RoutineEvent>>,
}

impl RecordingRepository {
    fn stored(&self) -> Vec<RoutineEvent> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoutineRepository for RecordingRepository {
    async fn store(&self, routine: RoutineEvent) -> Result<()> {
        self.stored.lock().unwrap().push(routine);
        Ok(())
    }
}

fn routine(device: &str, area: &str, status: DeviceStatus) -> DeviceRoutine {
    DeviceRoutine::new(
        device,
        status,
        "routine",
        "Flow rate stable",
        area,
        Utc::now(),
    )
}

async fn pipeline(
    api: UnstableApiConfig,
    policy: RequeuePolicy,
) -> (InMemoryBroker, QueueClient, Arc<RecordingRepository>) {
    let broker = InMemoryBroker::new();
    let client = QueueClient::open(Arc::new(broker.clone()), "routines", policy)
        .await
        .unwrap();
    let repository = Arc::new(RecordingRepository::default());
    let service = ProcessingService::new(Arc::new(UnstableApi::new(api)), repository.clone());
    client
        .subscribe(CancellationToken::new(), Arc::new(service))
        .await
        .unwrap();
    (broker, client, repository)
}

async fn settlements(broker: &InMemoryBroker, count: usize) -> Vec<Settlement> {
    tokio::time::timeout(Duration::from_secs(5), broker.wait_for_settlements(count))
        .await
        .expect("timed out waiting for settlements")
}

#[tokio::test]
async fn published_routine_is_stored_once_and_acked() {
    let (broker, client, repository) =
        pipeline(UnstableApiConfig::always_succeeds(), RequeuePolicy::Always).await;

    client
        .publish(&routine("device-1", "A", DeviceStatus::Healthy))
        .await
        .unwrap();

    let settled = settlements(&broker, 1).await;
    assert!(settled[0].is_ack());

    let stored = repository.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].device_id, "device-1");
    assert_eq!(stored[0].area, "A");
    assert_eq!(stored[0].status, DeviceStatus::Healthy);
    assert_eq!(stored[0].context, "routine");
    assert!(stored[0].created_at >= stored[0].dispatched_at);

    client.close().await;
}

#[tokio::test]
async fn unreliable_dependency_requeues_without_storing() {
    let api = UnstableApiConfig {
        latencies: [Duration::ZERO; 4],
        tier_selection: TierSelection::Forced(LatencyTier::Unreliable),
        ..UnstableApiConfig::default()
    };
    let (broker, client, repository) = pipeline(api, RequeuePolicy::Always).await;

    client
        .publish(&routine("device-2", "B", DeviceStatus::Warning))
        .await
        .unwrap();

    let settled = settlements(&broker, 3).await;
    assert!(
        settled
            .iter()
            .all(|s| matches!(s, Settlement::Nacked { requeue: true, .. }))
    );
    assert!(repository.stored().is_empty());

    client.close().await;
}

#[tokio::test]
async fn malformed_payload_is_dropped_under_dead_letter_policy() {
    let (broker, client, repository) = pipeline(
        UnstableApiConfig::always_succeeds(),
        RequeuePolicy::DeadLetterPermanent,
    )
    .await;

    client.publish_bytes(b"\x08\x96\x01garbage").await.unwrap();
    client
        .publish(&routine("device-3", "C", DeviceStatus::Critical))
        .await
        .unwrap();

    let settled = settlements(&broker, 2).await;
    assert!(matches!(
        settled[0],
        Settlement::Nacked { requeue: false, .. }
    ));
    assert!(settled[1].is_ack());
    assert_eq!(repository.stored().len(), 1);

    client.close().await;
}

#[tokio::test]
async fn newer_producer_fields_are_stored_not_rejected() {
    let (broker, client, repository) =
        pipeline(UnstableApiConfig::always_succeeds(), RequeuePolicy::Always).await;

    let mut message = routine("device-6", "C", DeviceStatus::Healthy);
    message.status = 9;
    message.dispatched_at = None;
    client.publish(&message).await.unwrap();

    let settled = settlements(&broker, 1).await;
    assert!(settled[0].is_ack());

    let stored = repository.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ReportedStatus::Unrecognized(9));
    assert_eq!(stored[0].dispatched_at, chrono::DateTime::<Utc>::UNIX_EPOCH);

    client.close().await;
}

#[tokio::test]
async fn duplicate_payloads_become_distinct_records() {
    let (broker, client, repository) =
        pipeline(UnstableApiConfig::always_succeeds(), RequeuePolicy::Always).await;

    let message = routine("device-4", "A", DeviceStatus::Error);
    client.publish(&message).await.unwrap();
    client.publish(&message).await.unwrap();

    settlements(&broker, 2).await;
    let stored = repository.stored();
    assert_eq!(stored.len(), 2);
    assert_ne!(stored[0].id, stored[1].id);
    assert_eq!(stored[0].device_id, stored[1].device_id);

    client.close().await;
}

#[tokio::test]
async fn cancelled_processing_is_requeued() {
    let api = UnstableApiConfig {
        latencies: [Duration::from_secs(60); 4],
        tier_selection: TierSelection::Forced(LatencyTier::Low),
        failure_rate: 0.0,
        seed: None,
    };
    let broker = InMemoryBroker::new();
    let client = QueueClient::open(
        Arc::new(broker.clone()),
        "routines",
        RequeuePolicy::DeadLetterPermanent,
    )
    .await
    .unwrap();
    let repository = Arc::new(RecordingRepository::default());
    let service = ProcessingService::new(Arc::new(UnstableApi::new(api)), repository.clone());

    let cancel = CancellationToken::new();
    client
        .subscribe(cancel.clone(), Arc::new(service))
        .await
        .unwrap();
    client
        .publish(&routine("device-5", "B", DeviceStatus::Healthy))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let settled = settlements(&broker, 1).await;
    assert!(matches!(
        settled[0],
        Settlement::Nacked { requeue: true, .. }
    ));
    assert!(repository.stored().is_empty());
    assert!(Error::Cancelled.is_transient());

    client.close().await;
}
