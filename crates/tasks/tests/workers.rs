//! Background workers driving the lifecycle on their own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use taskrelay_core::{JobId, LifecycleStream, TaskId, TaskRecord};
use taskrelay_events::InMemoryConfirmationSource;
use taskrelay_infra::{ClientConfig, InMemoryBackend, RecoveryConfig, ResilientStoreClient, StoreBackend};
use taskrelay_observability::NoopMetrics;
use taskrelay_tasks::{
    DeliveryError, DispatchOutcome, LifecycleConfig, LifecycleError, RecordingDelivery,
    TaskLifecycleManager,
};

fn fast_config() -> LifecycleConfig {
    let mut config = LifecycleConfig::default()
        .with_retry_delays(Duration::ZERO, Duration::ZERO)
        .with_worker_intervals(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
    config.confirmation_poll_interval = Duration::from_millis(50);
    config
}

async fn started(
    backend: &Arc<InMemoryBackend>,
    confirmations: Option<Arc<InMemoryConfirmationSource>>,
) -> TaskLifecycleManager {
    taskrelay_observability::init();
    let client = ResilientStoreClient::connect(
        backend.clone(),
        ClientConfig::default().with_recovery(RecoveryConfig::disabled()),
    )
    .await
    .unwrap();
    let manager = TaskLifecycleManager::new(client, fast_config(), Arc::new(NoopMetrics)).unwrap();
    manager.initialize().await.unwrap();
    let source = confirmations.map(|s| s as Arc<dyn taskrelay_events::ConfirmationSource>);
    assert!(manager.spawn_workers(source).unwrap());
    manager
}

fn task(id: i64) -> TaskRecord {
    TaskRecord::new(TaskId::new(id), JobId::new(3), "0xperformer", 2, json!({ "id": id }))
}

/// Poll `check` every 25ms until it holds or `limit` elapses.
async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn timeout_worker_fails_expired_task() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = started(&backend, None).await;
    manager
        .enqueue(task(7).with_timeout(Duration::from_secs(1)))
        .await
        .unwrap();

    let moved = eventually(Duration::from_secs(5), || {
        let manager = manager.clone();
        async move { manager.find_by_id(TaskId::new(7)).await.unwrap().is_none() }
    })
    .await;
    assert!(moved, "timeout worker never moved task 7");

    let failed = backend.xrevrange(LifecycleStream::Failed.key(), 1).await.unwrap();
    let record = TaskRecord::from_json(failed[0].field("task").unwrap()).unwrap();
    assert_eq!(record.task_id, TaskId::new(7));
    assert_eq!(record.last_error.as_deref(), Some("dispatched timeout"));

    manager.close(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn failed_delivery_is_redispatched_by_worker() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = started(&backend, None).await;
    let sink = Arc::new(RecordingDelivery::new());
    sink.fail_next(DeliveryError::Rejected("busy".into()));
    manager.set_delivery_sink(sink);

    let outcome = manager.dispatch(task(12)).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::DeliveryFailed { .. }));

    let redispatched = eventually(Duration::from_secs(3), || {
        let manager = manager.clone();
        async move {
            matches!(
                manager.find_by_id(TaskId::new(12)).await.unwrap(),
                Some(located) if located.stream == LifecycleStream::Dispatched
                    && located.task.retry_count == 1
            )
        }
    })
    .await;
    assert!(redispatched, "retry worker never re-dispatched task 12");

    manager.close(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn confirmation_worker_completes_tasks() {
    let backend = Arc::new(InMemoryBackend::new());
    let source = Arc::new(InMemoryConfirmationSource::new());
    let manager = started(&backend, Some(source.clone())).await;

    manager.enqueue(task(21)).await.unwrap();
    manager.enqueue(task(22)).await.unwrap();
    source.push_completed(TaskId::new(21));
    source.push_rejected(TaskId::new(22), "bad result");

    let drained = eventually(Duration::from_secs(3), || {
        let backend = backend.clone();
        async move { backend.xlen(LifecycleStream::Dispatched.key()).await.unwrap() == 1 }
    })
    .await;
    assert!(drained, "confirmations were not applied");
    assert_eq!(backend.xlen(LifecycleStream::Completed.key()).await.unwrap(), 2);
    assert_eq!(backend.xlen(LifecycleStream::Failed.key()).await.unwrap(), 2);

    manager.close(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn close_stops_workers_and_is_idempotent() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = started(&backend, None).await;
    assert!(manager.workers_running());
    assert!(!manager.spawn_workers(None).unwrap());

    tokio::time::timeout(Duration::from_secs(3), manager.close(Duration::from_secs(2)))
        .await
        .expect("close must finish within its timeout");
    assert!(!manager.workers_running());
    assert!(manager.client().is_closed());

    manager.close(Duration::from_secs(2)).await;
    assert_eq!(manager.spawn_workers(None), Err(LifecycleError::Closed));
}
