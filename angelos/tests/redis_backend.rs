//! Redis backend tests.
//!
//! These need a running Redis on localhost and clear every `angelos:*` key
//! in database 0, so they are ignored by default:
//!
//! ```bash
//! docker run -d -p 6379:6379 redis:7
//! cargo test -p angelos --features redis --test redis_backend -- --ignored --test-threads=1
//! ```

#![cfg(feature = "redis")]

use angelos::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const REDIS_URL: &str = "redis://127.0.0.1:6379/0";

async fn broker() -> Arc<RedisBroker> {
    let broker = RedisBroker::new(REDIS_URL).await.unwrap();
    broker.reset().await.unwrap();
    Arc::new(broker)
}

#[tokio::test]
#[ignore]
async fn test_enqueue_dequeue_ack() {
    let broker = broker().await;
    let invocation = TaskInvocation::new(TaskId::new(), "echo", json!({"x": 1}));

    broker.enqueue(&invocation).await.unwrap();
    let delivery = broker
        .dequeue("c1", Duration::from_millis(200))
        .await
        .unwrap()
        .expect("message should be delivered");

    assert_eq!(delivery.invocation.task_id, invocation.task_id);
    assert_eq!(delivery.invocation.args, json!({"x": 1}));
    assert_eq!(delivery.delivery_count, 1);
    assert_eq!(delivery.consumer, "c1");

    broker.ack(&delivery).await.unwrap();
    assert!(matches!(
        broker.ack(&delivery).await,
        Err(StorageError::UnknownDelivery(_))
    ));

    // Nothing left for anyone.
    let empty = broker
        .dequeue("c2", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(empty.is_none());
}

#[tokio::test]
#[ignore]
async fn test_stale_delivery_is_redelivered() {
    let broker = broker().await;
    let invocation = TaskInvocation::new(TaskId::new(), "echo", json!(null));
    broker.enqueue(&invocation).await.unwrap();

    let lost = broker
        .dequeue("crashed", Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let recovered = broker.recover_stale(Duration::from_millis(10)).await.unwrap();
    assert_eq!(recovered, 1);

    let again = broker
        .dequeue("rescuer", Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.invocation.task_id, lost.invocation.task_id);
    assert_eq!(again.delivery_count, 2);
    assert!(again.is_redelivery());

    // The old receipt was released during recovery.
    assert!(broker.ack(&lost).await.is_err());
    broker.ack(&again).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_status_transitions_are_monotonic() {
    let broker = broker().await;
    let task_id = TaskId::new();

    assert!(broker
        .create_status(&TaskStatusRecord::pending(task_id.clone()))
        .await
        .unwrap());
    assert!(!broker
        .create_status(&TaskStatusRecord::pending(task_id.clone()))
        .await
        .unwrap());

    assert!(broker
        .put_status(&TaskStatusRecord::started(task_id.clone(), "w1"))
        .await
        .unwrap());
    assert!(broker
        .put_status(&TaskStatusRecord::success(task_id.clone(), json!(42)))
        .await
        .unwrap());

    // Terminal records do not move.
    assert!(!broker
        .put_status(&TaskStatusRecord::failure(task_id.clone(), "late"))
        .await
        .unwrap());
    assert!(!broker
        .put_status(&TaskStatusRecord::started(task_id.clone(), "w2"))
        .await
        .unwrap());

    let record = broker.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Success);
    assert_eq!(record.result, Some(json!(42)));

    assert!(broker
        .get_status(&TaskId::from("missing"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore]
async fn test_status_expires_after_ttl() {
    let broker = RedisBroker::new(REDIS_URL)
        .await
        .unwrap()
        .with_result_ttl(Duration::from_millis(100));
    let task_id = TaskId::new();

    broker
        .create_status(&TaskStatusRecord::pending(task_id.clone()))
        .await
        .unwrap();
    assert!(broker.get_status(&task_id).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(broker.get_status(&task_id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_worker_round_trip() {
    let broker = broker().await;

    let mut registry = Registry::new();
    registry
        .register("echo", |args: Value| async move { Ok::<_, String>(args) })
        .unwrap();
    let worker = Worker::from_broker(broker.clone(), Arc::new(registry), "redis-worker")
        .with_poll_timeout(Duration::from_millis(100))
        .start();

    let dispatcher = Dispatcher::from_broker(broker.clone());
    assert!(dispatcher.health().await.is_healthy());

    let task_id = dispatcher.submit("echo", json!({"hello": "redis"})).await.unwrap();
    let record = dispatcher
        .wait(&task_id, Duration::from_millis(20), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(record.state, TaskState::Success);
    assert_eq!(record.result, Some(json!({"hello": "redis"})));
    assert_eq!(record.worker.as_deref(), Some("redis-worker"));

    worker.shutdown().await;
}
