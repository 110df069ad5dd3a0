mod common;

use std::time::Duration;

use futures::future::join_all;
use reliable_rabbitmq::rabbitmq::{
    ConfirmBehavior, ExchangeKind, MemoryBroker, Producer, ProducerConfig, RabbitMQError,
};
use tokio::time::sleep;

use common::{connected, start};

#[tokio::test]
async fn test_publish_succeeds_on_ack() {
    let broker = MemoryBroker::new();
    broker.declare_queue("task_queue", true);
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    producer.publish("", "task_queue", b"hello").await.unwrap();

    assert_eq!(broker.queue_depth("task_queue"), 1);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "task_queue");
    assert!(published[0].message.is_persistent());
    assert!(published[0].message.message_id.is_some());
    assert_eq!(published[0].message.content_type.as_deref(), Some("text/plain"));

    producer.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_reports_nack() {
    let broker = MemoryBroker::new();
    broker.declare_queue("task_queue", true);
    broker.set_confirm_behavior(ConfirmBehavior::Nack);
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    let result = producer.publish("", "task_queue", b"hello").await;
    assert_eq!(
        result,
        Err(RabbitMQError::Nacked {
            exchange: String::new(),
            routing_key: "task_queue".to_string(),
        })
    );
    assert_eq!(broker.queue_depth("task_queue"), 0);

    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_times_out_without_confirmation() {
    let broker = MemoryBroker::new();
    broker.set_confirm_behavior(ConfirmBehavior::Withhold);
    let manager = connected(&broker).await;
    let producer = Producer::with_config(
        &manager,
        ProducerConfig {
            confirm_timeout: Duration::from_secs(2),
            ..ProducerConfig::default()
        },
    );

    let result = producer.publish("", "task_queue", b"hello").await;
    assert_eq!(result, Err(RabbitMQError::ConfirmTimeout(Duration::from_secs(2))));

    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_rpc_does_not_wait_for_confirmation() {
    let broker = MemoryBroker::new();
    broker.declare_queue("rpc_queue", false);
    broker.set_confirm_behavior(ConfirmBehavior::Withhold);
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    producer
        .publish_rpc("", "rpc_queue", "Q1", "ABCDEFGH", b"30")
        .await
        .unwrap();
    producer
        .publish_rpc("", "rpc_queue", "", "", b"31")
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published[0].message.correlation_id.as_deref(), Some("ABCDEFGH"));
    assert_eq!(published[0].message.reply_to.as_deref(), Some("Q1"));
    assert!(!published[0].message.is_persistent());
    assert_eq!(published[1].message.correlation_id, None);
    assert_eq!(published[1].message.reply_to, None);
    assert_eq!(broker.queue_depth("rpc_queue"), 2);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_rpc_uses_a_channel_without_confirms() {
    let broker = MemoryBroker::new();
    broker.declare_queue("rpc_queue", false);
    broker.declare_queue("task_queue", true);
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    for i in 0..3 {
        producer
            .publish_rpc("", "rpc_queue", "Q1", &format!("id-{}", i), b"30")
            .await
            .unwrap();
    }
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.confirm_channels(), 0);

    producer.publish("", "task_queue", b"hello").await.unwrap();
    assert_eq!(broker.open_channels(), 2);
    assert_eq!(broker.confirm_channels(), 1);

    producer.close().await.unwrap();
    assert_eq!(broker.open_channels(), 0);

    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_publish_without_connection_fails_fast() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let manager = start(&broker);
    let producer = Producer::new(&manager);

    assert_eq!(
        producer.publish("", "task_queue", b"hello").await,
        Err(RabbitMQError::NotConnected)
    );
    assert_eq!(
        producer.publish_rpc("", "rpc_queue", "Q1", "ID", b"1").await,
        Err(RabbitMQError::NotConnected)
    );

    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_producer_follows_reconnects() {
    let broker = MemoryBroker::new();
    broker.declare_queue("task_queue", true);
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    producer.publish("", "task_queue", b"before").await.unwrap();
    assert_eq!(broker.open_channels(), 1);

    broker.disconnect_all();
    assert_eq!(
        producer.publish("", "task_queue", b"during").await,
        Err(RabbitMQError::NotConnected)
    );

    sleep(Duration::from_secs(6)).await;
    producer.publish("", "task_queue", b"after").await.unwrap();
    assert_eq!(broker.dial_count(), 2);
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.queue_depth("task_queue"), 2);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_publishes_share_one_channel() {
    let broker = MemoryBroker::new();
    broker.declare_queue("task_queue", true);
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    let bodies: Vec<String> = (0..10).map(|i| format!("task {}", i)).collect();
    let results = join_all(
        bodies
            .iter()
            .map(|body| producer.publish("", "task_queue", body.as_bytes())),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(broker.queue_depth("task_queue"), 10);
    assert_eq!(broker.open_channels(), 1);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    let result = producer.publish("nowhere", "info", b"hello").await;
    assert!(matches!(result, Err(RabbitMQError::PublishError(_))));

    producer
        .declare_exchange("logs", ExchangeKind::Fanout)
        .await
        .unwrap();
    assert_eq!(broker.exchange_kind("logs"), Some(ExchangeKind::Fanout));
    producer.publish("logs", "", b"hello").await.unwrap();

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let producer = Producer::new(&manager);

    producer
        .declare_exchange("logs", ExchangeKind::Fanout)
        .await
        .unwrap();
    assert_eq!(broker.open_channels(), 1);

    producer.close().await.unwrap();
    producer.close().await.unwrap();
    assert_eq!(broker.open_channels(), 0);

    manager.close().await.unwrap();
}
