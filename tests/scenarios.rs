mod common;

use std::time::Duration;

use reliable_rabbitmq::rabbitmq::{
    Consumer, Delivery, Emitter, ExchangeKind, MemoryBroker, Producer, RabbitMQError, RpcClient,
    RpcServer, Topology,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{connected, eventually};

fn forward_to(
    tx: mpsc::UnboundedSender<(usize, Delivery)>,
    id: usize,
) -> impl Fn(Delivery) -> futures::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
    move |delivery: Delivery| {
        let _ = tx.send((id, delivery));
        futures::future::ready(Ok(()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_fanout_reaches_every_anonymous_subscriber_once() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut listeners = Vec::new();
    for id in 0..2 {
        let consumer = Consumer::new(&manager);
        let cancel = cancel.clone();
        let handler = forward_to(tx.clone(), id);
        listeners.push(tokio::spawn(async move {
            consumer.listen(cancel, Topology::fanout("logs"), handler).await
        }));
    }
    eventually(|| broker.total_consumers() == 2).await;

    let producer = Producer::new(&manager);
    producer.publish("logs", "", b"[1] - info").await.unwrap();

    let (first_id, first) = rx.recv().await.unwrap();
    let (second_id, second) = rx.recv().await.unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(first.body, b"[1] - info");
    assert_eq!(second.body, b"[1] - info");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.ack_count(), 2);

    cancel.cancel();
    for listener in listeners {
        listener.await.unwrap().unwrap();
    }
    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_work_queue_consumers_compete() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut listeners = Vec::new();
    for id in 0..2 {
        let consumer = Consumer::new(&manager);
        let cancel = cancel.clone();
        let handler = forward_to(tx.clone(), id);
        listeners.push(tokio::spawn(async move {
            let topology = Topology::work_queue("task_queue").durable(true);
            consumer.listen(cancel, topology, handler).await
        }));
    }
    eventually(|| broker.consumer_count("task_queue") == 2).await;
    assert!(broker.is_durable("task_queue"));

    let producer = Producer::new(&manager);
    for i in 0..4 {
        producer
            .publish("", "task_queue", format!("task {}", i).as_bytes())
            .await
            .unwrap();
    }

    let mut per_consumer = [0usize; 2];
    let mut bodies = Vec::new();
    for _ in 0..4 {
        let (id, delivery) = rx.recv().await.unwrap();
        per_consumer[id] += 1;
        bodies.push(delivery.body);
    }
    assert!(per_consumer.iter().all(|count| *count >= 1));
    bodies.sort();
    bodies.dedup();
    assert_eq!(bodies.len(), 4);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.ack_count(), 4);

    cancel.cancel();
    for listener in listeners {
        listener.await.unwrap().unwrap();
    }
    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rpc_reply_carries_correlation_id() {
    let broker = MemoryBroker::new();
    broker.declare_queue("Q1", false);
    let manager = connected(&broker).await;
    let cancel = CancellationToken::new();

    let server = RpcServer::new(&manager);
    let serving = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            server
                .serve(cancel, "rpc_queue", |body: Vec<u8>| async move {
                    let mut reply = b"echo: ".to_vec();
                    reply.extend(body);
                    Ok::<_, anyhow::Error>(reply)
                })
                .await
        })
    };
    eventually(|| broker.consumer_count("rpc_queue") == 1).await;

    let producer = Producer::new(&manager);
    producer
        .publish_rpc("", "rpc_queue", "Q1", "ABCDEFGH", b"ping")
        .await
        .unwrap();
    eventually(|| broker.queue_depth("Q1") == 1).await;

    let reply = broker
        .published()
        .into_iter()
        .find(|published| published.routing_key == "Q1")
        .unwrap();
    assert_eq!(reply.exchange, "");
    assert_eq!(reply.message.body, b"echo: ping");
    assert_eq!(reply.message.correlation_id.as_deref(), Some("ABCDEFGH"));
    assert_eq!(reply.message.reply_to, None);

    cancel.cancel();
    serving.await.unwrap().unwrap();
    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rpc_client_round_trip() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let cancel = CancellationToken::new();

    let server = RpcServer::new(&manager);
    let serving = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            server
                .serve(cancel, "rpc_queue", |body: Vec<u8>| async move {
                    let n: u64 = String::from_utf8(body)?.parse()?;
                    Ok::<_, anyhow::Error>((n * 2).to_string().into_bytes())
                })
                .await
        })
    };
    eventually(|| broker.consumer_count("rpc_queue") == 1).await;

    let client = RpcClient::new(&manager).with_timeout(Duration::from_secs(5));
    let reply = client.call("", "rpc_queue", b"21").await.unwrap();
    assert_eq!(reply, b"42");

    // a request the server rejects gets no reply
    let result = client.call("", "rpc_queue", b"not a number").await;
    assert_eq!(result, Err(RabbitMQError::RpcTimeout(Duration::from_secs(5))));
    assert_eq!(broker.nack_count(), 0);

    cancel.cancel();
    serving.await.unwrap().unwrap();
    client.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rpc_client_times_out_without_server() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;

    let client = RpcClient::new(&manager).with_timeout(Duration::from_secs(2));
    let result = client.call("", "rpc_queue", b"30").await;
    assert_eq!(result, Err(RabbitMQError::RpcTimeout(Duration::from_secs(2))));

    client.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_handler_is_bounded_by_delivery_limit() {
    const MESSAGES: u64 = 4;
    const LIMIT: u32 = 3;

    let broker = MemoryBroker::new();
    broker.set_delivery_limit(Some(LIMIT));
    let manager = connected(&broker).await;
    let cancel = CancellationToken::new();

    let mut listeners = Vec::new();
    for _ in 0..2 {
        let consumer = Consumer::new(&manager);
        let cancel = cancel.clone();
        listeners.push(tokio::spawn(async move {
            let topology = Topology::work_queue("poison").durable(true);
            consumer
                .listen(cancel, topology, |_delivery: Delivery| async {
                    Err::<(), _>(anyhow::anyhow!("cannot process"))
                })
                .await
        }));
    }
    eventually(|| broker.consumer_count("poison") == 2).await;

    let producer = Producer::new(&manager);
    for i in 0..MESSAGES {
        producer
            .publish("", "poison", format!("bad {}", i).as_bytes())
            .await
            .unwrap();
    }

    let expected = MESSAGES * u64::from(LIMIT);
    eventually(|| broker.nack_count() == expected).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.nack_count(), expected);
    assert_eq!(broker.ack_count(), 0);
    assert_eq!(broker.dead_letters().len(), MESSAGES as usize);
    assert_eq!(broker.queue_depth("poison"), 0);

    cancel.cancel();
    for listener in listeners {
        listener.await.unwrap().unwrap();
    }
    manager.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_emitter_routes_by_severity() {
    let broker = MemoryBroker::new();
    let manager = connected(&broker).await;
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let emitter = Emitter::new(&manager, "logs_topic").await.unwrap();
    assert_eq!(broker.exchange_kind("logs_topic"), Some(ExchangeKind::Topic));

    let consumer = Consumer::new(&manager);
    let listening = {
        let cancel = cancel.clone();
        let handler = forward_to(tx, 0);
        tokio::spawn(async move {
            let topology = Topology::new("logs_topic", "topic", "", "*.critical");
            consumer.listen(cancel, topology, handler).await
        })
    };
    eventually(|| broker.total_consumers() == 1).await;

    emitter.push("[1] - kern.info", "kern.info").await.unwrap();
    emitter.push("[2] - kern.critical", "kern.critical").await.unwrap();

    let (_, delivery) = rx.recv().await.unwrap();
    assert_eq!(delivery.body, b"[2] - kern.critical");
    assert_eq!(delivery.routing_key, "kern.critical");
    assert_eq!(delivery.exchange, "logs_topic");

    let persisted = broker.published();
    assert_eq!(persisted.len(), 2);
    assert!(persisted.iter().all(|p| p.message.is_persistent()));

    cancel.cancel();
    listening.await.unwrap().unwrap();
    emitter.close().await.unwrap();
    manager.close().await.unwrap();
}
