// src/rabbitmq/rpc.rs

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::{Delivery, QueueOptions};
use super::channel_manager::{ChannelConfig, ChannelLease};
use super::connection::ConnectionManager;
use super::consumer::{Consumer, HandlerResult, MessageHandler, Topology};
use super::errors::{RabbitMQError, Result};
use super::publisher::Producer;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

const CORRELATION_ID_LEN: usize = 32;

/// Random upper-case correlation id.
pub fn correlation_id() -> String {
    let mut rng = rand::rng();
    (0..CORRELATION_ID_LEN)
        .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
        .collect()
}

/// Sends requests and waits for the correlated reply on a private queue.
pub struct RpcClient {
    connection: ConnectionManager,
    producer: Producer,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(connection: &ConnectionManager) -> Self {
        Self {
            connection: connection.clone(),
            producer: Producer::new(connection),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publishes `body` with a fresh correlation id and returns the body of the
    /// first reply carrying that id. Replies with other ids are acknowledged
    /// and dropped. Fails with [`RabbitMQError::RpcTimeout`] when no matching
    /// reply arrives in time.
    pub async fn call(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Vec<u8>> {
        let lease = ChannelLease::new(self.connection.clone(), ChannelConfig::default());
        let result = self.round_trip(&lease, exchange, routing_key, body).await;

        if let Err(e) = lease.close().await {
            warn!(channel_id = %lease.id(), "Failed to close reply channel: {}", e);
        }
        result
    }

    async fn round_trip(
        &self,
        lease: &ChannelLease,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let channel = lease.ensure_channel().await?;
        let reply_queue = channel
            .declare_queue(
                "",
                QueueOptions {
                    exclusive: true,
                    ..QueueOptions::default()
                },
            )
            .await?;

        let consumer_tag = format!("rpc-client-{}", lease.id());
        let mut replies = channel.subscribe(&reply_queue, &consumer_tag).await?;

        let correlation_id = correlation_id();
        self.producer
            .publish_rpc(exchange, routing_key, &reply_queue, &correlation_id, body)
            .await?;
        info!(routing_key = %routing_key, correlation_id = %correlation_id, "Request sent");

        let wait = async {
            while let Some(next) = replies.next().await {
                let incoming = match next {
                    Ok(incoming) => incoming,
                    Err(e) => return Err(e),
                };
                if let Err(e) = incoming.acker.ack().await {
                    warn!(queue = %reply_queue, "Failed to acknowledge reply: {}", e);
                }

                if incoming.delivery.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                    return Ok(incoming.delivery.body);
                }
                debug!(
                    queue = %reply_queue,
                    correlation_id = ?incoming.delivery.correlation_id,
                    "Dropping reply for another request"
                );
            }
            Err(RabbitMQError::SubscriptionClosed(reply_queue.clone()))
        };

        let reply = tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| RabbitMQError::RpcTimeout(self.timeout))?;

        if channel.is_open() {
            if let Err(e) = channel.cancel(&consumer_tag).await {
                warn!(queue = %reply_queue, "Failed to cancel reply consumer: {}", e);
            }
        }
        reply
    }

    pub async fn close(&self) -> Result<()> {
        self.producer.close().await
    }
}

/// Answers requests arriving on a named queue.
pub struct RpcServer {
    consumer: Consumer,
    producer: Arc<Producer>,
}

struct Responder<F> {
    producer: Arc<Producer>,
    handler: F,
}

impl RpcServer {
    pub fn new(connection: &ConnectionManager) -> Self {
        Self {
            consumer: Consumer::new(connection),
            producer: Arc::new(Producer::new(connection)),
        }
    }

    /// Serves `queue` until `cancel` fires. Each request body goes to
    /// `handler`; its output is published to the request's reply-to queue with
    /// the request's correlation id. A request the handler rejects, or one
    /// without a reply-to, is acknowledged without a reply. A reply that cannot
    /// be published sends the request back to the queue.
    pub async fn serve<F, Fut>(&self, cancel: CancellationToken, queue: &str, handler: F) -> Result<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        info!(queue = %queue, "Awaiting RPC requests");
        let responder = Responder {
            producer: self.producer.clone(),
            handler,
        };

        let result = self
            .consumer
            .listen(cancel, Topology::work_queue(queue), responder)
            .await;

        if let Err(e) = self.producer.close().await {
            warn!(queue = %queue, "Failed to close reply channel: {}", e);
        }
        result
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for Responder<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        let Delivery {
            body,
            correlation_id,
            reply_to,
            ..
        } = delivery;

        let reply_to = match reply_to {
            Some(reply_to) if !reply_to.is_empty() => reply_to,
            _ => {
                warn!("Request without reply-to, dropping it");
                return Ok(());
            }
        };

        let response = match (self.handler)(body).await {
            Ok(response) => response,
            Err(e) => {
                warn!(reply_to = %reply_to, "Failed to handle request: {:#}", e);
                return Ok(());
            }
        };

        let correlation_id = correlation_id.unwrap_or_default();
        self.producer
            .publish_rpc("", &reply_to, "", &correlation_id, &response)
            .await?;
        debug!(reply_to = %reply_to, correlation_id = %correlation_id, "Reply sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_upper_case_letters() {
        let id = correlation_id();
        assert_eq!(id.len(), CORRELATION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_uppercase()));
        assert_ne!(id, correlation_id());
    }
}
