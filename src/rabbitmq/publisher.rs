// src/rabbitmq/publisher.rs

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{Confirmation, ExchangeKind, OutboundMessage, PERSISTENT};
use super::channel_manager::{ChannelConfig, ChannelLease};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};

pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Upper bound on publish plus broker confirmation.
    pub confirm_timeout: Duration,
    pub content_type: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            content_type: "text/plain".to_string(),
        }
    }
}

/// Publishes over channels of its own, re-leased whenever the connection
/// underneath has changed.
///
/// Two delivery tiers:
/// - [`Producer::publish`] waits for the broker to confirm the message, on a
///   confirm-mode channel.
/// - [`Producer::publish_rpc`] goes out on a plain channel and returns as soon
///   as the publish call itself completes; the correlated reply is the
///   acknowledgment.
pub struct Producer {
    lease: ChannelLease,
    rpc_lease: ChannelLease,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(connection: &ConnectionManager) -> Self {
        Self::with_config(connection, ProducerConfig::default())
    }

    pub fn with_config(connection: &ConnectionManager, config: ProducerConfig) -> Self {
        Self {
            lease: ChannelLease::new(connection.clone(), ChannelConfig::publisher()),
            rpc_lease: ChannelLease::new(connection.clone(), ChannelConfig::rpc()),
            config,
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Declares a durable exchange on the producer's channel.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let channel = self.lease.ensure_channel().await?;
        channel.declare_exchange(name, &kind, true).await?;
        debug!(exchange = %name, kind = %kind, "Declared exchange");
        Ok(())
    }

    /// Publishes a persistent message and waits for the broker's confirmation.
    ///
    /// Succeeds only on an ack. A nack yields [`RabbitMQError::Nacked`]; no
    /// confirmation within the configured bound yields
    /// [`RabbitMQError::ConfirmTimeout`].
    pub async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let channel = self.lease.ensure_channel().await?;

        let message = OutboundMessage {
            content_type: Some(self.config.content_type.clone()),
            delivery_mode: Some(PERSISTENT),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(chrono::Utc::now().timestamp().max(0) as u64),
            ..OutboundMessage::new(body)
        };

        let confirmed = tokio::time::timeout(self.config.confirm_timeout, async {
            let pending = channel.publish(exchange, routing_key, message).await?;
            pending.await
        })
        .await;

        match confirmed {
            Ok(Ok(Confirmation::Ack)) => {
                info!(exchange = %exchange, routing_key = %routing_key, "Message published");
                Ok(())
            }
            Ok(Ok(Confirmation::Nack)) => {
                warn!(exchange = %exchange, routing_key = %routing_key, "Broker rejected message");
                Err(RabbitMQError::Nacked {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
            Ok(Ok(Confirmation::NotRequested)) => Err(RabbitMQError::PublishError(
                "channel is not in confirm mode".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "No confirmation within {:?}",
                    self.config.confirm_timeout
                );
                Err(RabbitMQError::ConfirmTimeout(self.config.confirm_timeout))
            }
        }
    }

    /// Publishes a request or reply carrying reply-to and correlation-id
    /// metadata. Does not wait for a broker confirmation. Empty `reply_to` or
    /// `correlation_id` are left unset.
    pub async fn publish_rpc(
        &self,
        exchange: &str,
        routing_key: &str,
        reply_to: &str,
        correlation_id: &str,
        body: &[u8],
    ) -> Result<()> {
        let channel = self.rpc_lease.ensure_channel().await?;

        let message = OutboundMessage {
            content_type: Some(self.config.content_type.clone()),
            correlation_id: non_empty(correlation_id),
            reply_to: non_empty(reply_to),
            ..OutboundMessage::new(body)
        };

        // no confirms on this channel, so the confirmation resolves at once
        tokio::time::timeout(self.config.confirm_timeout, async {
            let pending = channel.publish(exchange, routing_key, message).await?;
            pending.await
        })
        .await
        .map_err(|_| RabbitMQError::PublishError("publish timed out".to_string()))??;

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            "RPC message published"
        );
        Ok(())
    }

    /// Closes the producer's channels if they are open. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let confirmed = self.lease.close().await;
        let rpc = self.rpc_lease.close().await;
        confirmed.and(rpc)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
