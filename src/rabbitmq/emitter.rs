// src/rabbitmq/emitter.rs

use tracing::info;

use super::broker::ExchangeKind;
use super::connection::ConnectionManager;
use super::errors::Result;
use super::publisher::{Producer, ProducerConfig};

pub const DEFAULT_EVENT_EXCHANGE: &str = "logs_topic";

/// Publishes events to a durable topic exchange, keyed by severity.
pub struct Emitter {
    producer: Producer,
    exchange: String,
}

impl Emitter {
    /// Declares `exchange` as a durable topic exchange. Fails if there is no
    /// live connection or the declaration is refused.
    pub async fn new(connection: &ConnectionManager, exchange: &str) -> Result<Self> {
        Self::with_config(connection, exchange, ProducerConfig::default()).await
    }

    pub async fn with_config(
        connection: &ConnectionManager,
        exchange: &str,
        config: ProducerConfig,
    ) -> Result<Self> {
        let producer = Producer::with_config(connection, config);
        producer.declare_exchange(exchange, ExchangeKind::Topic).await?;

        Ok(Self {
            producer,
            exchange: exchange.to_string(),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `event` with `severity` as the routing key and waits for the
    /// broker's confirmation.
    pub async fn push(&self, event: &str, severity: &str) -> Result<()> {
        self.producer
            .publish(&self.exchange, severity, event.as_bytes())
            .await?;
        info!(exchange = %self.exchange, routing_key = %severity, "Sending message: {}", event);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.producer.close().await
    }
}
