// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the broker traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, CloseNotification, CloseReason, Confirmation,
    Delivery, DeliveryAcker, DeliveryStream, ExchangeKind, IncomingDelivery, OutboundMessage,
    PendingConfirm, QueueOptions,
};
use super::errors::{RabbitMQError, Result};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Dials real brokers through lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker {
    connection_name: Option<String>,
}

impl LapinBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn connection_properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn dial(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(url, self.connection_properties())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

pub struct LapinConnection {
    connection: Connection,
    closed: Arc<watch::Sender<Option<CloseReason>>>,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let (closed, _) = watch::channel(None);
        let closed = Arc::new(closed);

        let notifier = closed.clone();
        connection.on_error(move |err| {
            warn!("RabbitMQ connection error: {}", err);
            notifier.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(CloseReason::Failed(err.to_string()));
                    true
                } else {
                    false
                }
            });
        });

        Self { connection, closed }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn close_notification(&self) -> CloseNotification {
        let mut rx = self.closed.subscribe();
        Box::pin(async move {
            match rx.wait_for(|state| state.is_some()).await {
                Ok(state) => state.clone().unwrap_or(CloseReason::Graceful),
                Err(_) => CloseReason::Failed("connection handle dropped".to_string()),
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.closed.borrow().is_none() && self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        let result = self
            .connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await;

        self.closed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(CloseReason::Graceful);
                true
            } else {
                false
            }
        });

        result.map_err(RabbitMQError::from)
    }
}

pub struct LapinChannel {
    channel: Channel,
}

fn properties_for(message: &OutboundMessage) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(mode) = message.delivery_mode {
        properties = properties.with_delivery_mode(mode);
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.clone().into());
    }
    if let Some(message_id) = &message.message_id {
        properties = properties.with_message_id(message_id.clone().into());
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    properties
}

fn lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> IncomingDelivery {
    let properties = &delivery.properties;
    let converted = Delivery {
        body: delivery.data.clone(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|queue| queue.as_str().to_string()),
    };

    IncomingDelivery {
        delivery: converted,
        acker: Box::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::DeclareError(format!("exchange '{}': {}", name, e)))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::DeclareError(format!("queue '{}': {}", name, e)))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::BindError(format!("{} -> {}: {}", queue, exchange, e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm> {
        let properties = properties_for(&message);
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        Ok(Box::pin(async move {
            let confirmation = confirm
                .await
                .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

            Ok(if confirmation.is_ack() {
                Confirmation::Ack
            } else if confirmation.is_nack() {
                Confirmation::Nack
            } else {
                Confirmation::NotRequested
            })
        }))
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(convert_delivery)
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("Failed to cancel consumer: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}
