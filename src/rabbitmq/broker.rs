// src/rabbitmq/broker.rs
// The seam between the reliability layer and whatever actually speaks AMQP.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use super::errors::Result;

/// Why a broker connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request, no error attached.
    Graceful,
    /// Broker-initiated close or network failure.
    Failed(String),
}

/// Outcome of a publish on a confirm-enabled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel was not in confirm mode.
    NotRequested,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// AMQP delivery mode 2: the broker writes the message to disk.
pub const PERSISTENT: u8 = 2;

/// A message on its way to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(PERSISTENT)
    }
}

/// One inbound message handed to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Delivery {
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Settles a single delivery. Never acknowledges `multiple`.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

pub struct IncomingDelivery {
    pub delivery: Delivery,
    pub acker: Box<dyn DeliveryAcker>,
}

impl fmt::Debug for IncomingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingDelivery")
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

pub type CloseNotification = BoxFuture<'static, CloseReason>;
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation>>;
pub type DeliveryStream = BoxStream<'static, Result<IncomingDelivery>>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Resolves once, when the connection is gone.
    fn close_notification(&self) -> CloseNotification;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn enable_confirms(&self) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind, durable: bool) -> Result<()>;

    /// Returns the queue name, which the broker picks when `name` is empty.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    /// The returned future resolves to the broker's confirmation for this publish only.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm>;

    /// Manual-ack subscription.
    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kind_parses_known_and_custom_names() {
        assert_eq!(ExchangeKind::from("fanout"), ExchangeKind::Fanout);
        assert_eq!(ExchangeKind::from("topic").to_string(), "topic");
        assert_eq!(
            ExchangeKind::from("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_string())
        );
    }

    #[test]
    fn outbound_message_defaults_to_transient() {
        let message = OutboundMessage::new("hello");
        assert!(!message.is_persistent());
        assert_eq!(message.body, b"hello".to_vec());
    }
}
