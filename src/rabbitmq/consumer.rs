// src/rabbitmq/consumer.rs

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures_lite::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{
    BrokerChannel, Delivery, DeliveryStream, ExchangeKind, IncomingDelivery, QueueOptions,
};
use super::channel_manager::{ChannelConfig, ChannelLease};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};

/// One unacknowledged delivery in flight per subscriber unless configured otherwise.
pub const DEFAULT_PREFETCH: u16 = 1;

pub type HandlerResult = anyhow::Result<()>;

/// Processes one delivery. `Ok` acks it; `Err` (or a panic) nacks it with requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        (self)(delivery).await
    }
}

/// Exchange, queue and binding a subscriber asks for.
///
/// An empty `exchange` skips the exchange declaration and the binding (the
/// default exchange routes by queue name). An empty `queue` asks the broker for
/// an exclusive, auto-named queue: every subscriber gets its own copy of each
/// message. A named queue is shared, so subscribers compete for messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    pub prefetch_count: u16,
    pub durable_queue: bool,
}

impl Topology {
    pub fn new(
        exchange: &str,
        kind: impl Into<ExchangeKind>,
        queue: &str,
        routing_key: &str,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            kind: kind.into(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            prefetch_count: DEFAULT_PREFETCH,
            durable_queue: false,
        }
    }

    /// Private queue bound to a fanout exchange.
    pub fn fanout(exchange: &str) -> Self {
        Self::new(exchange, ExchangeKind::Fanout, "", "")
    }

    /// Named queue on the default exchange.
    pub fn work_queue(queue: &str) -> Self {
        Self::new("", ExchangeKind::Direct, queue, "")
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable_queue = durable;
        self
    }

    fn queue_options(&self) -> QueueOptions {
        let anonymous = self.queue.is_empty();
        QueueOptions {
            durable: self.durable_queue && !anonymous,
            auto_delete: false,
            exclusive: anonymous,
        }
    }
}

/// Runs subscriptions on channels of its own; never shares them with a producer.
#[derive(Clone)]
pub struct Consumer {
    connection: ConnectionManager,
}

struct Subscription {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    consumer_tag: String,
    deliveries: DeliveryStream,
}

impl Consumer {
    pub fn new(connection: &ConnectionManager) -> Self {
        Self {
            connection: connection.clone(),
        }
    }

    /// Declares `topology`, subscribes with manual acknowledgments and feeds
    /// every delivery to `handler` on a dedicated task until `cancel` fires.
    ///
    /// Setup failures are returned before any delivery is dispatched. On
    /// cancellation the subscription is cancelled, the in-flight handler (if
    /// any) runs to completion, and the channel is closed before this returns.
    /// If the subscription ends on its own (channel or connection lost) the
    /// result is [`RabbitMQError::SubscriptionClosed`].
    pub async fn listen<H: MessageHandler>(
        &self,
        cancel: CancellationToken,
        topology: Topology,
        handler: H,
    ) -> Result<()> {
        let lease = ChannelLease::new(
            self.connection.clone(),
            ChannelConfig::consumer(topology.prefetch_count),
        );

        let subscription = match self.subscribe(&lease, &topology).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(close_err) = lease.close().await {
                    warn!(channel_id = %lease.id(), "Failed to close channel after setup error: {}", close_err);
                }
                return Err(e);
            }
        };

        let Subscription {
            channel,
            queue,
            consumer_tag,
            deliveries,
        } = subscription;

        info!(queue = %queue, "Waiting for messages");
        let mut dispatch = tokio::spawn(dispatch_loop(
            deliveries,
            Arc::new(handler),
            cancel.clone(),
            queue.clone(),
        ));

        let finished_early = tokio::select! {
            _ = cancel.cancelled() => None,
            joined = &mut dispatch => Some(joined),
        };

        let result = match finished_early {
            None => {
                debug!(queue = %queue, consumer_tag = %consumer_tag, "Cancelling subscription");
                if channel.is_open() {
                    if let Err(e) = channel.cancel(&consumer_tag).await {
                        warn!(queue = %queue, "Failed to cancel consumer: {}", e);
                    }
                }
                if let Err(e) = dispatch.await {
                    error!(queue = %queue, "Dispatch task failed: {}", e);
                }
                Ok(())
            }
            Some(joined) => {
                if let Err(e) = joined {
                    error!(queue = %queue, "Dispatch task failed: {}", e);
                }
                if cancel.is_cancelled() {
                    Ok(())
                } else {
                    Err(RabbitMQError::SubscriptionClosed(queue.clone()))
                }
            }
        };

        if let Err(e) = lease.close().await {
            warn!(queue = %queue, "Failed to close consumer channel: {}", e);
        }
        info!(queue = %queue, "Consumer stopped");
        result
    }

    async fn subscribe(&self, lease: &ChannelLease, topology: &Topology) -> Result<Subscription> {
        let channel = lease.ensure_channel().await?;

        if !topology.exchange.is_empty() {
            channel
                .declare_exchange(&topology.exchange, &topology.kind, true)
                .await?;
            debug!(exchange = %topology.exchange, kind = %topology.kind, "Declared exchange");
        }

        let queue = channel
            .declare_queue(&topology.queue, topology.queue_options())
            .await?;
        debug!(queue = %queue, "Declared queue");

        if !topology.exchange.is_empty() {
            channel
                .bind_queue(&queue, &topology.routing_key, &topology.exchange)
                .await?;
            debug!(
                queue = %queue,
                exchange = %topology.exchange,
                routing_key = %topology.routing_key,
                "Bound queue"
            );
        }

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let deliveries = channel.subscribe(&queue, &consumer_tag).await?;

        Ok(Subscription {
            channel,
            queue,
            consumer_tag,
            deliveries,
        })
    }
}

async fn dispatch_loop<H: MessageHandler>(
    mut deliveries: DeliveryStream,
    handler: Arc<H>,
    cancel: CancellationToken,
    queue: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(incoming)) => settle(handler.as_ref(), incoming, &queue).await,
            Some(Err(e)) => error!(queue = %queue, "Error receiving message: {}", e),
            None => {
                warn!(queue = %queue, "Delivery stream ended");
                break;
            }
        }
    }
}

async fn settle<H: MessageHandler>(handler: &H, incoming: IncomingDelivery, queue: &str) {
    let IncomingDelivery { delivery, acker } = incoming;
    let delivery_tag = delivery.delivery_tag;
    debug!(queue = %queue, delivery_tag, "Received a message: {}", delivery.body_str());

    let outcome = AssertUnwindSafe(handler.handle(delivery))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));

    match outcome {
        Ok(()) => {
            if let Err(e) = acker.ack().await {
                error!(queue = %queue, delivery_tag, "Failed to acknowledge message: {}", e);
            }
        }
        Err(e) => {
            warn!(queue = %queue, delivery_tag, "Error handling message: {:#}", e);
            if let Err(e) = acker.nack(true).await {
                error!(queue = %queue, delivery_tag, "Failed to negatively acknowledge message: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_queues_are_exclusive() {
        let options = Topology::fanout("logs").queue_options();
        assert!(options.exclusive);
        assert!(!options.durable);
    }

    #[test]
    fn named_queues_are_shared() {
        let options = Topology::work_queue("task_queue").durable(true).queue_options();
        assert!(!options.exclusive);
        assert!(options.durable);
    }

    #[test]
    fn kinds_parse_from_strings() {
        let topology = Topology::new("logs_topic", "topic", "", "*.critical");
        assert_eq!(topology.kind, ExchangeKind::Topic);
        assert_eq!(topology.prefetch_count, DEFAULT_PREFETCH);
    }
}
