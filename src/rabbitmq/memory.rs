// src/rabbitmq/memory.rs
//! An in-process broker behind the same traits as [`LapinBroker`](super::LapinBroker).
//!
//! It routes through direct, fanout and topic exchanges, keeps per-queue
//! consumers in round-robin order, honours prefetch, requeues unacknowledged
//! deliveries when their channel goes away and deletes exclusive queues with
//! their connection. Faults are injected from the test side: refused dials,
//! forced disconnects, nacked or withheld publisher confirmations and a
//! per-message delivery limit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, CloseNotification, CloseReason, Confirmation,
    Delivery, DeliveryAcker, DeliveryStream, ExchangeKind, IncomingDelivery, OutboundMessage,
    PendingConfirm, QueueOptions,
};
use super::errors::{RabbitMQError, Result};

/// How the broker answers publishes on confirm-mode channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    #[default]
    Ack,
    Nack,
    /// Never confirm.
    Withhold,
}

/// A publish the broker accepted, as recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    message: OutboundMessage,
    deliveries: u32,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

struct ConsumerState {
    tag: String,
    channel_id: u64,
    sender: mpsc::UnboundedSender<Result<IncomingDelivery>>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    exclusive_owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
}

struct ChannelState {
    connection_id: u64,
    confirms: bool,
    prefetch: u16,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

struct State {
    reachable: bool,
    refuse_dials: u32,
    dials: u64,
    confirm_behavior: ConfirmBehavior,
    delivery_limit: Option<u32>,
    connections: HashMap<u64, Arc<watch::Sender<Option<CloseReason>>>>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    dead_letters: Vec<PublishedMessage>,
    acks: u64,
    nacks: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            reachable: true,
            refuse_dials: 0,
            dials: 0,
            confirm_behavior: ConfirmBehavior::default(),
            delivery_limit: None,
            connections: HashMap::new(),
            channels: HashMap::new(),
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            unacked: HashMap::new(),
            published: Vec::new(),
            dead_letters: Vec::new(),
            acks: 0,
            nacks: 0,
        }
    }
}

type SharedState = Arc<Mutex<State>>;

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Topic pattern match: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&first, key_rest)) => (word == "*" || word == first) && matches(rest, key_rest),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let target = self.exchanges.get(exchange).ok_or_else(|| {
            RabbitMQError::PublishError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut queues: Vec<String> = Vec::new();
        for (queue, binding_key) in &target.bindings {
            let routed = match target.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(binding_key, routing_key),
                _ => binding_key == routing_key,
            };
            if routed && !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        Ok(queues)
    }

    fn has_capacity(&self, channel_id: u64) -> bool {
        let prefetch = match self.channels.get(&channel_id) {
            Some(channel) => channel.prefetch,
            None => return false,
        };
        prefetch == 0
            || self
                .unacked
                .values()
                .filter(|unacked| unacked.channel_id == channel_id)
                .count()
                < usize::from(prefetch)
    }

    fn dispatch(&mut self, queue_name: &str, shared: &Weak<Mutex<State>>) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let start = queue.cursor % count;
            let chosen = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&index| self.has_capacity(queue.consumers[index].channel_id));
            let Some(index) = chosen else {
                return;
            };

            let tag = next_id();
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let Some(mut message) = queue.messages.pop_front() else {
                return;
            };
            message.deliveries += 1;
            queue.cursor = index + 1;

            let consumer = &queue.consumers[index];
            let incoming = IncomingDelivery {
                delivery: Delivery {
                    body: message.message.body.clone(),
                    delivery_tag: tag,
                    redelivered: message.deliveries > 1,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    correlation_id: message.message.correlation_id.clone(),
                    reply_to: message.message.reply_to.clone(),
                },
                acker: Box::new(MemoryAcker {
                    state: shared.clone(),
                    tag,
                }),
            };

            let channel_id = consumer.channel_id;
            if consumer.sender.send(Ok(incoming)).is_err() {
                // subscriber dropped its stream
                queue.consumers.remove(index);
                message.deliveries -= 1;
                queue.messages.push_front(message);
                continue;
            }

            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    channel_id,
                    message,
                },
            );
        }
    }

    fn requeue(&mut self, queue_name: &str, message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.messages.push_front(message);
        }
    }

    fn dead_letter(&mut self, message: StoredMessage) {
        self.dead_letters.push(PublishedMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            message: message.message,
        });
    }

    /// Drops a channel's consumers and requeues what it had not settled.
    /// Returns the queues that need a dispatch pass.
    fn teardown_channel(&mut self, channel_id: u64) -> Vec<String> {
        self.channels.remove(&channel_id);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel_id != channel_id);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched = Vec::new();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if !touched.contains(&unacked.queue) {
                    touched.push(unacked.queue.clone());
                }
                self.requeue(&unacked.queue, unacked.message);
            }
        }
        touched
    }

    fn teardown_connection(
        &mut self,
        connection_id: u64,
        reason: CloseReason,
        shared: &Weak<Mutex<State>>,
    ) -> bool {
        let Some(closed) = self.connections.remove(&connection_id) else {
            return false;
        };

        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();

        let mut touched = Vec::new();
        for channel_id in channel_ids {
            touched.extend(self.teardown_channel(channel_id));
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.exclusive_owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
        }

        for queue in touched {
            self.dispatch(&queue, shared);
        }

        closed.send_replace(Some(reason));
        true
    }
}

/// In-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: SharedState,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unreachable every dial fails.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Fail the next `count` dials.
    pub fn refuse_next_dials(&self, count: u32) {
        lock(&self.state).refuse_dials = count;
    }

    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        lock(&self.state).confirm_behavior = behavior;
    }

    /// After `limit` deliveries a nacked message is dead-lettered instead of requeued.
    pub fn set_delivery_limit(&self, limit: Option<u32>) {
        lock(&self.state).delivery_limit = limit;
    }

    /// Simulates a network failure on every open connection.
    pub fn disconnect_all(&self) {
        self.close_all(CloseReason::Failed(
            "CONNECTION_FORCED - broker forced connection closure".to_string(),
        ));
    }

    /// Simulates the broker closing every connection without an error.
    pub fn close_all_gracefully(&self) {
        self.close_all(CloseReason::Graceful);
    }

    fn close_all(&self, reason: CloseReason) {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.teardown_connection(id, reason.clone(), &weak);
        }
    }

    pub fn dial_count(&self) -> u64 {
        lock(&self.state).dials
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Open channels that have publisher confirms enabled.
    pub fn confirm_channels(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .filter(|channel| channel.confirms)
            .count()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        lock(&self.state)
            .exchanges
            .get(name)
            .map(|exchange| exchange.kind.clone())
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        lock(&self.state)
            .queues
            .get(queue)
            .is_some_and(|queue| queue.durable)
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.messages.len())
    }

    pub fn unacked_count(&self) -> usize {
        lock(&self.state).unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// Consumers across all queues, including auto-named ones.
    pub fn total_consumers(&self) -> usize {
        lock(&self.state)
            .queues
            .values()
            .map(|queue| queue.consumers.len())
            .sum()
    }

    pub fn ack_count(&self) -> u64 {
        lock(&self.state).acks
    }

    pub fn nack_count(&self) -> u64 {
        lock(&self.state).nacks
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    pub fn dead_letters(&self) -> Vec<PublishedMessage> {
        lock(&self.state).dead_letters.clone()
    }

    /// Declares a queue from outside any connection, as an operator would.
    pub fn declare_queue(&self, name: &str, durable: bool) {
        lock(&self.state)
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                durable,
                ..QueueState::default()
            });
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn dial(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = lock(&self.state);
        state.dials += 1;

        if !state.reachable {
            return Err(RabbitMQError::ConnectionError(format!(
                "Failed to connect: {} is unreachable",
                url
            )));
        }
        if state.refuse_dials > 0 {
            state.refuse_dials -= 1;
            return Err(RabbitMQError::ConnectionError(format!(
                "Failed to connect: {} refused the connection",
                url
            )));
        }

        let id = next_id();
        let (closed, _) = watch::channel(None);
        let closed = Arc::new(closed);
        state.connections.insert(id, closed.clone());
        debug!(connection_id = id, "Memory broker accepted connection");

        Ok(Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
            closed,
        }))
    }
}

pub struct MemoryConnection {
    id: u64,
    state: SharedState,
    closed: Arc<watch::Sender<Option<CloseReason>>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = lock(&self.state);
        if !state.connections.contains_key(&self.id) {
            return Err(RabbitMQError::ConnectionError(
                "invalid connection state: closed".to_string(),
            ));
        }

        let id = next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                confirms: false,
                prefetch: 0,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            state: self.state.clone(),
        }))
    }

    fn close_notification(&self) -> CloseNotification {
        let mut rx = self.closed.subscribe();
        Box::pin(async move {
            match rx.wait_for(|reason| reason.is_some()).await {
                Ok(reason) => reason.clone().unwrap_or(CloseReason::Graceful),
                Err(_) => CloseReason::Failed("connection handle dropped".to_string()),
            }
        })
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        if state.teardown_connection(self.id, CloseReason::Graceful, &weak) {
            Ok(())
        } else {
            Err(RabbitMQError::ConnectionError(
                "invalid connection state: closed".to_string(),
            ))
        }
    }
}

pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    state: SharedState,
}

impl MemoryChannel {
    fn open_state<'a>(&self, state: &'a mut State) -> Result<&'a mut ChannelState> {
        state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| RabbitMQError::ChannelError("invalid channel state: closed".to_string()))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        lock(&self.state).channels.contains_key(&self.id)
    }

    async fn enable_confirms(&self) -> Result<()> {
        let mut state = lock(&self.state);
        self.open_state(&mut state)?.confirms = true;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = lock(&self.state);
        self.open_state(&mut state)?.prefetch = count;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind, _durable: bool) -> Result<()> {
        let mut state = lock(&self.state);
        self.open_state(&mut state)?;

        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != *kind {
                return Err(RabbitMQError::DeclareError(format!(
                    "exchange '{}': PRECONDITION_FAILED - inequivalent arg 'type' (current is '{}', received '{}')",
                    name, existing.kind, kind
                )));
            }
            return Ok(());
        }

        state.exchanges.insert(
            name.to_string(),
            ExchangeState {
                kind: kind.clone(),
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = lock(&self.state);
        self.open_state(&mut state)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            return match existing.exclusive_owner {
                Some(owner) if owner != self.connection_id => Err(RabbitMQError::DeclareError(
                    format!("queue '{}': RESOURCE_LOCKED - exclusive to another connection", name),
                )),
                _ => Ok(name),
            };
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                durable: options.durable,
                exclusive_owner: options.exclusive.then_some(self.connection_id),
                ..QueueState::default()
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let mut state = lock(&self.state);
        self.open_state(&mut state)?;

        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::BindError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let target = state.exchanges.get_mut(exchange).ok_or_else(|| {
            RabbitMQError::BindError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<PendingConfirm> {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        let confirms = self.open_state(&mut state)?.confirms;

        let queues = state.route(exchange, routing_key)?;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });

        let behavior = state.confirm_behavior;
        // a nacked message is not enqueued
        if !(confirms && behavior == ConfirmBehavior::Nack) {
            for queue in &queues {
                if let Some(target) = state.queues.get_mut(queue) {
                    target.messages.push_back(StoredMessage {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        message: message.clone(),
                        deliveries: 0,
                    });
                }
                state.dispatch(queue, &weak);
            }
        }

        let confirmation = match (confirms, behavior) {
            (false, _) => Confirmation::NotRequested,
            (true, ConfirmBehavior::Ack) => Confirmation::Ack,
            (true, ConfirmBehavior::Nack) => Confirmation::Nack,
            (true, ConfirmBehavior::Withhold) => {
                return Ok(Box::pin(future::pending::<Result<Confirmation>>()))
            }
        };
        Ok(Box::pin(future::ready(Ok(confirmation))))
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        self.open_state(&mut state)?;

        let connection_id = self.connection_id;
        let target = state.queues.get_mut(queue).ok_or_else(|| {
            RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        if target
            .exclusive_owner
            .is_some_and(|owner| owner != connection_id)
        {
            return Err(RabbitMQError::ConsumeError(format!(
                "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                queue
            )));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerState {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            sender,
        });
        state.dispatch(queue, &weak);

        Ok(futures::stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = lock(&self.state);
        self.open_state(&mut state)?;

        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|consumer| !(consumer.channel_id == self.id && consumer.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.state);
        let mut state = lock(&self.state);
        self.open_state(&mut state)?;

        for queue in state.teardown_channel(self.id) {
            state.dispatch(&queue, &weak);
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let shared = self
            .state
            .upgrade()
            .ok_or_else(|| RabbitMQError::AckError("broker is gone".to_string()))?;
        let mut state = lock(&shared);

        let unacked = state.unacked.remove(&self.tag).ok_or_else(|| {
            RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.tag
            ))
        })?;

        match requeue {
            None => state.acks += 1,
            Some(requeue) => {
                state.nacks += 1;
                let exhausted = state
                    .delivery_limit
                    .is_some_and(|limit| unacked.message.deliveries >= limit);
                if requeue && !exhausted {
                    state.requeue(&unacked.queue, unacked.message);
                } else {
                    state.dead_letter(unacked.message);
                }
            }
        }

        state.dispatch(&unacked.queue, &self.state);
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}
