// src/rabbitmq/mod.rs
// Reliability layer over a RabbitMQ broker: a self-healing connection, leased
// channels, confirmed publishing and acknowledged consumption.

pub mod broker;
pub mod errors;
pub mod memory;

mod amqp_client;
mod channel_manager;
mod connection;
mod consumer;
mod emitter;
mod publisher;
mod reconnect;
mod rpc;

pub use amqp_client::LapinBroker;
pub use broker::{
    Broker, BrokerChannel, BrokerConnection, CloseReason, Confirmation, Delivery, ExchangeKind,
    OutboundMessage, QueueOptions,
};
pub use channel_manager::{ChannelConfig, ChannelLease};
pub use connection::{redact_url, ConnectionEvent, ConnectionManager, ConnectionManagerBuilder};
pub use consumer::{Consumer, HandlerResult, MessageHandler, Topology, DEFAULT_PREFETCH};
pub use emitter::{Emitter, DEFAULT_EVENT_EXCHANGE};
pub use errors::{RabbitMQError, Result};
pub use memory::{ConfirmBehavior, MemoryBroker};
pub use publisher::{Producer, ProducerConfig, DEFAULT_CONFIRM_TIMEOUT};
pub use reconnect::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use rpc::{correlation_id, RpcClient, RpcServer, DEFAULT_RPC_TIMEOUT};
