// src/lib.rs
//! Reliable RabbitMQ messaging: a connection that heals itself, producers that
//! wait for broker confirmations and consumers that acknowledge only what their
//! handler processed.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::ClientConfig;
pub use rabbitmq::{
    ConnectionEvent, ConnectionManager, Consumer, Delivery, Emitter, ExchangeKind, Producer,
    RabbitMQError, ReconnectPolicy, Result, RpcClient, RpcServer, Topology,
};
