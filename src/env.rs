// src/env.rs
use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::debug;

use crate::config::ClientConfig;

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const RABBITMQ_CONFIRM_TIMEOUT_MS: &str = "RABBITMQ_CONFIRM_TIMEOUT_MS";
pub const RABBITMQ_RECONNECT_DELAY_MS: &str = "RABBITMQ_RECONNECT_DELAY_MS";
pub const RABBITMQ_CONNECTION_NAME: &str = "RABBITMQ_CONNECTION_NAME";

/// Loads `.env` (if present) and applies the process environment on top of `config`.
pub fn apply_env(config: ClientConfig) -> Result<ClientConfig> {
    dotenv().ok();
    apply_overrides(config, |key| env::var(key).ok())
}

/// Applies overrides read through `lookup`. Unset or empty variables are ignored.
pub fn apply_overrides<F>(mut config: ClientConfig, lookup: F) -> Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(uri) = lookup(AMQP_ADDR) {
        debug!("Using broker address from {}", AMQP_ADDR);
        config.connection.uri = uri;
    }
    if let Some(name) = lookup(RABBITMQ_CONNECTION_NAME) {
        config.connection.connection_name = Some(name);
    }
    if let Some(value) = lookup(RABBITMQ_PREFETCH_COUNT) {
        config.consumer.prefetch_count = parse(RABBITMQ_PREFETCH_COUNT, &value)?;
    }
    if let Some(value) = lookup(RABBITMQ_CONFIRM_TIMEOUT_MS) {
        config.producer.confirm_timeout_ms = parse(RABBITMQ_CONFIRM_TIMEOUT_MS, &value)?;
    }
    if let Some(value) = lookup(RABBITMQ_RECONNECT_DELAY_MS) {
        config.connection.reconnect.delay_ms = parse(RABBITMQ_RECONNECT_DELAY_MS, &value)?;
    }

    config.validate()?;
    Ok(config)
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} has an invalid value: {:?}", key, value))
}
