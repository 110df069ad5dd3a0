// src/rabbitmq/channel_manager.rs

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::BrokerChannel;
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};

/// Configuration options for a leased channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited, `None` leaves the broker default)
    pub prefetch_count: Option<u16>,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a short UUID)
    pub id: String,
}

impl ChannelConfig {
    fn with_prefix(prefix: &str) -> Self {
        Self {
            prefetch_count: None,
            confirm_mode: false,
            id: format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    /// Confirm-mode channel for publishing.
    pub fn publisher() -> Self {
        Self {
            confirm_mode: true,
            ..Self::with_prefix("publisher")
        }
    }

    /// Plain channel for request and reply publishes. No confirms are
    /// requested, so none are left pending.
    pub fn rpc() -> Self {
        Self::with_prefix("rpc")
    }

    pub fn consumer(prefetch_count: u16) -> Self {
        Self {
            prefetch_count: Some(prefetch_count),
            ..Self::with_prefix("consumer")
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::with_prefix("channel")
    }
}

/// Owns at most one channel leased from a [`ConnectionManager`] and re-opens it
/// whenever the cached one has been closed (for example because the connection
/// underneath it was replaced).
pub struct ChannelLease {
    connection: ConnectionManager,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    config: ChannelConfig,
}

impl ChannelLease {
    pub fn new(connection: ConnectionManager, config: ChannelConfig) -> Self {
        debug!(
            channel_id = %config.id,
            prefetch = ?config.prefetch_count,
            confirm = %config.confirm_mode,
            "Creating channel lease"
        );

        Self {
            connection,
            channel: Mutex::new(None),
            config,
        }
    }

    /// Returns the cached channel if it is still open, otherwise opens and
    /// configures a new one. Fails with [`RabbitMQError::NotConnected`] while
    /// the connection manager has no live connection.
    pub async fn ensure_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut guard = self.channel.lock().await;

        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            debug!(channel_id = %self.config.id, "Cached channel is closed, re-opening");
        }

        let connection = self
            .connection
            .get_handle()
            .ok_or(RabbitMQError::NotConnected)?;
        let channel = connection.open_channel().await?;

        if let Err(e) = self.configure(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                warn!(channel_id = %self.config.id, "Failed to close misconfigured channel: {}", close_err);
            }
            return Err(e);
        }

        info!(channel_id = %self.config.id, "Channel created and configured successfully");
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn configure(&self, channel: &dyn BrokerChannel) -> Result<()> {
        if let Some(prefetch) = self.config.prefetch_count {
            debug!(channel_id = %self.config.id, "Setting channel QoS to {}", prefetch);
            channel.set_prefetch(prefetch).await?;
        }

        if self.config.confirm_mode {
            debug!(channel_id = %self.config.id, "Enabling confirm mode");
            channel.enable_confirms().await?;
        }
        Ok(())
    }

    /// Closes the cached channel if it is open. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let channel = self.channel.lock().await.take();
        match channel {
            Some(channel) if channel.is_open() => {
                debug!(channel_id = %self.config.id, "Closing channel");
                channel.close().await
            }
            _ => Ok(()),
        }
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.config.id
    }
}
