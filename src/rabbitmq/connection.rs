// src/rabbitmq/connection.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::amqp_client::LapinBroker;
use super::broker::{Broker, BrokerConnection, CloseReason};
use super::errors::{RabbitMQError, Result};
use super::reconnect::ReconnectPolicy;

const EVENT_CAPACITY: usize = 32;
const UNPARSEABLE_URL: &str = "<unparseable amqp url>";

/// Best-effort notifications about the logical connection. Slow receivers may
/// miss events (`broadcast` semantics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(String),
    Closed,
}

type LiveHandle = Option<Arc<dyn BrokerConnection>>;

struct Shared {
    url: String,
    broker: Arc<dyn Broker>,
    policy: ReconnectPolicy,
    handle: watch::Sender<LiveHandle>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    /// Flips to `true` once the reconnect loop has exited.
    stopped: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn should_stop(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

struct Inner {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Keeps one logical connection to one broker endpoint alive.
///
/// The reconnect loop starts on construction and runs on its own task until
/// [`ConnectionManager::close`] is called or the last clone is dropped. Must be
/// created inside a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

pub struct ConnectionManagerBuilder {
    url: String,
    broker: Option<Arc<dyn Broker>>,
    policy: ReconnectPolicy,
}

impl ConnectionManagerBuilder {
    pub fn broker<B: Broker>(mut self, broker: B) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    pub fn shared_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn start(self) -> ConnectionManager {
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(LapinBroker::new()));
        let (handle, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stopped, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            url: self.url,
            broker,
            policy: self.policy,
            handle,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            stopped,
            events,
        });

        let task = tokio::spawn(reconnect_loop(shared.clone()));

        ConnectionManager {
            inner: Arc::new(Inner {
                shared,
                task: Mutex::new(Some(task)),
            }),
        }
    }
}

impl ConnectionManager {
    /// Starts connecting to `url` through lapin with the default fixed 5 second backoff.
    pub fn new(url: &str) -> Self {
        Self::builder(url).start()
    }

    pub fn builder(url: &str) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            url: url.to_string(),
            broker: None,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.shared.url
    }

    /// The live connection, or `None` while (re)connecting. Never blocks and
    /// never hands out a connection that is already closed.
    pub fn get_handle(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.inner
            .shared
            .handle
            .borrow()
            .as_ref()
            .filter(|connection| connection.is_connected())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.get_handle().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Waits up to `timeout` for a live connection.
    pub async fn wait_for_connection(
        &self,
        timeout: Duration,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut updates = self.inner.shared.handle.subscribe();

        let wait = async {
            loop {
                if let Some(connection) = self.get_handle() {
                    return Ok(connection);
                }
                if self.is_closed() {
                    return Err(RabbitMQError::Closed);
                }
                if updates.changed().await.is_err() {
                    return Err(RabbitMQError::Closed);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RabbitMQError::NotConnected)?
    }

    /// Stops reconnecting and closes the live connection, if any. Returns once
    /// the reconnect loop has exited. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let first_close = !shared.closed.swap(true, Ordering::SeqCst);
        shared.shutdown.cancel();

        let result = match shared.handle.send_replace(None) {
            Some(connection) if connection.is_connected() => connection.close().await,
            _ => Ok(()),
        };

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!("Reconnect loop ended abnormally: {}", e);
                }
                // a panicked loop never signals on its own
                shared.stopped.send_replace(true);
            }
            None => {
                // another close() owns the task; wait for the loop to finish
                let mut stopped = shared.stopped.subscribe();
                let _ = stopped.wait_for(|stopped| *stopped).await;
            }
        }

        if first_close {
            info!(url = %redact_url(&shared.url), "Connection manager closed");
        }
        result
    }
}

async fn reconnect_loop(shared: Arc<Shared>) {
    let url = redact_url(&shared.url);
    let mut failures: u32 = 0;

    loop {
        if shared.should_stop() {
            break;
        }

        info!(url = %url, "Connecting to RabbitMQ");
        let dialed = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            result = shared.broker.dial(&shared.url) => result,
        };

        match dialed {
            Ok(connection) => {
                let notification = connection.close_notification();
                shared.handle.send_replace(Some(connection));
                failures = 0;
                info!(url = %url, "Connected to RabbitMQ");
                shared.emit(ConnectionEvent::Connected);

                let reason = tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => None,
                    reason = notification => Some(reason),
                };

                // close() may already have taken the handle
                let previous = shared.handle.send_replace(None);

                match reason {
                    None => {
                        if let Some(connection) = previous.filter(|c| c.is_connected()) {
                            if let Err(e) = connection.close().await {
                                warn!("Failed to close connection on shutdown: {}", e);
                            }
                        }
                        break;
                    }
                    Some(CloseReason::Failed(err)) => {
                        warn!(url = %url, error = %err, "Connection closed");
                        shared.emit(ConnectionEvent::Disconnected(err));
                    }
                    Some(CloseReason::Graceful) => {
                        info!(url = %url, "Connection closed gracefully");
                        if shared.should_stop() {
                            break;
                        }
                        shared.emit(ConnectionEvent::Disconnected(
                            "closed gracefully by peer".to_string(),
                        ));
                    }
                }
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                error!(url = %url, attempt = failures, "Failed to connect: {}", err);
            }
        }

        if shared.should_stop() {
            break;
        }

        let delay = shared.policy.delay(failures.saturating_sub(1));
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting to RabbitMQ");
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    shared.handle.send_replace(None);
    shared.emit(ConnectionEvent::Closed);
    shared.stopped.send_replace(true);
    debug!(url = %url, "Reconnect loop stopped");
}

/// Hides the password part of an AMQP URL for logging. A URL that does not
/// parse is replaced by a placeholder so nothing of it reaches the log.
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return UNPARSEABLE_URL.to_string();
    };
    if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
        return UNPARSEABLE_URL.to_string();
    }
    parsed.to_string()
}
