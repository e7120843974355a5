//! Realtime transport client
//!
//! This module provides:
//! - A connection state machine with bounded, exponential reconnection
//! - Fire-and-forget sends plus correlated request/reply over one channel
//! - Per-message-type subscriber buses for server pushes
//!
//! The wire itself lives behind the [`Connector`] trait so the same client
//! runs over a websocket in production and an in-memory link in tests.
//! A reply consumed by a correlation waiter is not re-delivered to type
//! subscribers; correlated messages without a waiter dispatch normally.

use crate::error::TransportError;
use crate::events::{EventBus, SubscriptionId};
use crate::models::{generate_id, WireMessage};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;
use tracing::{debug, info, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Configuration for the realtime client
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: String,
    /// Appended to the endpoint as a `token` query parameter when set
    pub auth_token: Option<String>,
    /// Default wait for a correlated reply
    pub request_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub backoff_multiplier: u32,
    pub max_reconnect_attempts: u32,
    /// Depth of the outbound message channel
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://localhost:8443/ws".to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            backoff_multiplier: 2,
            max_reconnect_attempts: 5,
            outbound_buffer: 64,
        }
    }
}

/// What a live connection reports back to the client
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(WireMessage),
    Closed,
    Error(String),
}

/// The two halves of one live connection
pub struct ConnectionHandle {
    pub outbound: mpsc::Sender<WireMessage>,
    pub inbound: mpsc::Receiver<ConnectionEvent>,
}

/// Opens connections; the websocket implementation lives with the app shell
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<ConnectionHandle>;
}

/// Lifecycle notifications for UI layers
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Emitted exactly once when the reconnection budget is exhausted
    ReconnectFailed { attempts: u32 },
}

/// Client side of the realtime channel
pub struct RealtimeClient {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    outbound: RwLock<Option<mpsc::Sender<WireMessage>>>,
    /// Waiters keyed by correlation id; entries survive connection loss
    /// and are removed only by a reply, a timeout, or dispose
    pending: DashMap<String, oneshot::Sender<WireMessage>>,
    subscribers: DashMap<String, Arc<EventBus<WireMessage>>>,
    lifecycle: EventBus<TransportEvent>,
    reconnect_attempts: AtomicU32,
    auto_reconnect: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            state: RwLock::new(ConnectionState::Disconnected),
            outbound: RwLock::new(None),
            pending: DashMap::new(),
            subscribers: DashMap::new(),
            lifecycle: EventBus::new(),
            reconnect_attempts: AtomicU32::new(0),
            auto_reconnect: AtomicBool::new(false),
            reader_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn on_lifecycle<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.lifecycle.subscribe(callback)
    }

    pub fn off_lifecycle(&self, id: SubscriptionId) -> bool {
        self.lifecycle.unsubscribe(id)
    }

    /// Open the connection; a no-op when already connected
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        // A manual connect takes over from any reconnect loop still
        // waiting out its backoff
        if let Some(task) = self.reconnect_task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        self.auto_reconnect.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let url = self.endpoint_url()?;
        match self.connector.connect(&url).await {
            Ok(handle) => {
                self.install(handle);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "connection attempt failed");
                self.set_state(ConnectionState::Error);
                Err(TransportError::Connect(e.to_string()))
            }
        }
    }

    /// Close the connection and stop any reconnection in progress
    ///
    /// Pending correlated waiters are kept; their own timeouts cancel
    /// them.
    pub fn disconnect(&self) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        *self.outbound.write().expect("outbound lock poisoned") = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and drop every subscriber and waiter
    pub fn dispose(&self) {
        self.disconnect();
        self.subscribers.clear();
        self.pending.clear();
        self.lifecycle.clear();
    }

    /// Fire-and-forget send
    pub async fn send(&self, message_type: &str, payload: Value) -> Result<(), TransportError> {
        self.send_message(WireMessage::new(message_type, payload)).await
    }

    /// Send a message and wait for the correlated reply
    ///
    /// The waiter is registered before the message leaves, so a reply
    /// racing the send cannot be lost.
    pub async fn send_and_wait(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<WireMessage, TransportError> {
        let correlation_id = generate_id("req");
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        let message = WireMessage::new(message_type, payload).with_correlation(&correlation_id);
        if let Err(e) = self.send_message(message).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        let timeout = timeout.unwrap_or(self.config.request_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Subscribe to server pushes of one message type
    pub fn on<F>(&self, message_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&WireMessage) + Send + Sync + 'static,
    {
        self.subscribers
            .entry(message_type.to_string())
            .or_insert_with(|| Arc::new(EventBus::new()))
            .subscribe(callback)
    }

    pub fn off(&self, message_type: &str, id: SubscriptionId) -> bool {
        self.subscribers
            .get(message_type)
            .map(|bus| bus.unsubscribe(id))
            .unwrap_or(false)
    }

    /// Number of correlated requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn endpoint_url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.config.endpoint)?;
        if let Some(token) = &self.config.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    async fn send_message(&self, message: WireMessage) -> Result<(), TransportError> {
        let sender = self
            .outbound
            .read()
            .expect("outbound lock poisoned")
            .clone()
            .ok_or(TransportError::NotConnected)?;
        sender
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Wire up a freshly opened connection and start its read loop
    fn install(self: &Arc<Self>, handle: ConnectionHandle) {
        *self.outbound.write().expect("outbound lock poisoned") = Some(handle.outbound);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!("connection established");

        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            client.read_loop(handle.inbound).await;
        });
        let mut reader = self.reader_task.lock().expect("task lock poisoned");
        if let Some(previous) = reader.replace(task) {
            previous.abort();
        }
    }

    async fn read_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<ConnectionEvent>) {
        loop {
            match inbound.recv().await {
                Some(ConnectionEvent::Message(message)) => self.dispatch(message),
                Some(ConnectionEvent::Closed) | None => {
                    info!("connection closed");
                    break;
                }
                Some(ConnectionEvent::Error(e)) => {
                    warn!(error = %e, "connection error");
                    self.set_state(ConnectionState::Error);
                    break;
                }
            }
        }

        *self.outbound.write().expect("outbound lock poisoned") = None;
        if self.auto_reconnect.load(Ordering::SeqCst) {
            let client = Arc::clone(&self);
            let task = tokio::spawn(async move {
                client.reconnect_loop().await;
            });
            let mut reconnect = self.reconnect_task.lock().expect("task lock poisoned");
            if let Some(previous) = reconnect.replace(task) {
                previous.abort();
            }
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Route one inbound message
    ///
    /// A correlated reply resolves its waiter and stops there; anything
    /// else, including a correlated message whose waiter already timed
    /// out, goes to the type subscribers.
    fn dispatch(&self, message: WireMessage) {
        if let Some(correlation_id) = message.correlation_id.clone() {
            if let Some((_, waiter)) = self.pending.remove(&correlation_id) {
                let _ = waiter.send(message);
                return;
            }
            debug!(correlation_id = %correlation_id, "no waiter for correlated message");
        }

        if let Some(bus) = self.subscribers.get(&message.message_type) {
            bus.emit(&message);
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        self.set_state(ConnectionState::Reconnecting);

        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnect_attempts {
                warn!(
                    attempts = attempt - 1,
                    "reconnection budget exhausted, giving up"
                );
                self.lifecycle
                    .emit(&TransportEvent::ReconnectFailed { attempts: attempt - 1 });
                self.auto_reconnect.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            let delay = backoff_delay(&self.config, attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;

            if !self.auto_reconnect.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            self.set_state(ConnectionState::Connecting);
            let url = match self.endpoint_url() {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "endpoint url is invalid, giving up");
                    self.auto_reconnect.store(false, Ordering::SeqCst);
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            };
            match self.connector.connect(&url).await {
                Ok(handle) => {
                    self.install(handle);
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnection attempt failed");
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if *state == next {
                return;
            }
            *state = next;
        }
        self.lifecycle.emit(&TransportEvent::StateChanged(next));
    }
}

/// Exponential backoff for the given 1-based attempt, capped at the
/// configured maximum
fn backoff_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let factor = config.backoff_multiplier.saturating_pow(attempt.saturating_sub(1));
    config
        .reconnect_base_delay
        .saturating_mul(factor.max(1))
        .min(config.reconnect_max_delay)
}
