//! Connection management on top of a [`PubSubBackend`]

use super::{ConnectionStatus, FrameKind, PubSubBackend};
use crate::config::TransportConfig;
use crate::protocol::{self, Envelope};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked with the raw bytes of every message frame on a channel
pub type FrameHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Resilient connection to the shared pub/sub channel service. Cheap to clone.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn PubSubBackend>,
    config: TransportConfig,
    status: Mutex<ConnectionStatus>,
    /// Single-flight guard for the reconnection path
    reconnecting: AtomicBool,
    /// Set by an explicit disconnect; suppresses reconnection
    closed: AtomicBool,
    reconnect_count: AtomicU64,
    handlers: Mutex<HashMap<String, FrameHandler>>,
    receive_loops: Mutex<HashMap<String, JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportManager {
    pub fn new(backend: Arc<dyn PubSubBackend>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                status: Mutex::new(ConnectionStatus::Disconnected),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(true),
                reconnect_count: AtomicU64::new(0),
                handlers: Mutex::new(HashMap::new()),
                receive_loops: Mutex::new(HashMap::new()),
                health_task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Number of reconnection runs started so far
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnect_count.load(Ordering::SeqCst)
    }

    /// Connect with exponential backoff. Returns false once attempts are exhausted.
    pub async fn connect(&self) -> bool {
        if self.status() == ConnectionStatus::Connected {
            return true;
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        self.establish(ConnectionStatus::Connecting).await
    }

    async fn establish(&self, transitional: ConnectionStatus) -> bool {
        let config = &self.inner.config;
        self.set_status(transitional);

        for attempt in 1..=config.max_connect_attempts {
            if self.inner.closed.load(Ordering::SeqCst) {
                debug!("Connect aborted, transport was closed");
                self.set_status(ConnectionStatus::Disconnected);
                return false;
            }

            if self.inner.backend.connect(&config.url).await {
                self.set_status(ConnectionStatus::Connected);
                self.start_health_monitor();
                info!("Connected to {} (attempt {})", config.url, attempt);
                return true;
            }

            if attempt < config.max_connect_attempts {
                let delay = config.backoff_delay(attempt);
                warn!(
                    "Connect attempt {}/{} to {} failed, retrying in {:?}",
                    attempt, config.max_connect_attempts, config.url, delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        error!(
            "Giving up on {} after {} attempts",
            config.url, config.max_connect_attempts
        );
        self.set_status(ConnectionStatus::Failed);
        false
    }

    /// Close subscriptions and the connection. No reconnection happens afterwards.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.teardown().await;
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.set_status(ConnectionStatus::Disconnected);
        info!("Transport disconnected");
    }

    async fn teardown(&self) {
        if let Some(handle) = self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        let loops: Vec<JoinHandle<()>> = self
            .inner
            .receive_loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in loops {
            handle.abort();
        }
        self.inner.backend.disconnect().await;
    }

    /// Publish raw bytes. Never waits for reconnection: on failure the
    /// reconnection path is scheduled in the background and false is returned.
    pub async fn publish(&self, channel: &str, data: &[u8]) -> bool {
        match self.status() {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Disconnected => {
                debug!("Publish on {} while disconnected", channel);
                return false;
            }
            other => {
                debug!("Publish on {} while {}", channel, other);
                return false;
            }
        }

        if self.inner.backend.publish(channel, data).await {
            debug!("Published {} bytes on {}", data.len(), channel);
            true
        } else {
            warn!("Publish on {} failed, scheduling reconnect", channel);
            self.schedule_reconnect();
            false
        }
    }

    /// Serialize `envelope` and publish it on the configured channel
    pub async fn send(&self, envelope: &Envelope) -> bool {
        match protocol::serialize(envelope) {
            Ok(bytes) => self.publish(&self.inner.config.channel, &bytes).await,
            Err(e) => {
                warn!("Dropping {} envelope {}: {}", envelope.kind(), envelope.id, e);
                false
            }
        }
    }

    /// Start a receive loop for `channel`; only message frames reach `handler`.
    /// The subscription is restored automatically after a reconnect.
    pub async fn subscribe_to_channel(&self, channel: &str, handler: FrameHandler) -> bool {
        if !self.start_receive_loop(channel, handler.clone()).await {
            return false;
        }
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string(), handler);
        true
    }

    async fn start_receive_loop(&self, channel: &str, handler: FrameHandler) -> bool {
        let Some(mut rx) = self.inner.backend.subscribe(channel).await else {
            warn!("Subscribe to {} failed", channel);
            return false;
        };

        let channel_name = channel.to_string();
        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if frame.kind != FrameKind::Message {
                    debug!("{:?} frame on {}", frame.kind, frame.channel);
                    continue;
                }
                match AssertUnwindSafe(handler(frame.data)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Handler error on {}: {}", channel_name, e),
                    Err(_) => error!("Handler panicked on {}", channel_name),
                }
            }
            debug!("Receive loop for {} ended", channel_name);
        });

        let previous = self
            .inner
            .receive_loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string(), handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!("Subscribed to {}", channel);
        true
    }

    /// Connected and the backend answers a ping
    pub async fn is_healthy(&self) -> bool {
        self.status() == ConnectionStatus::Connected && self.inner.backend.ping().await
    }

    /// Run the reconnection path now. Returns false if another reconnection is
    /// already in flight or the connection could not be re-established.
    pub async fn reconnect(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in flight");
            return false;
        }
        let ok = self.run_reconnect().await;
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        ok
    }

    /// Fire-and-forget reconnect, at most one in flight
    fn schedule_reconnect(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in flight");
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.run_reconnect().await;
            this.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn run_reconnect(&self) -> bool {
        self.inner.reconnect_count.fetch_add(1, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Reconnecting);
        info!("Reconnecting to {}", self.inner.config.url);

        self.teardown().await;
        if !self.establish(ConnectionStatus::Reconnecting).await {
            return false;
        }

        let handlers: Vec<(String, FrameHandler)> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(c, h)| (c.clone(), h.clone()))
            .collect();
        for (channel, handler) in handlers {
            if !self.start_receive_loop(&channel, handler).await {
                warn!("Could not restore subscription to {}", channel);
            }
        }
        true
    }

    fn start_health_monitor(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.health_check_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = TransportManager { inner };
                if manager.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if !manager.inner.backend.ping().await {
                    warn!("Health check failed for {}", manager.inner.config.url);
                    manager.schedule_reconnect();
                    break;
                }
            }
        });

        let previous = self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
