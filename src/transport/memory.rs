//! In-process pub/sub backend built on tokio broadcast channels

use super::{Frame, FrameKind, PubSubBackend};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered messages per channel before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 1024;

/// Frames buffered between the broker and a subscription loop
const SUBSCRIPTION_BUFFER: usize = 256;

static NAMED_BROKERS: Lazy<Mutex<HashMap<String, Arc<MemoryBroker>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Shared broker; every backend attached to the same broker sees the same channels
pub struct MemoryBroker {
    name: String,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    available: AtomicBool,
    published: AtomicU64,
}

impl MemoryBroker {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        })
    }

    /// Process-wide broker registered under `name` (created on first use)
    pub fn named(name: &str) -> Arc<Self> {
        let mut brokers = NAMED_BROKERS.lock().unwrap_or_else(|e| e.into_inner());
        brokers
            .entry(name.to_string())
            .or_insert_with(|| MemoryBroker::new(name))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Simulate an outage. Going unavailable closes every open subscription.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.clear();
            debug!("Memory broker {} unavailable, subscriptions closed", self.name);
        }
    }

    /// Number of messages accepted so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(channel).map(|s| s.receiver_count()).unwrap_or(0)
    }

    fn publish(&self, channel: &str, data: &[u8]) -> bool {
        if !self.is_available() {
            return false;
        }
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(channel) {
            // No receivers is not an error for pub/sub
            let _ = sender.send(data.to_vec());
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn subscribe(&self, channel: &str) -> Option<broadcast::Receiver<Vec<u8>>> {
        if !self.is_available() {
            return None;
        }
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Some(sender.subscribe())
    }
}

/// A connection to a [`MemoryBroker`]
pub struct MemoryBackend {
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryBackend {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Attach to the process-wide broker called `name`
    pub fn named(name: &str) -> Self {
        Self::new(MemoryBroker::named(name))
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.broker.is_available()
    }
}

#[async_trait]
impl PubSubBackend for MemoryBackend {
    async fn connect(&self, url: &str) -> bool {
        if !self.broker.is_available() {
            debug!("Memory broker {} refused connection ({})", self.broker.name(), url);
            return false;
        }
        self.connected.store(true, Ordering::SeqCst);
        true
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        for handle in forwarders.drain(..) {
            handle.abort();
        }
    }

    async fn publish(&self, channel: &str, data: &[u8]) -> bool {
        self.is_connected() && self.broker.publish(channel, data)
    }

    async fn subscribe(&self, channel: &str) -> Option<mpsc::Receiver<Frame>> {
        if !self.is_connected() {
            return None;
        }
        let mut source = self.broker.subscribe(channel)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();

        let handle = tokio::spawn(async move {
            if tx
                .send(Frame::control(FrameKind::Subscribe, channel.clone()))
                .await
                .is_err()
            {
                return;
            }
            loop {
                match source.recv().await {
                    Ok(data) => {
                        if tx.send(Frame::message(channel.clone(), data)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on {} lagged, {} messages dropped", channel, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx
                            .send(Frame::control(FrameKind::Unsubscribe, channel.clone()))
                            .await;
                        break;
                    }
                }
            }
        });

        let mut forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        forwarders.retain(|h| !h.is_finished());
        forwarders.push(handle);
        Some(rx)
    }

    async fn ping(&self) -> bool {
        self.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = MemoryBroker::new("test-publish");
        let a = MemoryBackend::new(broker.clone());
        let b = MemoryBackend::new(broker.clone());
        assert!(a.connect("memory://test-publish").await);
        assert!(b.connect("memory://test-publish").await);

        let mut rx = b.subscribe("chan").await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, FrameKind::Subscribe);

        assert!(a.publish("chan", b"hello").await);
        let frame = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame, Frame::message("chan", b"hello".to_vec()));
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let backend = MemoryBackend::new(MemoryBroker::new("test-unconnected"));
        assert!(!backend.publish("chan", b"x").await);
        assert!(backend.subscribe("chan").await.is_none());
        assert!(!backend.ping().await);
    }

    #[tokio::test]
    async fn test_outage_closes_subscriptions() {
        let broker = MemoryBroker::new("test-outage");
        let backend = MemoryBackend::new(broker.clone());
        assert!(backend.connect("memory://test-outage").await);
        let mut rx = backend.subscribe("chan").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, FrameKind::Subscribe);

        broker.set_available(false);
        let frame = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Unsubscribe);
        assert!(!backend.ping().await);
        assert!(!backend.connect("memory://test-outage").await);

        broker.set_available(true);
        assert!(backend.connect("memory://test-outage").await);
        assert!(backend.ping().await);
    }

    #[test]
    fn test_named_brokers_are_shared() {
        let a = MemoryBroker::named("shared-name");
        let b = MemoryBroker::named("shared-name");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
