//! Transport foundation: a resilient wrapper around a shared pub/sub service
//!
//! Backends implement [`PubSubBackend`]; [`TransportManager`] adds retry with
//! exponential backoff, health monitoring, single-flight reconnection and
//! per-channel receive loops on top.

#[cfg(feature = "gossipsub")]
mod behaviour;
#[cfg(feature = "gossipsub")]
mod gossipsub;
mod manager;
mod memory;
mod url;

#[cfg(feature = "gossipsub")]
pub use gossipsub::GossipsubBackend;
pub use manager::{FrameHandler, TransportManager};
pub use memory::{MemoryBackend, MemoryBroker};
pub use url::{TransportScheme, TransportUrl};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of frame delivered by a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Subscription confirmed
    Subscribe,
    /// Payload published on the channel
    Message,
    /// Subscription ended
    Unsubscribe,
}

/// One unit delivered by a backend subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: String,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn message(channel: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Message,
            channel: channel.into(),
            data,
        }
    }

    pub fn control(kind: FrameKind, channel: impl Into<String>) -> Self {
        Self {
            kind,
            channel: channel.into(),
            data: Vec::new(),
        }
    }
}

/// Operations required from the underlying pub/sub store
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Open the connection described by `url`
    async fn connect(&self, url: &str) -> bool;

    async fn disconnect(&self);

    async fn publish(&self, channel: &str, data: &[u8]) -> bool;

    /// Start receiving frames for `channel`. `None` when not connected.
    async fn subscribe(&self, channel: &str) -> Option<mpsc::Receiver<Frame>>;

    async fn ping(&self) -> bool;
}

/// Build the backend a transport URL asks for
pub fn backend_for_url(url: &TransportUrl) -> anyhow::Result<Arc<dyn PubSubBackend>> {
    match url.scheme {
        TransportScheme::Memory => Ok(Arc::new(MemoryBackend::named(&url.topic))),
        #[cfg(feature = "gossipsub")]
        TransportScheme::Mesh => Ok(Arc::new(GossipsubBackend::new())),
        #[cfg(not(feature = "gossipsub"))]
        TransportScheme::Mesh => Err(anyhow::anyhow!(
            "mesh:// transport requires the 'gossipsub' feature. Rebuild with:\n  cargo build --release --features gossipsub"
        )),
    }
}

/// Connection state of a [`TransportManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
