//! agent-mesh: agents discovering each other's capabilities and trading help
//! over a shared pub/sub channel.
//!
//! Layers, bottom up:
//! - [`transport`]: resilient pub/sub with backoff, health checks and reconnection
//! - [`protocol`]: typed envelopes and their JSON wire form
//! - [`registry`]: known agents, capability indexes and trust scores
//! - [`coordinator`]: the help request lifecycle
//! - [`client`]: one facade wiring the above together

pub mod client;
pub mod config;
pub mod config_loader;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod protocol;
pub mod registry;
pub mod tasks;
pub mod transport;

pub use client::{AgentNetworkClient, HandlerId, MessageHandler, NetworkStats};
pub use config::NetworkConfig;
pub use coordinator::{HelpCoordinator, HelpOptions, HelpRequest, HelpResponse, RequestStatus};
pub use error::{MeshError, MeshResult};
pub use protocol::{Envelope, MessageKind, Payload};
pub use registry::{AgentCapabilities, AgentMatch, AgentRegistry, AvailabilityStatus, DiscoveredAgent};
pub use transport::{ConnectionStatus, PubSubBackend, TransportManager};
