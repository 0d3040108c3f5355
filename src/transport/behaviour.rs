//! Network behaviour for the gossipsub transport

use libp2p::{
    gossipsub::{self, MessageAuthenticity, ValidationMode},
    identify,
    identity::Keypair,
    mdns, ping,
    swarm::NetworkBehaviour,
    PeerId,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Protocol name announced via identify
pub const MESH_PROTOCOL: &str = "/agent-mesh/1.0.0";

/// The composed network behaviour
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MeshBehaviourEvent")]
pub struct MeshBehaviour {
    /// mDNS for local network discovery
    pub mdns: mdns::tokio::Behaviour,

    /// Gossipsub for pub/sub messaging
    pub gossipsub: gossipsub::Behaviour,

    /// Ping for connection health
    pub ping: ping::Behaviour,

    /// Identify for peer information exchange
    pub identify: identify::Behaviour,
}

/// Events emitted by the mesh behaviour
#[derive(Debug)]
pub enum MeshBehaviourEvent {
    Mdns(mdns::Event),
    Gossipsub(gossipsub::Event),
    Ping(ping::Event),
    Identify(identify::Event),
}

impl From<mdns::Event> for MeshBehaviourEvent {
    fn from(event: mdns::Event) -> Self {
        MeshBehaviourEvent::Mdns(event)
    }
}

impl From<gossipsub::Event> for MeshBehaviourEvent {
    fn from(event: gossipsub::Event) -> Self {
        MeshBehaviourEvent::Gossipsub(event)
    }
}

impl From<ping::Event> for MeshBehaviourEvent {
    fn from(event: ping::Event) -> Self {
        MeshBehaviourEvent::Ping(event)
    }
}

impl From<identify::Event> for MeshBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        MeshBehaviourEvent::Identify(event)
    }
}

impl MeshBehaviour {
    pub fn new(key: &Keypair) -> anyhow::Result<Self> {
        let local_peer_id = PeerId::from(key.public());

        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

        // Envelopes carry their own unique id, so content hashing dedupes retransmits
        let message_id_fn = |message: &gossipsub::Message| {
            let mut hasher = DefaultHasher::new();
            message.data.hash(&mut hasher);
            message.source.hash(&mut hasher);
            gossipsub::MessageId::from(hasher.finish().to_string())
        };

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(ValidationMode::Strict)
            .message_id_fn(message_id_fn)
            .build()
            .map_err(|e| anyhow::anyhow!("Gossipsub config error: {}", e))?;

        let gossipsub =
            gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossipsub_config)
                .map_err(|e| anyhow::anyhow!("Gossipsub error: {}", e))?;

        let ping = ping::Behaviour::new(ping::Config::new());

        let identify = identify::Behaviour::new(identify::Config::new(
            MESH_PROTOCOL.to_string(),
            key.public(),
        ));

        Ok(Self {
            mdns,
            gossipsub,
            ping,
            identify,
        })
    }
}
