//! Transport URL parsing
//!
//! Supports multiple formats:
//! - In-process broker: `memory://team` (default broker name `default`)
//! - Mesh URL: `mesh://my-project?peer=/ip4/1.2.3.4/tcp/4001/p2p/QmXxx&listen=/ip4/0.0.0.0/tcp/4001`
//! - Raw multiaddr: `/ip4/1.2.3.4/tcp/4001/p2p/QmXxx` (mesh transport, default topic)
//! - Bare name: `my-project` (mesh transport, LAN discovery via mDNS)

use crate::error::{MeshError, MeshResult};

const MEMORY_PREFIX: &str = "memory://";
const MESH_PREFIX: &str = "mesh://";

/// Default gossipsub topic / memory broker name
pub const DEFAULT_TOPIC: &str = "default";

/// Which backend a URL addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScheme {
    Memory,
    Mesh,
}

/// Configuration parsed from a transport URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUrl {
    pub scheme: TransportScheme,
    /// Broker name (memory) or gossipsub topic namespace (mesh)
    pub topic: String,
    /// Bootstrap/peer addresses to connect to
    pub bootstrap_peers: Vec<String>,
    /// Listen address override
    pub listen_addr: Option<String>,
}

impl TransportUrl {
    pub fn parse(value: &str) -> MeshResult<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(MeshError::Config("transport url must not be empty".into()));
        }

        // 1. In-process broker
        if let Some(name) = value.strip_prefix(MEMORY_PREFIX) {
            let name = name.trim_end_matches('/');
            return Ok(Self {
                scheme: TransportScheme::Memory,
                topic: if name.is_empty() { DEFAULT_TOPIC.to_string() } else { name.to_string() },
                bootstrap_peers: vec![],
                listen_addr: None,
            });
        }

        // 2. Mesh URL format: mesh://topic?peer=...
        if value.starts_with(MESH_PREFIX) {
            return Ok(Self::parse_mesh_url(value));
        }

        if value.contains("://") {
            return Err(MeshError::Config(format!("unsupported transport url: {}", value)));
        }

        // 3. Raw multiaddr: starts with /
        if value.starts_with('/') {
            return Ok(Self {
                scheme: TransportScheme::Mesh,
                topic: DEFAULT_TOPIC.to_string(),
                bootstrap_peers: vec![value.to_string()],
                listen_addr: None,
            });
        }

        // 4. Topic name
        Ok(Self {
            scheme: TransportScheme::Mesh,
            topic: value.to_string(),
            bootstrap_peers: vec![],
            listen_addr: None,
        })
    }

    /// Parse mesh:// URL format
    ///
    /// Format: `mesh://[topic]?peer=<multiaddr>&peer=<multiaddr2>&listen=<multiaddr>`
    fn parse_mesh_url(url: &str) -> Self {
        let url = url.strip_prefix(MESH_PREFIX).unwrap_or(url);

        // Split into path and query
        let (path, query) = url.split_once('?').unwrap_or((url, ""));

        let path = path.trim_end_matches('/');
        let topic = if path.is_empty() {
            DEFAULT_TOPIC.to_string()
        } else {
            path.to_string()
        };

        let mut bootstrap_peers = Vec::new();
        let mut listen_addr = None;

        for param in query.split('&') {
            if param.is_empty() {
                continue;
            }

            if let Some((key, value)) = param.split_once('=') {
                // URL decode the value (handles %2F for /)
                let decoded = urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string());
                match key {
                    "peer" | "bootstrap" => bootstrap_peers.push(decoded),
                    "listen" => listen_addr = Some(decoded),
                    _ => {}
                }
            }
        }

        Self {
            scheme: TransportScheme::Mesh,
            topic,
            bootstrap_peers,
            listen_addr,
        }
    }

    /// Build a shareable URL other agents can join with
    pub fn to_share_url(&self, peer_addrs: &[String]) -> String {
        match self.scheme {
            TransportScheme::Memory => format!("{}{}", MEMORY_PREFIX, self.topic),
            TransportScheme::Mesh => {
                let mut url = format!("{}{}", MESH_PREFIX, self.topic);
                if !peer_addrs.is_empty() {
                    let params: Vec<String> = peer_addrs
                        .iter()
                        .map(|addr| format!("peer={}", urlencoding::encode(addr)))
                        .collect();
                    url.push('?');
                    url.push_str(&params.join("&"));
                }
                url
            }
        }
    }

    /// Gossipsub topic for a logical channel
    pub fn topic_for(&self, channel: &str) -> String {
        format!("{}/{}", self.topic, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        let url = TransportUrl::parse("memory://team").unwrap();
        assert_eq!(url.scheme, TransportScheme::Memory);
        assert_eq!(url.topic, "team");

        let url = TransportUrl::parse("memory://").unwrap();
        assert_eq!(url.topic, DEFAULT_TOPIC);
    }

    #[test]
    fn test_parse_topic_only() {
        let url = TransportUrl::parse("my-project").unwrap();
        assert_eq!(url.scheme, TransportScheme::Mesh);
        assert_eq!(url.topic, "my-project");
        assert!(url.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_parse_multiaddr() {
        let addr = "/ip4/1.2.3.4/tcp/4001/p2p/12D3KooWTest";
        let url = TransportUrl::parse(addr).unwrap();
        assert_eq!(url.scheme, TransportScheme::Mesh);
        assert_eq!(url.topic, DEFAULT_TOPIC);
        assert_eq!(url.bootstrap_peers, vec![addr]);
    }

    #[test]
    fn test_parse_mesh_url_with_peers_and_listen() {
        let url = TransportUrl::parse(
            "mesh://team?peer=/ip4/1.2.3.4/tcp/4001/p2p/QmA&peer=/ip4/5.6.7.8/tcp/4001/p2p/QmB&listen=/ip4/0.0.0.0/tcp/4001",
        )
        .unwrap();
        assert_eq!(url.topic, "team");
        assert_eq!(url.bootstrap_peers.len(), 2);
        assert!(url.bootstrap_peers[1].contains("5.6.7.8"));
        assert_eq!(url.listen_addr.as_deref(), Some("/ip4/0.0.0.0/tcp/4001"));
    }

    #[test]
    fn test_parse_mesh_url_encoded() {
        let url =
            TransportUrl::parse("mesh://test?peer=%2Fip4%2F1.2.3.4%2Ftcp%2F4001%2Fp2p%2FQmTest")
                .unwrap();
        assert_eq!(url.bootstrap_peers, vec!["/ip4/1.2.3.4/tcp/4001/p2p/QmTest"]);
    }

    #[test]
    fn test_rejects_unknown_scheme_and_empty() {
        assert!(TransportUrl::parse("redis://localhost:6379").is_err());
        assert!(TransportUrl::parse("   ").is_err());
    }

    #[test]
    fn test_share_url_round_trip() {
        let url = TransportUrl::parse("mesh://my-project").unwrap();
        assert_eq!(url.to_share_url(&[]), "mesh://my-project");

        let addrs = vec!["/ip4/1.2.3.4/tcp/4001/p2p/QmTest".to_string()];
        let shared = url.to_share_url(&addrs);
        assert!(shared.starts_with("mesh://my-project?peer="));
        assert_eq!(TransportUrl::parse(&shared).unwrap().bootstrap_peers, addrs);
    }

    #[test]
    fn test_topic_for_channel() {
        let url = TransportUrl::parse("mesh://team").unwrap();
        assert_eq!(url.topic_for("agent-network"), "team/agent-network");
    }
}
