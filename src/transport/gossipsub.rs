//! libp2p gossipsub backend: channels map to gossipsub topics

use super::behaviour::{MeshBehaviour, MeshBehaviourEvent};
use super::{Frame, FrameKind, PubSubBackend, TransportScheme, TransportUrl};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, TopicHash},
    identity::Keypair,
    mdns, noise,
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, Swarm,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/0";
const COMMAND_BUFFER: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 256;
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to the swarm event loop
enum Command {
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        channel: String,
        topic: String,
        sink: mpsc::Sender<Frame>,
        reply: oneshot::Sender<bool>,
    },
    Ping {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

struct Connection {
    url: TransportUrl,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Gossipsub-backed [`PubSubBackend`]
pub struct GossipsubBackend {
    connection: Mutex<Option<Connection>>,
}

impl GossipsubBackend {
    pub fn new() -> Self {
        Self {
            connection: Mutex::new(None),
        }
    }

    fn commands(&self) -> Option<(mpsc::Sender<Command>, TransportUrl)> {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| (c.commands.clone(), c.url.clone()))
    }

    fn build_swarm(url: &TransportUrl) -> anyhow::Result<Swarm<MeshBehaviour>> {
        let keypair = Keypair::generate_ed25519();

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                MeshBehaviour::new(key)
                    .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
            })?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen: Multiaddr = url
            .listen_addr
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDR)
            .parse()?;
        swarm.listen_on(listen)?;

        for addr_str in &url.bootstrap_peers {
            match addr_str.parse::<Multiaddr>() {
                Ok(addr) => {
                    info!("Dialing bootstrap peer: {}", addr);
                    if let Err(e) = swarm.dial(addr) {
                        warn!("Failed to dial bootstrap peer: {}", e);
                    }
                }
                Err(e) => warn!("Invalid bootstrap address {}: {}", addr_str, e),
            }
        }

        Ok(swarm)
    }
}

impl Default for GossipsubBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubBackend for GossipsubBackend {
    async fn connect(&self, url: &str) -> bool {
        let parsed = match TransportUrl::parse(url) {
            Ok(parsed) if parsed.scheme == TransportScheme::Mesh => parsed,
            Ok(_) => {
                warn!("Gossipsub backend cannot serve {}", url);
                return false;
            }
            Err(e) => {
                warn!("Invalid transport url {}: {}", url, e);
                return false;
            }
        };

        let swarm = match Self::build_swarm(&parsed) {
            Ok(swarm) => swarm,
            Err(e) => {
                warn!("Failed to start swarm: {}", e);
                return false;
            }
        };
        info!("Swarm started, PeerId: {}", swarm.local_peer_id());

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run_event_loop(swarm, rx));

        let previous = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Connection {
                url: parsed,
                commands: tx,
                task,
            });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        true
    }

    async fn disconnect(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(connection) = connection {
            let _ = connection.commands.send(Command::Shutdown).await;
            connection.task.abort();
        }
    }

    async fn publish(&self, channel: &str, data: &[u8]) -> bool {
        let Some((commands, url)) = self.commands() else {
            return false;
        };
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Publish {
            topic: url.topic_for(channel),
            data: data.to_vec(),
            reply,
        };
        if commands.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn subscribe(&self, channel: &str) -> Option<mpsc::Receiver<Frame>> {
        let (commands, url) = self.commands()?;
        let (sink, frames) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Subscribe {
            channel: channel.to_string(),
            topic: url.topic_for(channel),
            sink,
            reply,
        };
        commands.send(cmd).await.ok()?;
        match rx.await {
            Ok(true) => Some(frames),
            _ => None,
        }
    }

    async fn ping(&self) -> bool {
        let Some((commands, _)) = self.commands() else {
            return false;
        };
        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Ping { reply }).await.is_err() {
            return false;
        }
        matches!(tokio::time::timeout(PING_TIMEOUT, rx).await, Ok(Ok(true)))
    }
}

/// Drive the swarm and serve commands until shutdown
async fn run_event_loop(mut swarm: Swarm<MeshBehaviour>, mut commands: mpsc::Receiver<Command>) {
    let mut subscribers: HashMap<TopicHash, (String, Vec<mpsc::Sender<Frame>>)> = HashMap::new();

    loop {
        tokio::select! {
            event = swarm.select_next_some() => {
                handle_swarm_event(&mut swarm, event, &mut subscribers);
            }

            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Shutdown => {
                        info!("Shutting down swarm");
                        break;
                    }
                    Command::Publish { topic, data, reply } => {
                        let topic = IdentTopic::new(topic);
                        let ok = match swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
                            Ok(_) => true,
                            // Alone on the network: nobody to deliver to, not a transport failure
                            Err(gossipsub::PublishError::InsufficientPeers) => {
                                debug!("No peers subscribed to {}", topic);
                                true
                            }
                            Err(e) => {
                                warn!("Publish to {} failed: {:?}", topic, e);
                                false
                            }
                        };
                        let _ = reply.send(ok);
                    }
                    Command::Subscribe { channel, topic, sink, reply } => {
                        let topic = IdentTopic::new(topic);
                        let ok = match swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                            Ok(_) => {
                                let _ = sink.try_send(Frame::control(FrameKind::Subscribe, channel.clone()));
                                subscribers
                                    .entry(topic.hash())
                                    .or_insert_with(|| (channel.clone(), Vec::new()))
                                    .1
                                    .push(sink);
                                true
                            }
                            Err(e) => {
                                warn!("Subscribe to {} failed: {:?}", topic, e);
                                false
                            }
                        };
                        let _ = reply.send(ok);
                    }
                    Command::Ping { reply } => {
                        let _ = reply.send(true);
                    }
                }
            }
        }
    }

    for (_, (channel, sinks)) in subscribers.drain() {
        for sink in sinks {
            let _ = sink.try_send(Frame::control(FrameKind::Unsubscribe, channel.clone()));
        }
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<MeshBehaviour>,
    event: SwarmEvent<MeshBehaviourEvent>,
    subscribers: &mut HashMap<TopicHash, (String, Vec<mpsc::Sender<Frame>>)>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!("Listening on {}/p2p/{}", address, swarm.local_peer_id());
        }

        SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer_id, addr) in peers {
                debug!("Discovered peer via mDNS: {} at {}", peer_id, addr);
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }
        }

        SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
            for (peer_id, _) in peers {
                debug!("Peer expired: {}", peer_id);
                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
            }
        }

        SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => {
            if let Some((channel, sinks)) = subscribers.get_mut(&message.topic) {
                sinks.retain(|sink| !sink.is_closed());
                for sink in sinks.iter() {
                    if sink.try_send(Frame::message(channel.clone(), message.data.clone())).is_err() {
                        warn!("Subscriber on {} is full, dropping message", channel);
                    }
                }
            }
        }

        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            debug!("Connection established: {}", peer_id);
        }

        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            debug!("Connection closed: {}", peer_id);
        }

        _ => {}
    }
}
