//! Agent network client: one handle over transport, registry and help coordination

use crate::config::NetworkConfig;
use crate::coordinator::{
    HelpCoordinator, HelpOptions, HelpRequest, RankedResponse, RequestStatus, CoordinatorStats,
};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    self, AgentLeave, DiscoveryQuery, Envelope, MessageKind, Payload, TextMessage,
};
use crate::registry::{match_score, normalize_tags, AgentCapabilities, AgentMatch, AgentRegistry, RegistrySnapshot};
use crate::tasks::BackgroundTasks;
use crate::transport::{backend_for_url, FrameHandler, PubSubBackend, TransportManager, TransportUrl};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// User callback for inbound envelopes
pub type MessageHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Returned by [`AgentNetworkClient::register_message_handler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: HandlerId,
    kind: MessageKind,
    source: Option<String>,
    handler: MessageHandler,
}

/// Snapshot returned by [`AgentNetworkClient::get_network_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub agent_id: String,
    pub connection_status: String,
    pub reconnect_count: u64,
    pub registry: RegistrySnapshot,
    pub help: CoordinatorStats,
    pub message_handlers: usize,
    pub messages_received: u64,
}

/// Client for one agent on the network. Cheap to clone.
#[derive(Clone)]
pub struct AgentNetworkClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    capabilities: AgentCapabilities,
    config: NetworkConfig,
    transport: TransportManager,
    registry: AgentRegistry,
    coordinator: HelpCoordinator,
    handlers: Mutex<Vec<HandlerEntry>>,
    next_handler_id: AtomicU64,
    tasks: BackgroundTasks,
    connected: AtomicBool,
    received: AtomicU64,
}

impl AgentNetworkClient {
    /// Build a client whose backend is chosen from `config.transport.url`
    pub fn new(capabilities: AgentCapabilities, config: NetworkConfig) -> MeshResult<Self> {
        config.validate()?;
        let url = TransportUrl::parse(&config.transport.url)?;
        let backend = backend_for_url(&url).map_err(|e| MeshError::Config(e.to_string()))?;
        Ok(Self::with_backend(capabilities, config, backend))
    }

    pub fn with_backend(
        capabilities: AgentCapabilities,
        config: NetworkConfig,
        backend: Arc<dyn PubSubBackend>,
    ) -> Self {
        let transport = TransportManager::new(backend, config.transport.clone());
        let registry = AgentRegistry::new(config.registry.clone());
        let coordinator = HelpCoordinator::new(
            capabilities.agent_id.clone(),
            config.coordinator.clone(),
            transport.clone(),
            registry.clone(),
        );

        Self {
            inner: Arc::new(ClientInner {
                capabilities,
                config,
                transport,
                registry,
                coordinator,
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                tasks: BackgroundTasks::new(),
                connected: AtomicBool::new(false),
                received: AtomicU64::new(0),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.capabilities.agent_id
    }

    pub fn capabilities(&self) -> &AgentCapabilities {
        &self.inner.capabilities
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &TransportManager {
        &self.inner.transport
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn coordinator(&self) -> &HelpCoordinator {
        &self.inner.coordinator
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Transport, registry, coordinator, channel subscription, then announce ourselves
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        let inner = &self.inner;

        if !inner.transport.connect().await {
            error!("{} could not connect to {}", self.agent_id(), inner.config.transport.url);
            return false;
        }
        inner.registry.start();
        inner.coordinator.start();

        let weak = Arc::downgrade(&self.inner);
        let handler: FrameHandler = Arc::new(move |data: Vec<u8>| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    AgentNetworkClient { inner }.dispatch(&data).await;
                }
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        });
        if !inner
            .transport
            .subscribe_to_channel(&inner.config.transport.channel, handler)
            .await
        {
            error!("{} could not subscribe to {}", self.agent_id(), inner.config.transport.channel);
            self.teardown().await;
            return false;
        }

        inner.connected.store(true, Ordering::SeqCst);
        self.announce_presence().await;
        self.broadcast_discovery(&[] as &[String]).await;
        self.start_loops();

        info!(
            "{} joined {} on {}",
            self.agent_id(),
            inner.config.transport.channel,
            inner.config.transport.url
        );
        true
    }

    fn start_loops(&self) {
        let client = &self.inner.config.client;

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .spawn_periodic("presence", client.presence_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = upgrade(&weak) {
                        AgentNetworkClient { inner }.announce_presence().await;
                    }
                }
            });

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .spawn_periodic("discovery", client.discovery_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = upgrade(&weak) {
                        AgentNetworkClient { inner }
                            .broadcast_discovery(&[] as &[String])
                            .await;
                    }
                }
            });
    }

    /// Say goodbye, stop background work and close the transport
    pub async fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let leave = Payload::AgentLeave(AgentLeave {
            reason: Some("disconnect".to_string()),
        });
        if !self.publish(leave, None).await {
            debug!("Leave notice not delivered");
        }
        self.teardown().await;
        info!("{} left the network", self.agent_id());
    }

    async fn teardown(&self) {
        let grace = self.inner.config.client.shutdown_grace();
        self.inner.tasks.shutdown(grace).await;
        self.inner.coordinator.stop(grace).await;
        self.inner.registry.stop(grace).await;
        self.inner.transport.disconnect().await;
    }

    async fn publish(&self, payload: Payload, target: Option<&str>) -> bool {
        match Envelope::new(self.agent_id(), payload) {
            Ok(envelope) => {
                let envelope = match target {
                    Some(target) => envelope.with_target(target),
                    None => envelope,
                };
                self.inner.transport.send(&envelope).await
            }
            Err(e) => {
                warn!("Could not build envelope: {}", e);
                false
            }
        }
    }

    /// Broadcast our capabilities
    pub async fn announce_presence(&self) -> bool {
        let announcement = self.inner.capabilities.to_announcement();
        let sent = self
            .publish(Payload::CapabilityAnnouncement(announcement), None)
            .await;
        if sent {
            debug!("{} announced presence", self.agent_id());
        }
        sent
    }

    async fn broadcast_discovery<S: AsRef<str>>(&self, capabilities: &[S]) -> bool {
        let query = DiscoveryQuery {
            capabilities: normalize_tags(capabilities),
        };
        self.publish(Payload::DiscoveryRequest(query), None).await
    }

    /// Send any payload, broadcast when `target` is `None`
    pub async fn send_message(&self, payload: Payload, target: Option<&str>, priority: u8) -> MeshResult<bool> {
        let mut envelope = Envelope::new(self.agent_id(), payload)?.with_priority(priority)?;
        if let Some(target) = target {
            envelope = envelope.with_target(target);
        }
        Ok(self.inner.transport.send(&envelope).await)
    }

    pub async fn send_simple_message(&self, content: &str, target: Option<&str>) -> MeshResult<bool> {
        self.send_message(
            Payload::Message(TextMessage::new(content)),
            target,
            protocol::DEFAULT_PRIORITY,
        )
        .await
    }

    /// Ask matching agents to identify themselves and return the ones already known
    pub async fn discover_agents<S: AsRef<str>>(&self, capabilities: &[S]) -> Vec<AgentMatch> {
        if !self.broadcast_discovery(capabilities).await {
            debug!("Discovery request not delivered");
        }
        self.inner.registry.find_by_capabilities(capabilities, false).await
    }

    /// Best available agents for `capabilities`, at most `max`
    pub async fn find_best_agents<S: AsRef<str>>(&self, capabilities: &[S], max: usize) -> Vec<AgentMatch> {
        let mut found = self.inner.registry.find_by_capabilities(capabilities, false).await;
        found.retain(|m| m.agent.agent_id() != self.agent_id());
        found.truncate(max);
        found
    }

    pub async fn request_help<S: AsRef<str>>(
        &self,
        required_capabilities: &[S],
        description: &str,
        options: HelpOptions,
    ) -> MeshResult<Option<String>> {
        self.inner
            .coordinator
            .request_help(required_capabilities, description, options)
            .await
    }

    pub async fn respond_to_help<S: AsRef<str>>(
        &self,
        request_id: &str,
        message: &str,
        capabilities_offered: &[S],
        estimated_time_minutes: u32,
        confidence: f64,
    ) -> MeshResult<Option<String>> {
        self.inner
            .coordinator
            .respond_to_help(
                request_id,
                message,
                capabilities_offered,
                estimated_time_minutes,
                confidence,
            )
            .await
    }

    pub async fn select_helper(&self, request_id: &str, responder_id: &str) -> bool {
        self.inner.coordinator.select_helper(request_id, responder_id).await
    }

    pub async fn complete_help_request(&self, request_id: &str, success: bool, message: Option<String>) -> bool {
        self.inner
            .coordinator
            .complete_help_request(request_id, success, message)
            .await
    }

    pub async fn best_responses(&self, request_id: &str, max: usize) -> Vec<RankedResponse> {
        self.inner.coordinator.best_responses(request_id, max).await
    }

    pub async fn get_help_requests(&self, status: Option<RequestStatus>) -> Vec<HelpRequest> {
        self.inner.coordinator.get_help_requests(status).await
    }

    pub async fn get_my_requests(&self) -> Vec<HelpRequest> {
        self.inner.coordinator.get_my_requests().await
    }

    /// Call `handler` for every inbound envelope of `kind`, optionally only from `source`
    pub fn register_message_handler<F, Fut>(&self, kind: MessageKind, source: Option<&str>, handler: F) -> HandlerId
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst));
        let handler: MessageHandler = Arc::new(move |envelope| handler(envelope).boxed());
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.push(HandlerEntry {
            id,
            kind,
            source: source.map(str::to_string),
            handler,
        });
        id
    }

    pub fn unregister_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    pub async fn get_network_stats(&self) -> NetworkStats {
        let message_handlers = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        NetworkStats {
            agent_id: self.agent_id().to_string(),
            connection_status: self.inner.transport.status().to_string(),
            reconnect_count: self.inner.transport.reconnect_count(),
            registry: self.inner.registry.stats().await,
            help: self.inner.coordinator.stats().await,
            message_handlers,
            messages_received: self.inner.received.load(Ordering::SeqCst),
        }
    }

    /// Route one inbound frame
    async fn dispatch(&self, data: &[u8]) {
        let envelope = match protocol::deserialize(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return;
            }
        };
        let me = self.agent_id();
        if envelope.source == me {
            return;
        }
        if !envelope.is_for(me) {
            debug!("Skipping {} addressed to {:?}", envelope.kind(), envelope.target);
            return;
        }
        self.inner.received.fetch_add(1, Ordering::SeqCst);
        debug!("{} from {}", envelope.kind(), envelope.source);

        let source = envelope.source.as_str();
        let registry = &self.inner.registry;
        let coordinator = &self.inner.coordinator;
        registry.touch(source).await;

        match &envelope.payload {
            Payload::CapabilityAnnouncement(announcement) | Payload::CapabilityResponse(announcement) => {
                registry.handle_announcement(source, announcement).await;
            }
            Payload::DiscoveryRequest(query) => {
                if self.matches_query(query) {
                    let announcement = self.inner.capabilities.to_announcement();
                    if !self
                        .publish(Payload::CapabilityResponse(announcement), Some(source))
                        .await
                    {
                        debug!("Capability response to {} not delivered", source);
                    }
                }
            }
            Payload::AgentLeave(leave) => {
                info!(
                    "{} left the network ({})",
                    source,
                    leave.reason.as_deref().unwrap_or("no reason")
                );
                registry.mark_offline(source).await;
            }
            Payload::HelpWanted(wanted) => {
                coordinator.handle_help_wanted(source, wanted).await;
            }
            Payload::HelpResponse(offer) => {
                coordinator.handle_help_response(source, offer).await;
            }
            Payload::TechnicalExchange(exchange) => {
                coordinator.handle_technical_exchange(source, exchange).await;
            }
            Payload::Message(_) | Payload::SystemHealth(_) => {}
        }

        self.run_handlers(envelope);
    }

    fn matches_query(&self, query: &DiscoveryQuery) -> bool {
        let required = normalize_tags(&query.capabilities);
        required.is_empty() || match_score(&self.inner.capabilities.capabilities, &required) > 0.0
    }

    /// Each handler runs in its own task; failures are logged and isolated
    fn run_handlers(&self, envelope: Envelope) {
        let kind = envelope.kind();
        let matching: Vec<MessageHandler> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.kind == kind)
            .filter(|h| h.source.as_deref().map_or(true, |s| s == envelope.source))
            .map(|h| h.handler.clone())
            .collect();

        for handler in matching {
            let envelope = envelope.clone();
            tokio::spawn(async move {
                let id = envelope.id.clone();
                match AssertUnwindSafe(async move { handler(envelope).await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Message handler failed on {} {}: {}", kind, id, e),
                    Err(_) => error!("Message handler panicked on {} {}", kind, id),
                }
            });
        }
    }
}

fn upgrade(weak: &Weak<ClientInner>) -> Option<Arc<ClientInner>> {
    weak.upgrade()
        .filter(|inner| inner.connected.load(Ordering::SeqCst))
}
