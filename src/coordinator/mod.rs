//! Help request coordination
//!
//! Tracks requests this agent raised and requests seen from other agents,
//! collects and ranks offers, and feeds completion outcomes back into the
//! registry's trust scores. Timeouts are lazy: a request expires when it is
//! looked at after its deadline, and the periodic sweep marks the stragglers.

mod request;

pub use request::{
    HelpRequest, HelpResponse, RankedResponse, RequestStatus, MAX_TIMEOUT_MINUTES,
    MIN_TIMEOUT_MINUTES,
};

use crate::config::CoordinatorConfig;
use crate::error::{MeshError, MeshResult};
use crate::protocol::{
    Envelope, HelpOffer, HelpWanted, Payload, TechnicalExchange, DEFAULT_PRIORITY,
    EXCHANGE_HELPER_SELECTED, EXCHANGE_HELP_COMPLETED,
};
use crate::registry::AgentRegistry;
use crate::tasks::BackgroundTasks;
use crate::transport::TransportManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Optional parameters of a help request
#[derive(Debug, Clone)]
pub struct HelpOptions {
    /// Falls back to the configured default when `None`
    pub timeout_minutes: Option<u32>,
    pub priority: u8,
    pub tags: Vec<String>,
    pub context: Map<String, Value>,
}

impl Default for HelpOptions {
    fn default() -> Self {
        Self {
            timeout_minutes: None,
            priority: DEFAULT_PRIORITY,
            tags: Vec::new(),
            context: Map::new(),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorSweep {
    pub timed_out: usize,
    pub purged: usize,
}

/// Request counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub total_requests: usize,
    pub my_requests: usize,
    pub assigned_to_me: usize,
    pub pending: usize,
    pub responded: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Default)]
struct CoordinatorState {
    requests: HashMap<String, HelpRequest>,
    /// Requests where this agent was selected as the helper
    assigned: HashSet<String>,
}

/// Help request lifecycle manager for one agent. Cheap to clone.
#[derive(Clone)]
pub struct HelpCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    agent_id: String,
    config: CoordinatorConfig,
    transport: TransportManager,
    registry: AgentRegistry,
    state: Mutex<CoordinatorState>,
    tasks: BackgroundTasks,
}

impl HelpCoordinator {
    pub fn new(
        agent_id: impl Into<String>,
        config: CoordinatorConfig,
        transport: TransportManager,
        registry: AgentRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                agent_id: agent_id.into(),
                config,
                transport,
                registry,
                state: Mutex::new(CoordinatorState::default()),
                tasks: BackgroundTasks::new(),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Start the periodic expiry sweep
    pub fn start(&self) {
        let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn_periodic(
            "help-sweep",
            self.inner.config.sweep_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let report = HelpCoordinator { inner }.sweep().await;
                        if report != CoordinatorSweep::default() {
                            debug!("Help sweep: {:?}", report);
                        }
                    }
                }
            },
        );
        debug!("Help coordinator started");
    }

    pub async fn stop(&self, grace: std::time::Duration) {
        self.inner.tasks.shutdown(grace).await;
        debug!("Help coordinator stopped");
    }

    fn envelope(&self, payload: Payload) -> MeshResult<Envelope> {
        Envelope::new(self.inner.agent_id.clone(), payload)
    }

    /// Broadcast a help request. `Ok(None)` when the broadcast could not be
    /// published; in that case nothing is kept.
    pub async fn request_help<S: AsRef<str>>(
        &self,
        required_capabilities: &[S],
        description: &str,
        options: HelpOptions,
    ) -> MeshResult<Option<String>> {
        let timeout = options
            .timeout_minutes
            .unwrap_or(self.inner.config.default_timeout_minutes);
        let request = HelpRequest::new(
            self.inner.agent_id.clone(),
            required_capabilities,
            description,
            timeout,
            options.priority,
        )?
        .with_tags(&options.tags)
        .with_context(options.context);

        let envelope = self
            .envelope(Payload::HelpWanted(request.to_wanted()))?
            .with_priority(request.priority)?;
        let request_id = request.request_id.clone();

        self.inner
            .state
            .lock()
            .await
            .requests
            .insert(request_id.clone(), request);

        if !self.inner.transport.send(&envelope).await {
            self.inner.state.lock().await.requests.remove(&request_id);
            warn!("Could not broadcast help request {}", request_id);
            return Ok(None);
        }

        info!("Requested help {} for {}", request_id, description);
        Ok(Some(request_id))
    }

    /// Offer help on a known request. `Ok(None)` when the request is unknown,
    /// finished, already answered by us, or the offer could not be sent.
    /// Fails with [`MeshError::Timeout`] once the request has expired.
    pub async fn respond_to_help<S: AsRef<str>>(
        &self,
        request_id: &str,
        message: &str,
        capabilities_offered: &[S],
        estimated_time_minutes: u32,
        confidence: f64,
    ) -> MeshResult<Option<String>> {
        let response = HelpResponse::new(
            self.inner.agent_id.clone(),
            request_id,
            message,
            capabilities_offered,
            estimated_time_minutes,
            confidence,
        )?;

        let requester = {
            let state = self.inner.state.lock().await;
            let Some(request) = state.requests.get(request_id) else {
                debug!("Cannot respond to unknown request {}", request_id);
                return Ok(None);
            };
            let now = Utc::now();
            if !request.status.is_terminal() && request.is_expired_at(now) {
                return Err(MeshError::Timeout(format!("help request {} has expired", request_id)));
            }
            if !request.accepts_response_from(&self.inner.agent_id, now) {
                debug!("Request {} no longer accepts our response ({})", request_id, request.status);
                return Ok(None);
            }
            request.requester_id.clone()
        };

        let envelope = self
            .envelope(Payload::HelpResponse(response.to_offer()))?
            .with_target(requester);
        if !self.inner.transport.send(&envelope).await {
            warn!("Could not send response to {}", request_id);
            return Ok(None);
        }

        let response_id = response.response_id.clone();
        let mut state = self.inner.state.lock().await;
        if let Some(request) = state.requests.get_mut(request_id) {
            request.add_response(response);
        }
        info!("Offered help on {}", request_id);
        Ok(Some(response_id))
    }

    /// Pick the helper for one of our requests and notify them
    pub async fn select_helper(&self, request_id: &str, responder_id: &str) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            let Some(request) = state.requests.get_mut(request_id) else {
                return false;
            };
            if request.requester_id != self.inner.agent_id || !request.select_responder(responder_id) {
                debug!("Cannot select {} for {} ({})", responder_id, request_id, request.status);
                return false;
            }
        }

        let notification = TechnicalExchange {
            exchange_type: EXCHANGE_HELPER_SELECTED.to_string(),
            request_id: Some(request_id.to_string()),
            content: format!("{} selected you for request {}", self.inner.agent_id, request_id),
            data: Map::new(),
        };
        let sent = match self.envelope(Payload::TechnicalExchange(notification)) {
            Ok(envelope) => self.inner.transport.send(&envelope.with_target(responder_id)).await,
            Err(e) => {
                warn!("Could not build selection notice: {}", e);
                false
            }
        };

        if !sent {
            let mut state = self.inner.state.lock().await;
            if let Some(request) = state.requests.get_mut(request_id) {
                request.revert_selection();
            }
            warn!("Could not notify {}, selection reverted", responder_id);
            return false;
        }

        info!("Selected {} to help with {}", responder_id, request_id);
        true
    }

    /// Finish one of our in-progress requests and report the outcome to the registry
    pub async fn complete_help_request(&self, request_id: &str, success: bool, message: Option<String>) -> bool {
        let (helper, elapsed) = {
            let mut state = self.inner.state.lock().await;
            let Some(request) = state.requests.get_mut(request_id) else {
                return false;
            };
            if request.requester_id != self.inner.agent_id || !request.complete(success, message.clone()) {
                debug!("Cannot complete {} ({})", request_id, request.status);
                return false;
            }
            (request.selected_responder.clone(), request.elapsed_secs())
        };

        let Some(helper) = helper else {
            return true;
        };
        if !self.inner.registry.update_trust(&helper, success, elapsed).await {
            debug!("Helper {} is not in the registry, trust not updated", helper);
        }

        let notification = TechnicalExchange {
            exchange_type: EXCHANGE_HELP_COMPLETED.to_string(),
            request_id: Some(request_id.to_string()),
            content: message.unwrap_or_default(),
            data: json!({ "success": success })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        };
        match self.envelope(Payload::TechnicalExchange(notification)) {
            Ok(envelope) => {
                if !self.inner.transport.send(&envelope.with_target(helper.clone())).await {
                    debug!("Completion notice to {} not delivered", helper);
                }
            }
            Err(e) => warn!("Could not build completion notice: {}", e),
        }

        info!(
            "Request {} {} by {}",
            request_id,
            if success { "completed" } else { "failed" },
            helper
        );
        true
    }

    /// Give up on one of our requests that has not finished yet
    pub async fn cancel_help_request(&self, request_id: &str, reason: Option<String>) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.requests.get_mut(request_id) {
            Some(request) if request.requester_id == self.inner.agent_id => {
                request.cancel_at(reason, Utc::now())
            }
            _ => false,
        }
    }

    /// Track a request broadcast by another agent
    pub async fn handle_help_wanted(&self, source: &str, wanted: &HelpWanted) -> bool {
        if source == self.inner.agent_id {
            return false;
        }
        let request = match HelpRequest::from_wanted(source, wanted) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring help request from {}: {}", source, e);
                return false;
            }
        };
        if request.is_expired() {
            debug!("Ignoring expired help request {}", request.request_id);
            return false;
        }

        let mut state = self.inner.state.lock().await;
        if state.requests.contains_key(&request.request_id) {
            return false;
        }
        info!(
            "{} needs help with [{}]: {}",
            source,
            request.required_capabilities.join(", "),
            request.description
        );
        state.requests.insert(request.request_id.clone(), request);
        true
    }

    /// Record an offer on a tracked request
    pub async fn handle_help_response(&self, source: &str, offer: &HelpOffer) -> bool {
        let response = match HelpResponse::from_offer(source, offer) {
            Ok(response) => response,
            Err(e) => {
                warn!("Ignoring help response from {}: {}", source, e);
                return false;
            }
        };

        let mut state = self.inner.state.lock().await;
        let Some(request) = state.requests.get_mut(&offer.request_id) else {
            debug!("Response from {} for unknown request {}", source, offer.request_id);
            return false;
        };
        let accepted = request.add_response_at(response, Utc::now());
        if accepted {
            info!(
                "{} offered help on {} (confidence {:.2})",
                source, offer.request_id, offer.confidence_level
            );
        } else {
            debug!("Rejected response from {} on {} ({})", source, offer.request_id, request.status);
        }
        accepted
    }

    /// React to selection and completion notices addressed to us
    pub async fn handle_technical_exchange(&self, source: &str, exchange: &TechnicalExchange) -> bool {
        let Some(request_id) = exchange.request_id.as_deref() else {
            return false;
        };
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let state = &mut *state;
        let Some(request) = state.requests.get_mut(request_id) else {
            return false;
        };
        if request.requester_id != source {
            debug!("{} is not the requester of {}", source, request_id);
            return false;
        }

        match exchange.exchange_type.as_str() {
            EXCHANGE_HELPER_SELECTED => {
                if !request.select_responder_at(&self.inner.agent_id, now) {
                    return false;
                }
                state.assigned.insert(request_id.to_string());
                info!("{} selected us to help with {}", source, request_id);
                true
            }
            EXCHANGE_HELP_COMPLETED => {
                let success = exchange
                    .data
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let message = (!exchange.content.is_empty()).then(|| exchange.content.clone());
                state.assigned.remove(request_id);
                let done = request.complete_at(success, message, now);
                info!("{} closed {} (success: {})", source, request_id, success);
                done
            }
            other => {
                debug!("Unhandled technical exchange {} from {}", other, source);
                false
            }
        }
    }

    pub async fn get_request(&self, request_id: &str) -> Option<HelpRequest> {
        self.inner.state.lock().await.requests.get(request_id).cloned()
    }

    /// Requests raised by other agents, optionally filtered by status; highest priority first
    pub async fn get_help_requests(&self, status: Option<RequestStatus>) -> Vec<HelpRequest> {
        let state = self.inner.state.lock().await;
        let mut requests: Vec<HelpRequest> = state
            .requests
            .values()
            .filter(|r| r.requester_id != self.inner.agent_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        sort_requests(&mut requests);
        requests
    }

    pub async fn get_my_requests(&self) -> Vec<HelpRequest> {
        let state = self.inner.state.lock().await;
        let mut requests: Vec<HelpRequest> = state
            .requests
            .values()
            .filter(|r| r.requester_id == self.inner.agent_id)
            .cloned()
            .collect();
        sort_requests(&mut requests);
        requests
    }

    /// Requests where we were picked as the helper and which are still open
    pub async fn assigned_requests(&self) -> Vec<HelpRequest> {
        let state = self.inner.state.lock().await;
        let mut requests: Vec<HelpRequest> = state
            .assigned
            .iter()
            .filter_map(|id| state.requests.get(id))
            .cloned()
            .collect();
        sort_requests(&mut requests);
        requests
    }

    pub async fn best_responses(&self, request_id: &str, max: usize) -> Vec<RankedResponse> {
        let state = self.inner.state.lock().await;
        state
            .requests
            .get(request_id)
            .map(|r| r.best_responses(max))
            .unwrap_or_default()
    }

    pub async fn sweep(&self) -> CoordinatorSweep {
        self.sweep_at(Utc::now()).await
    }

    /// Mark expired requests as timed out and purge requests past retention
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> CoordinatorSweep {
        let retention = self.inner.config.retention();
        let mut report = CoordinatorSweep::default();
        let mut state = self.inner.state.lock().await;
        let state = &mut *state;

        for request in state.requests.values_mut() {
            if request.mark_timeout_at(now) {
                report.timed_out += 1;
                info!("Help request {} timed out", request.request_id);
            }
        }

        let before = state.requests.len();
        state.requests.retain(|_, r| now - r.created_at <= retention);
        report.purged = before - state.requests.len();
        let requests = &state.requests;
        state.assigned.retain(|id| {
            requests
                .get(id)
                .is_some_and(|r| !r.status.is_terminal())
        });
        report
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let state = self.inner.state.lock().await;
        let mut stats = CoordinatorStats {
            total_requests: state.requests.len(),
            assigned_to_me: state.assigned.len(),
            ..Default::default()
        };
        for request in state.requests.values() {
            if request.requester_id == self.inner.agent_id {
                stats.my_requests += 1;
            }
            match request.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Responded => stats.responded += 1,
                RequestStatus::InProgress => stats.in_progress += 1,
                RequestStatus::Completed => stats.completed += 1,
                RequestStatus::Failed => stats.failed += 1,
                RequestStatus::Timeout => stats.timed_out += 1,
            }
        }
        stats
    }
}

fn sort_requests(requests: &mut [HelpRequest]) {
    requests.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}
