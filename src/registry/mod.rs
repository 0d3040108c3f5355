//! Agent registry: who is on the network, what they can do and how far to trust them
//!
//! Entries are created from capability announcements and kept in two inverted
//! indices (capabilities and specializations). A periodic sweep applies idle
//! trust decay, marks silent agents offline and forgets agents that stayed
//! offline past the retention window.

mod agent;
mod index;

pub use agent::{match_score, normalize_tags, AgentCapabilities, AvailabilityStatus, DiscoveredAgent};
pub use index::CapabilityIndex;

use crate::config::RegistryConfig;
use crate::protocol::CapabilityAnnouncement;
use crate::tasks::BackgroundTasks;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentMatch {
    pub agent: DiscoveredAgent,
    pub match_score: f64,
}

/// Counters reported by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub decayed: usize,
    pub marked_offline: usize,
    pub removed: usize,
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub total_agents: usize,
    pub available_agents: usize,
    pub busy_agents: usize,
    pub offline_agents: usize,
    pub capability_tags: usize,
    pub specialization_tags: usize,
    pub average_trust: f64,
    pub total_interactions: u64,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, DiscoveredAgent>,
    capabilities: CapabilityIndex,
    specializations: CapabilityIndex,
}

impl RegistryState {
    fn remove(&mut self, agent_id: &str) -> Option<DiscoveredAgent> {
        let agent = self.agents.remove(agent_id)?;
        self.capabilities.remove(agent_id, &agent.capabilities.capabilities);
        self.specializations.remove(agent_id, &agent.capabilities.specializations);
        Some(agent)
    }
}

/// Shared agent registry. Cheap to clone.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    tasks: BackgroundTasks,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                state: Mutex::new(RegistryState::default()),
                tasks: BackgroundTasks::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Start the periodic decay/cleanup sweep
    pub fn start(&self) {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn_periodic(
            "registry-sweep",
            self.inner.config.cleanup_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let report = AgentRegistry { inner }.sweep().await;
                        if report != SweepReport::default() {
                            debug!("Registry sweep: {:?}", report);
                        }
                    }
                }
            },
        );
        debug!("Registry started");
    }

    pub async fn stop(&self, grace: std::time::Duration) {
        self.inner.tasks.shutdown(grace).await;
        debug!("Registry stopped");
    }

    /// Insert a new agent or update an existing one in place, refreshing both indices.
    /// A new agent is refused when the registry is full.
    pub async fn register_agent(&self, capabilities: AgentCapabilities) -> bool {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let state = &mut *state;
        let agent_id = capabilities.agent_id.clone();

        if let Some(existing) = state.agents.get_mut(&agent_id) {
            state.capabilities.replace(
                &agent_id,
                &existing.capabilities.capabilities,
                &capabilities.capabilities,
            );
            state.specializations.replace(
                &agent_id,
                &existing.capabilities.specializations,
                &capabilities.specializations,
            );
            existing.capabilities = capabilities;
            existing.last_seen = now;
            if existing.status != AvailabilityStatus::Busy {
                existing.status = AvailabilityStatus::Online;
            }
            debug!("Updated agent {}", agent_id);
            return true;
        }

        if state.agents.len() >= self.inner.config.max_agents {
            warn!(
                "Registry full ({} agents), ignoring {}",
                self.inner.config.max_agents, agent_id
            );
            return false;
        }

        state.capabilities.insert(&agent_id, &capabilities.capabilities);
        state.specializations.insert(&agent_id, &capabilities.specializations);
        let agent = DiscoveredAgent::new(
            capabilities,
            now,
            self.inner.config.initial_trust,
            self.inner.config.default_decay_factor,
        );
        info!(
            "Discovered agent {} ({})",
            agent_id,
            agent.capabilities.capabilities.join(", ")
        );
        state.agents.insert(agent_id, agent);
        true
    }

    /// Register from a wire announcement; invalid announcements are logged and dropped
    pub async fn handle_announcement(&self, source: &str, announcement: &CapabilityAnnouncement) -> bool {
        match AgentCapabilities::from_announcement(source, announcement) {
            Ok(capabilities) => self.register_agent(capabilities).await,
            Err(e) => {
                warn!("Ignoring announcement from {:?}: {}", source, e);
                false
            }
        }
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.inner.state.lock().await.remove(agent_id).is_some();
        if removed {
            info!("Unregistered agent {}", agent_id);
        }
        removed
    }

    pub async fn update_availability(&self, agent_id: &str, status: AvailabilityStatus) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.status = status;
                debug!("Agent {} is now {}", agent_id, status);
                true
            }
            None => false,
        }
    }

    pub async fn mark_offline(&self, agent_id: &str) -> bool {
        self.update_availability(agent_id, AvailabilityStatus::Offline).await
    }

    /// Refresh `last_seen` for a known agent; an offline agent that speaks is online again
    pub async fn touch(&self, agent_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_seen = Utc::now();
                if matches!(agent.status, AvailabilityStatus::Offline | AvailabilityStatus::Unknown) {
                    agent.status = AvailabilityStatus::Online;
                }
                true
            }
            None => false,
        }
    }

    /// Record an interaction outcome; `response_time` is in seconds
    pub async fn update_trust(&self, agent_id: &str, success: bool, response_time: Option<f64>) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.update_trust_at(success, response_time, Utc::now());
                debug!(
                    "Trust for {} now {:.3} ({}/{} successful)",
                    agent_id, agent.trust_score, agent.successful_interactions, agent.total_interactions
                );
                true
            }
            None => false,
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<DiscoveredAgent> {
        self.inner.state.lock().await.agents.get(agent_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Agents whose capabilities overlap `required`, best first.
    /// An empty requirement matches every agent.
    pub async fn find_by_capabilities<S: AsRef<str>>(&self, required: &[S], include_offline: bool) -> Vec<AgentMatch> {
        let required = normalize_tags(required);
        let state = self.inner.state.lock().await;
        self.search(&state, &state.capabilities, &required, include_offline, |agent, req| {
            agent.capability_match(req)
        })
    }

    pub async fn find_by_specializations<S: AsRef<str>>(&self, required: &[S], include_offline: bool) -> Vec<AgentMatch> {
        let required = normalize_tags(required);
        let state = self.inner.state.lock().await;
        self.search(&state, &state.specializations, &required, include_offline, |agent, req| {
            agent.specialization_match(req)
        })
    }

    fn search<F>(
        &self,
        state: &RegistryState,
        index: &CapabilityIndex,
        required: &[String],
        include_offline: bool,
        score: F,
    ) -> Vec<AgentMatch>
    where
        F: Fn(&DiscoveredAgent, &[String]) -> f64,
    {
        let now = Utc::now();
        let timeout = self.inner.config.agent_timeout_minutes;

        let candidates: Vec<&DiscoveredAgent> = if required.is_empty() {
            state.agents.values().collect()
        } else {
            index
                .candidates(required)
                .iter()
                .filter_map(|id| state.agents.get(id))
                .collect()
        };

        let mut matches: Vec<AgentMatch> = candidates
            .into_iter()
            .filter(|agent| include_offline || agent.is_available_at(now, timeout))
            .map(|agent| AgentMatch {
                match_score: score(agent, required),
                agent: agent.clone(),
            })
            .filter(|m| m.match_score > 0.0)
            .collect();

        matches.sort_by(|a, b| {
            b.match_score
                .total_cmp(&a.match_score)
                .then_with(|| b.agent.trust_score.total_cmp(&a.agent.trust_score))
                .then_with(|| compare_response_time(&a.agent, &b.agent))
        });
        matches
    }

    /// Available agents (or every agent with `include_offline`), most trusted first
    pub async fn get_available(&self, include_offline: bool) -> Vec<DiscoveredAgent> {
        let now = Utc::now();
        let timeout = self.inner.config.agent_timeout_minutes;
        let state = self.inner.state.lock().await;

        let mut agents: Vec<DiscoveredAgent> = state
            .agents
            .values()
            .filter(|a| include_offline || a.is_available_at(now, timeout))
            .cloned()
            .collect();
        agents.sort_by(|a, b| {
            b.trust_score
                .total_cmp(&a.trust_score)
                .then_with(|| a.agent_id().cmp(b.agent_id()))
        });
        agents
    }

    /// Apply idle decay to every agent; returns how many scores changed
    pub async fn apply_time_decay(&self) -> usize {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let mut changed = 0;
        for agent in state.agents.values_mut() {
            if agent.apply_time_decay_at(now) {
                changed += 1;
            }
        }
        changed
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Decay, mark silent agents offline and drop agents offline past retention
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let timeout = self.inner.config.agent_timeout_minutes;
        let retention = self.inner.config.offline_retention();
        let mut report = SweepReport::default();
        let mut state = self.inner.state.lock().await;

        let mut expired = Vec::new();
        for (id, agent) in state.agents.iter_mut() {
            if agent.apply_time_decay_at(now) {
                report.decayed += 1;
            }
            if agent.status != AvailabilityStatus::Offline && !agent.is_available_at(now, timeout) {
                agent.status = AvailabilityStatus::Offline;
                report.marked_offline += 1;
                debug!("Agent {} went silent, marking offline", id);
            }
            if agent.status == AvailabilityStatus::Offline && now - agent.last_seen > retention {
                expired.push(id.clone());
            }
        }

        for id in expired {
            if state.remove(&id).is_some() {
                report.removed += 1;
                info!("Removed agent {} after prolonged inactivity", id);
            }
        }
        report
    }

    pub async fn stats(&self) -> RegistrySnapshot {
        let now = Utc::now();
        let timeout = self.inner.config.agent_timeout_minutes;
        let state = self.inner.state.lock().await;

        let total = state.agents.len();
        let mut snapshot = RegistrySnapshot {
            total_agents: total,
            capability_tags: state.capabilities.tag_count(),
            specialization_tags: state.specializations.tag_count(),
            ..Default::default()
        };
        let mut trust_sum = 0.0;
        for agent in state.agents.values() {
            if agent.is_available_at(now, timeout) {
                snapshot.available_agents += 1;
            }
            match agent.status {
                AvailabilityStatus::Busy => snapshot.busy_agents += 1,
                AvailabilityStatus::Offline => snapshot.offline_agents += 1,
                _ => {}
            }
            trust_sum += agent.trust_score;
            snapshot.total_interactions += agent.total_interactions;
        }
        if total > 0 {
            snapshot.average_trust = trust_sum / total as f64;
        }
        snapshot
    }
}

/// Faster first; agents without measurements after measured ones
fn compare_response_time(a: &DiscoveredAgent, b: &DiscoveredAgent) -> Ordering {
    match (a.response_samples, b.response_samples) {
        (0, 0) => Ordering::Equal,
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        _ => a.average_response_time.total_cmp(&b.average_response_time),
    }
}
