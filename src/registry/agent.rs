//! Agent capability descriptions and per-agent trust bookkeeping

use crate::error::{MeshError, MeshResult};
use crate::protocol::{CapabilityAnnouncement, MessageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Response time (seconds) considered optimal by the trust model
const OPTIMAL_RESPONSE_SECS: f64 = 5.0;
const RESPONSE_BONUS_PER_SEC: f64 = 0.01;
const RESPONSE_PENALTY_PER_SEC: f64 = 0.005;
const MIN_RESPONSE_FACTOR: f64 = 0.8;
/// Weight of a new sample in the running response-time average
const RESPONSE_AVERAGE_WEIGHT: f64 = 0.3;
const MIN_TIME_DECAY: f64 = 0.5;
const SECS_PER_DAY: f64 = 86_400.0;

const EXTRA_TAG_BONUS: f64 = 0.05;
const MAX_EXTRA_BONUS: f64 = 0.2;

/// Trim, lowercase and dedupe tags, dropping empty ones. Order of first occurrence is kept.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// How well `offered` covers `required`: overlap ratio plus a small bonus for
/// extra tags when there is any overlap. Range `[0.0, 1.2]`.
pub fn match_score(offered: &[String], required: &[String]) -> f64 {
    let required: HashSet<&str> = required.iter().map(String::as_str).collect();
    if required.is_empty() {
        return 1.0;
    }
    let offered: HashSet<&str> = offered.iter().map(String::as_str).collect();

    let overlap = offered.intersection(&required).count();
    if overlap == 0 {
        return 0.0;
    }
    let extra = offered.difference(&required).count();

    let base = overlap as f64 / required.len() as f64;
    let bonus = (EXTRA_TAG_BONUS * extra as f64).min(MAX_EXTRA_BONUS);
    (base + bonus).min(1.0 + MAX_EXTRA_BONUS)
}

/// Reachability of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Online,
    Busy,
    Offline,
    Unknown,
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AvailabilityStatus::Online => "online",
            AvailabilityStatus::Busy => "busy",
            AvailabilityStatus::Offline => "offline",
            AvailabilityStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What an agent advertises about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub specializations: Vec<String>,
    pub description: String,
    pub version: String,
    pub max_concurrent_tasks: u32,
    pub supported_message_types: Vec<MessageKind>,
}

impl AgentCapabilities {
    pub fn new<C, S>(
        agent_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = C>,
        specializations: impl IntoIterator<Item = S>,
    ) -> MeshResult<Self>
    where
        C: AsRef<str>,
        S: AsRef<str>,
    {
        let agent_id = agent_id.into().trim().to_string();
        if agent_id.is_empty() {
            return Err(MeshError::validation("agent id must not be empty"));
        }

        Ok(Self {
            agent_id,
            capabilities: normalize_tags(capabilities),
            specializations: normalize_tags(specializations),
            description: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_concurrent_tasks: 1,
            supported_message_types: MessageKind::ALL.to_vec(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: u32) -> MeshResult<Self> {
        if max == 0 {
            return Err(MeshError::validation("max concurrent tasks must be at least 1"));
        }
        self.max_concurrent_tasks = max;
        Ok(self)
    }

    pub fn with_supported_message_types(mut self, kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        let mut seen = HashSet::new();
        self.supported_message_types = kinds.into_iter().filter(|k| seen.insert(*k)).collect();
        self
    }

    /// Build from a wire announcement sent by `agent_id`. Unknown message kinds are skipped.
    pub fn from_announcement(agent_id: &str, announcement: &CapabilityAnnouncement) -> MeshResult<Self> {
        let kinds = announcement
            .supported_message_types
            .iter()
            .filter_map(|k| k.parse::<MessageKind>().ok());

        let caps = Self::new(
            agent_id,
            &announcement.capabilities,
            &announcement.specializations,
        )?
        .with_description(announcement.description.clone())
        .with_version(announcement.version.clone())
        .with_supported_message_types(kinds);

        caps.with_max_concurrent_tasks(announcement.max_concurrent_tasks.max(1))
    }

    pub fn to_announcement(&self) -> CapabilityAnnouncement {
        CapabilityAnnouncement {
            capabilities: self.capabilities.clone(),
            specializations: self.specializations.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            max_concurrent_tasks: self.max_concurrent_tasks,
            supported_message_types: self
                .supported_message_types
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
        }
    }
}

/// Registry entry for a known agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredAgent {
    pub capabilities: AgentCapabilities,
    pub status: AvailabilityStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub trust_score: f64,
    pub total_interactions: u64,
    pub successful_interactions: u64,
    pub failed_interactions: u64,
    /// Running average in seconds; meaningful once `response_samples > 0`
    pub average_response_time: f64,
    pub response_samples: u64,
    pub last_interaction: DateTime<Utc>,
    /// When idle decay last ran; decay never compounds over the same period twice
    pub last_decay_applied: Option<DateTime<Utc>>,
    pub decay_factor: f64,
}

impl DiscoveredAgent {
    pub fn new(capabilities: AgentCapabilities, now: DateTime<Utc>, initial_trust: f64, decay_factor: f64) -> Self {
        Self {
            capabilities,
            status: AvailabilityStatus::Online,
            first_seen: now,
            last_seen: now,
            trust_score: initial_trust.clamp(0.0, 1.0),
            total_interactions: 0,
            successful_interactions: 0,
            failed_interactions: 0,
            average_response_time: 0.0,
            response_samples: 0,
            last_interaction: now,
            last_decay_applied: None,
            decay_factor,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.capabilities.agent_id
    }

    /// Not OFFLINE and seen within `timeout_minutes` of `now`
    pub fn is_available_at(&self, now: DateTime<Utc>, timeout_minutes: u64) -> bool {
        if self.status == AvailabilityStatus::Offline {
            return false;
        }
        let elapsed_ms = (now - self.last_seen).num_milliseconds();
        i128::from(elapsed_ms) < i128::from(timeout_minutes) * 60_000
    }

    pub fn is_available(&self, timeout_minutes: u64) -> bool {
        self.is_available_at(Utc::now(), timeout_minutes)
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_interactions == 0 {
            return 0.0;
        }
        self.successful_interactions as f64 / self.total_interactions as f64
    }

    pub fn capability_match(&self, required: &[String]) -> f64 {
        match_score(&self.capabilities.capabilities, required)
    }

    pub fn specialization_match(&self, required: &[String]) -> f64 {
        match_score(&self.capabilities.specializations, required)
    }

    /// Record an interaction outcome and recompute trust.
    /// Negative response times count as zero; non-finite ones are ignored.
    pub fn update_trust_at(&mut self, success: bool, response_time: Option<f64>, now: DateTime<Utc>) {
        self.total_interactions += 1;
        if success {
            self.successful_interactions += 1;
        } else {
            self.failed_interactions += 1;
        }

        if let Some(sample) = response_time.filter(|t| t.is_finite()).map(|t| t.max(0.0)) {
            self.average_response_time = if self.response_samples == 0 {
                sample
            } else {
                RESPONSE_AVERAGE_WEIGHT * sample + (1.0 - RESPONSE_AVERAGE_WEIGHT) * self.average_response_time
            };
            self.response_samples += 1;
        }

        let days_since = days_between(self.last_interaction, now);
        let time_decay = if days_since <= 1.0 {
            1.0
        } else {
            self.decay_factor.powf(days_since).max(MIN_TIME_DECAY)
        };

        let trust = self.success_rate() * time_decay * self.response_time_factor();
        self.trust_score = clamp_unit(trust);
        self.last_interaction = now;
        self.last_decay_applied = None;
    }

    /// Bonus below the optimal response time, penalty above it
    fn response_time_factor(&self) -> f64 {
        if self.response_samples == 0 {
            return 1.0;
        }
        let avg = self.average_response_time;
        if avg <= OPTIMAL_RESPONSE_SECS {
            1.0 + RESPONSE_BONUS_PER_SEC * (OPTIMAL_RESPONSE_SECS - avg)
        } else {
            (1.0 - RESPONSE_PENALTY_PER_SEC * (avg - OPTIMAL_RESPONSE_SECS)).max(MIN_RESPONSE_FACTOR)
        }
    }

    /// Idle decay: multiply trust by `decay_factor^days` for the days elapsed
    /// since the later of the last interaction and the previous decay.
    /// Returns whether the score changed.
    pub fn apply_time_decay_at(&mut self, now: DateTime<Utc>) -> bool {
        let since = match self.last_decay_applied {
            Some(applied) if applied > self.last_interaction => applied,
            _ => self.last_interaction,
        };
        let days = days_between(since, now);
        if days <= 0.0 {
            return false;
        }

        let before = self.trust_score;
        self.trust_score = clamp_unit(before * self.decay_factor.powf(days));
        self.last_decay_applied = Some(now);
        self.trust_score != before
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let secs = (to - from).num_milliseconds() as f64 / 1000.0;
    (secs / SECS_PER_DAY).max(0.0)
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn agent(caps: &[&str]) -> DiscoveredAgent {
        let caps = AgentCapabilities::new("agent-a", caps, Vec::<String>::new()).unwrap();
        DiscoveredAgent::new(caps, Utc::now(), 0.5, 0.95)
    }

    #[test]
    fn test_normalize_tags() {
        let normalized = normalize_tags(["  Python ", "python", "", "Data_Analysis", "   "]);
        assert_eq!(normalized, tags(&["python", "data_analysis"]));
    }

    #[test]
    fn test_capabilities_validation() {
        assert!(AgentCapabilities::new("  ", ["a"], ["b"]).is_err());
        let caps = AgentCapabilities::new("a1", ["X"], ["Y"]).unwrap();
        assert!(caps.clone().with_max_concurrent_tasks(0).is_err());
        assert_eq!(caps.with_max_concurrent_tasks(4).unwrap().max_concurrent_tasks, 4);
    }

    #[test]
    fn test_announcement_round_trip() {
        let caps = AgentCapabilities::new("a1", ["Rust", "Go"], ["Compilers"])
            .unwrap()
            .with_description("builder")
            .with_supported_message_types([MessageKind::HelpWanted, MessageKind::HelpWanted]);
        let announcement = caps.to_announcement();
        assert_eq!(announcement.supported_message_types, vec!["help_wanted"]);

        let back = AgentCapabilities::from_announcement("a1", &announcement).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_match_score() {
        let required = tags(&["python", "data_analysis"]);
        assert_eq!(match_score(&required, &required), 1.0);
        assert_eq!(match_score(&tags(&["rust"]), &required), 0.0);
        assert_eq!(match_score(&tags(&["python"]), &required), 0.5);
        assert_eq!(match_score(&tags(&["rust"]), &[]), 1.0);

        let extra = match_score(&tags(&["python", "data_analysis", "pandas"]), &required);
        assert!(extra > 1.0 && extra <= 1.2);

        let many: Vec<String> = (0..20).map(|i| format!("tag{}", i)).chain(required.clone()).collect();
        assert!((match_score(&many, &required) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_trust_stays_in_range_for_extreme_inputs() {
        let mut a = agent(&["python"]);
        let now = Utc::now();
        for rt in [-100.0, 0.0, 1e12, f64::NAN, f64::INFINITY, 0.001] {
            a.update_trust_at(true, Some(rt), now);
            assert!((0.0..=1.0).contains(&a.trust_score), "trust {}", a.trust_score);
            a.update_trust_at(false, Some(rt), now);
            assert!((0.0..=1.0).contains(&a.trust_score), "trust {}", a.trust_score);
        }
        assert!(a.average_response_time >= 0.0);
    }

    #[test]
    fn test_successful_agent_outranks_failing_agent() {
        let now = Utc::now();
        let mut good = agent(&["python"]);
        let mut bad = agent(&["python"]);

        for _ in 0..10 {
            good.update_trust_at(true, Some(3.0), now);
        }
        for _ in 0..2 {
            good.update_trust_at(false, Some(3.0), now);
        }
        for _ in 0..2 {
            bad.update_trust_at(true, Some(3.0), now);
        }
        for _ in 0..10 {
            bad.update_trust_at(false, Some(3.0), now);
        }

        assert!((good.average_response_time - 3.0).abs() < 1e-9);
        assert!(good.trust_score > bad.trust_score);
        assert_eq!(good.total_interactions, 12);
        assert_eq!(bad.failed_interactions, 10);
    }

    #[test]
    fn test_running_average_weights_new_samples() {
        let mut a = agent(&[]);
        let now = Utc::now();
        a.update_trust_at(true, Some(10.0), now);
        assert_eq!(a.average_response_time, 10.0);
        a.update_trust_at(true, Some(0.0), now);
        assert!((a.average_response_time - 7.0).abs() < 1e-9);
        a.update_trust_at(true, None, now);
        assert_eq!(a.response_samples, 2);
    }

    #[test]
    fn test_slow_responses_are_penalised() {
        let now = Utc::now();
        let mut fast = agent(&[]);
        let mut slow = agent(&[]);
        fast.update_trust_at(true, Some(1.0), now);
        slow.update_trust_at(true, Some(500.0), now);
        assert_eq!(fast.trust_score, 1.0);
        assert!((slow.trust_score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_time_decay_after_long_gap() {
        let start = Utc::now();
        let mut a = agent(&[]);
        a.last_interaction = start;
        a.update_trust_at(true, None, start);
        assert_eq!(a.trust_score, 1.0);

        a.update_trust_at(true, None, start + Duration::days(30));
        // 0.95^30 ≈ 0.21, floored at 0.5
        assert!((a.trust_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_idle_decay_does_not_compound() {
        let start = Utc::now();
        let mut a = agent(&[]);
        a.trust_score = 1.0;
        a.last_interaction = start;

        assert!(a.apply_time_decay_at(start + Duration::days(1)));
        assert!((a.trust_score - 0.95).abs() < 1e-9);
        // Same instant again: nothing left to decay
        assert!(!a.apply_time_decay_at(start + Duration::days(1)));
        assert!(a.apply_time_decay_at(start + Duration::days(2)));
        assert!((a.trust_score - 0.95 * 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_availability() {
        let now = Utc::now();
        let mut a = agent(&[]);
        a.last_seen = now - Duration::minutes(2);
        assert!(a.is_available_at(now, 5));
        assert!(!a.is_available_at(now, 1));

        a.status = AvailabilityStatus::Offline;
        a.last_seen = now;
        assert!(!a.is_available_at(now, 5));
    }
}
