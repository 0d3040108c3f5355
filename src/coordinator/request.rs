//! Help request lifecycle and response ranking

use crate::error::{MeshError, MeshResult};
use crate::protocol::{validate_priority, HelpOffer, HelpWanted, DEFAULT_PRIORITY};
use crate::registry::{match_score, normalize_tags};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

pub const MIN_TIMEOUT_MINUTES: u32 = 1;
pub const MAX_TIMEOUT_MINUTES: u32 = 1440;

const CONFIDENCE_WEIGHT: f64 = 0.5;
const MATCH_WEIGHT: f64 = 0.4;
const RECENCY_WEIGHT: f64 = 0.1;
const MIN_RECENCY: f64 = 0.5;
const RECENCY_WINDOW_SECS: f64 = 3600.0;

/// ```text
/// PENDING -> RESPONDED -> IN_PROGRESS -> COMPLETED | FAILED
///    \___________\______________\______> TIMEOUT (once expired)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Responded,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Timeout
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Responded => "responded",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// An offer to fulfil a help request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelpResponse {
    pub response_id: String,
    pub responder_id: String,
    pub request_id: String,
    pub message: String,
    pub capabilities_offered: Vec<String>,
    pub estimated_time_minutes: u32,
    pub confidence: f64,
    pub response_time: DateTime<Utc>,
    pub additional_info: Map<String, Value>,
}

impl HelpResponse {
    pub fn new<S: AsRef<str>>(
        responder_id: impl Into<String>,
        request_id: impl Into<String>,
        message: impl Into<String>,
        capabilities_offered: &[S],
        estimated_time_minutes: u32,
        confidence: f64,
    ) -> MeshResult<Self> {
        let responder_id = responder_id.into();
        let request_id = request_id.into();
        if responder_id.trim().is_empty() {
            return Err(MeshError::validation("responder id must not be empty"));
        }
        if request_id.trim().is_empty() {
            return Err(MeshError::validation("request id must not be empty"));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(MeshError::validation(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }

        Ok(Self {
            response_id: Uuid::new_v4().to_string(),
            responder_id,
            request_id,
            message: message.into(),
            capabilities_offered: normalize_tags(capabilities_offered),
            estimated_time_minutes,
            confidence,
            response_time: Utc::now(),
            additional_info: Map::new(),
        })
    }

    /// Build from a wire offer. Confidence from the wire is clamped rather than rejected.
    pub fn from_offer(responder_id: &str, offer: &HelpOffer) -> MeshResult<Self> {
        let confidence = if offer.confidence_level.is_nan() {
            0.0
        } else {
            offer.confidence_level.clamp(0.0, 1.0)
        };
        let mut response = Self::new(
            responder_id,
            offer.request_id.clone(),
            offer.message.clone(),
            &offer.capabilities_offered,
            offer.estimated_time_minutes,
            confidence,
        )?;
        if !offer.response_id.is_empty() {
            response.response_id = offer.response_id.clone();
        }
        if let Some(at) = offer.response_time {
            response.response_time = at;
        }
        response.additional_info = offer.additional_info.clone();
        Ok(response)
    }

    pub fn to_offer(&self) -> HelpOffer {
        HelpOffer {
            response_id: self.response_id.clone(),
            request_id: self.request_id.clone(),
            message: self.message.clone(),
            capabilities_offered: self.capabilities_offered.clone(),
            estimated_time_minutes: self.estimated_time_minutes,
            confidence_level: self.confidence,
            additional_info: self.additional_info.clone(),
            response_time: Some(self.response_time),
        }
    }
}

/// A response together with its ranking score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResponse {
    pub response: HelpResponse,
    pub score: f64,
}

/// One help request and everything that happened to it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelpRequest {
    pub request_id: String,
    pub requester_id: String,
    pub required_capabilities: Vec<String>,
    pub description: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_minutes: u32,
    pub priority: u8,
    pub tags: Vec<String>,
    pub context: Map<String, Value>,
    pub responses: Vec<HelpResponse>,
    pub selected_responder: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub timed_out_at: Option<DateTime<Utc>>,
    pub outcome_message: Option<String>,
}

impl HelpRequest {
    pub fn new<S: AsRef<str>>(
        requester_id: impl Into<String>,
        required_capabilities: &[S],
        description: impl Into<String>,
        timeout_minutes: u32,
        priority: u8,
    ) -> MeshResult<Self> {
        let requester_id = requester_id.into();
        if requester_id.trim().is_empty() {
            return Err(MeshError::validation("requester id must not be empty"));
        }
        let required_capabilities = normalize_tags(required_capabilities);
        if required_capabilities.is_empty() {
            return Err(MeshError::validation("required capabilities must not be empty"));
        }
        let description = description.into().trim().to_string();
        if description.is_empty() {
            return Err(MeshError::validation("description must not be empty"));
        }
        if !(MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES).contains(&timeout_minutes) {
            return Err(MeshError::validation(format!(
                "timeout {} minutes outside [{}, {}]",
                timeout_minutes, MIN_TIMEOUT_MINUTES, MAX_TIMEOUT_MINUTES
            )));
        }
        validate_priority(priority)?;

        Ok(Self {
            request_id: Uuid::new_v4().to_string(),
            requester_id,
            required_capabilities,
            description,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            timeout_minutes,
            priority,
            tags: Vec::new(),
            context: Map::new(),
            responses: Vec::new(),
            selected_responder: None,
            responded_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            timed_out_at: None,
            outcome_message: None,
        })
    }

    pub fn with_tags<S: AsRef<str>>(mut self, tags: &[S]) -> Self {
        self.tags = normalize_tags(tags);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Track a request broadcast by another agent
    pub fn from_wanted(requester_id: &str, wanted: &HelpWanted) -> MeshResult<Self> {
        if wanted.request_id.trim().is_empty() {
            return Err(MeshError::validation("request id must not be empty"));
        }
        let priority = if wanted.priority == 0 {
            DEFAULT_PRIORITY
        } else {
            wanted.priority
        };
        let mut request = Self::new(
            requester_id,
            &wanted.required_capabilities,
            wanted.description.clone(),
            wanted.timeout_minutes,
            priority,
        )?
        .with_tags(&wanted.tags)
        .with_context(wanted.context.clone());
        request.request_id = wanted.request_id.clone();
        // A creation time ahead of our clock would keep the request alive forever
        if let Some(created_at) = wanted.created_at {
            request.created_at = created_at.min(request.created_at);
        }
        Ok(request)
    }

    pub fn to_wanted(&self) -> HelpWanted {
        HelpWanted {
            request_id: self.request_id.clone(),
            required_capabilities: self.required_capabilities.clone(),
            description: self.description.clone(),
            timeout_minutes: self.timeout_minutes,
            priority: self.priority,
            tags: self.tags.clone(),
            context: self.context.clone(),
            created_at: Some(self.created_at),
        }
    }

    /// `None` when the deadline is past the representable range
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .checked_add_signed(Duration::minutes(i64::from(self.timeout_minutes)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(true, |deadline| now >= deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn has_response_from(&self, responder_id: &str) -> bool {
        self.responses.iter().any(|r| r.responder_id == responder_id)
    }

    /// Whether a response from `responder_id` would be accepted at `now`
    pub fn accepts_response_from(&self, responder_id: &str, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && !self.is_expired_at(now)
            && responder_id != self.requester_id
            && !self.has_response_from(responder_id)
    }

    /// Append a response; the first one moves PENDING to RESPONDED
    pub fn add_response_at(&mut self, response: HelpResponse, now: DateTime<Utc>) -> bool {
        if response.request_id != self.request_id
            || !self.accepts_response_from(&response.responder_id, now)
        {
            return false;
        }
        self.responses.push(response);
        if self.status == RequestStatus::Pending {
            self.status = RequestStatus::Responded;
            self.responded_at = Some(now);
        }
        true
    }

    pub fn add_response(&mut self, response: HelpResponse) -> bool {
        self.add_response_at(response, Utc::now())
    }

    /// RESPONDED -> IN_PROGRESS with `responder_id` as the helper
    pub fn select_responder_at(&mut self, responder_id: &str, now: DateTime<Utc>) -> bool {
        if self.status != RequestStatus::Responded
            || self.is_expired_at(now)
            || !self.has_response_from(responder_id)
        {
            return false;
        }
        self.status = RequestStatus::InProgress;
        self.selected_responder = Some(responder_id.to_string());
        self.started_at = Some(now);
        true
    }

    pub fn select_responder(&mut self, responder_id: &str) -> bool {
        self.select_responder_at(responder_id, Utc::now())
    }

    /// Undo a selection whose notification could not be delivered
    pub fn revert_selection(&mut self) -> bool {
        if self.status != RequestStatus::InProgress {
            return false;
        }
        self.status = RequestStatus::Responded;
        self.selected_responder = None;
        self.started_at = None;
        true
    }

    /// IN_PROGRESS -> COMPLETED or FAILED
    pub fn complete_at(&mut self, success: bool, message: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status != RequestStatus::InProgress {
            return false;
        }
        if success {
            self.status = RequestStatus::Completed;
            self.completed_at = Some(now);
        } else {
            self.status = RequestStatus::Failed;
            self.failed_at = Some(now);
        }
        self.outcome_message = message;
        true
    }

    pub fn complete(&mut self, success: bool, message: Option<String>) -> bool {
        self.complete_at(success, message, Utc::now())
    }

    /// Abandon a request from any non-terminal state
    pub fn cancel_at(&mut self, reason: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = RequestStatus::Failed;
        self.failed_at = Some(now);
        self.outcome_message = reason;
        true
    }

    /// Non-terminal and expired -> TIMEOUT
    pub fn mark_timeout_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !self.is_expired_at(now) {
            return false;
        }
        self.status = RequestStatus::Timeout;
        self.timed_out_at = Some(now);
        true
    }

    pub fn mark_timeout(&mut self) -> bool {
        self.mark_timeout_at(Utc::now())
    }

    /// Seconds the selected helper spent on the request
    pub fn elapsed_secs(&self) -> Option<f64> {
        let finished = self.completed_at.or(self.failed_at)?;
        let started = self.started_at.unwrap_or(self.created_at);
        Some(((finished - started).num_milliseconds() as f64 / 1000.0).max(0.0))
    }

    pub fn response_score(&self, response: &HelpResponse) -> f64 {
        let since_created = (response.response_time - self.created_at).num_milliseconds() as f64 / 1000.0;
        let recency = (1.0 - since_created / RECENCY_WINDOW_SECS).clamp(MIN_RECENCY, 1.0);
        let matched = match_score(&response.capabilities_offered, &self.required_capabilities);
        response.confidence * CONFIDENCE_WEIGHT + matched * MATCH_WEIGHT + recency * RECENCY_WEIGHT
    }

    /// Responses ranked best first, at most `max`
    pub fn best_responses(&self, max: usize) -> Vec<RankedResponse> {
        let mut ranked: Vec<RankedResponse> = self
            .responses
            .iter()
            .map(|r| RankedResponse {
                score: self.response_score(r),
                response: r.clone(),
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.response.response_time.cmp(&b.response.response_time))
        });
        ranked.truncate(max);
        ranked
    }
}
