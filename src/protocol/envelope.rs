//! The typed message unit exchanged over the shared channel

use crate::error::{MeshError, MeshResult};
use crate::protocol::{MessageKind, Payload};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// A message on the wire. `target == None` means broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: String,
    pub target: Option<String>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub id: String,
}

impl Envelope {
    /// Create a broadcast envelope with default priority
    pub fn new(source: impl Into<String>, payload: Payload) -> MeshResult<Self> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(MeshError::validation("envelope source must not be empty"));
        }

        Ok(Self {
            source,
            target: None,
            payload,
            timestamp: Utc::now(),
            priority: DEFAULT_PRIORITY,
            id: Uuid::new_v4().to_string(),
        })
    }

    /// Address the envelope to a single agent
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        self.target = if target.is_empty() { None } else { Some(target) };
        self
    }

    pub fn with_priority(mut self, priority: u8) -> MeshResult<Self> {
        validate_priority(priority)?;
        self.priority = priority;
        Ok(self)
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Whether `agent_id` should process this envelope
    pub fn is_for(&self, agent_id: &str) -> bool {
        match &self.target {
            None => true,
            Some(target) => target == agent_id,
        }
    }
}

pub(crate) fn validate_priority(priority: u8) -> MeshResult<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(MeshError::validation(format!(
            "priority {} outside [{}, {}]",
            priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    Ok(())
}
