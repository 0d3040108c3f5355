//! Per-kind payload structs carried inside an envelope

use crate::error::{MeshError, MeshResult};
use crate::protocol::MessageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form text message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    #[serde(default)]
    pub content: String,
    /// Any additional keys sent alongside the content
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TextMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            extra: Map::new(),
        }
    }
}

/// Capability advertisement (also used for targeted capability responses)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityAnnouncement {
    pub capabilities: Vec<String>,
    pub specializations: Vec<String>,
    pub description: String,
    pub version: String,
    pub max_concurrent_tasks: u32,
    pub supported_message_types: Vec<String>,
}

/// Request for agents matching a capability set to identify themselves.
/// An empty list asks every agent to answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryQuery {
    pub capabilities: Vec<String>,
}

/// Broadcast help request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelpWanted {
    pub request_id: String,
    pub required_capabilities: Vec<String>,
    pub description: String,
    pub timeout_minutes: u32,
    pub priority: u8,
    pub tags: Vec<String>,
    pub context: Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Offer to fulfil a help request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelpOffer {
    pub response_id: String,
    pub request_id: String,
    pub message: String,
    pub capabilities_offered: Vec<String>,
    pub estimated_time_minutes: u32,
    pub confidence_level: f64,
    pub additional_info: Map<String, Value>,
    pub response_time: Option<DateTime<Utc>>,
}

/// Exchange types used by the help lifecycle
pub const EXCHANGE_HELPER_SELECTED: &str = "helper_selected";
pub const EXCHANGE_HELP_COMPLETED: &str = "help_completed";

/// Point-to-point technical exchange between agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TechnicalExchange {
    pub exchange_type: String,
    pub request_id: Option<String>,
    pub content: String,
    pub data: Map<String, Value>,
}

/// Health report of an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemHealth {
    pub status: String,
    pub details: Map<String, Value>,
}

/// Agent is leaving the network
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLeave {
    pub reason: Option<String>,
}

/// Kind-tagged payload. The envelope kind is always derived from the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Message(TextMessage),
    CapabilityAnnouncement(CapabilityAnnouncement),
    CapabilityResponse(CapabilityAnnouncement),
    DiscoveryRequest(DiscoveryQuery),
    HelpWanted(HelpWanted),
    HelpResponse(HelpOffer),
    TechnicalExchange(TechnicalExchange),
    SystemHealth(SystemHealth),
    AgentLeave(AgentLeave),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Message(_) => MessageKind::Message,
            Payload::CapabilityAnnouncement(_) => MessageKind::CapabilityAnnouncement,
            Payload::CapabilityResponse(_) => MessageKind::CapabilityResponse,
            Payload::DiscoveryRequest(_) => MessageKind::DiscoveryRequest,
            Payload::HelpWanted(_) => MessageKind::HelpWanted,
            Payload::HelpResponse(_) => MessageKind::HelpResponse,
            Payload::TechnicalExchange(_) => MessageKind::TechnicalExchange,
            Payload::SystemHealth(_) => MessageKind::SystemHealth,
            Payload::AgentLeave(_) => MessageKind::AgentLeave,
        }
    }

    /// Encode as a JSON object
    pub fn to_value(&self) -> MeshResult<Value> {
        let value = match self {
            Payload::Message(p) => serde_json::to_value(p)?,
            Payload::CapabilityAnnouncement(p) | Payload::CapabilityResponse(p) => {
                serde_json::to_value(p)?
            }
            Payload::DiscoveryRequest(p) => serde_json::to_value(p)?,
            Payload::HelpWanted(p) => serde_json::to_value(p)?,
            Payload::HelpResponse(p) => serde_json::to_value(p)?,
            Payload::TechnicalExchange(p) => serde_json::to_value(p)?,
            Payload::SystemHealth(p) => serde_json::to_value(p)?,
            Payload::AgentLeave(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Decode the payload object for `kind`
    pub fn from_value(kind: MessageKind, value: Value) -> MeshResult<Self> {
        if !value.is_object() {
            return Err(MeshError::serialization(format!(
                "payload for {} must be an object",
                kind
            )));
        }

        let payload = match kind {
            MessageKind::Message => Payload::Message(serde_json::from_value(value)?),
            MessageKind::CapabilityAnnouncement => {
                Payload::CapabilityAnnouncement(serde_json::from_value(value)?)
            }
            MessageKind::CapabilityResponse => {
                Payload::CapabilityResponse(serde_json::from_value(value)?)
            }
            MessageKind::DiscoveryRequest => {
                Payload::DiscoveryRequest(serde_json::from_value(value)?)
            }
            MessageKind::HelpWanted => Payload::HelpWanted(serde_json::from_value(value)?),
            MessageKind::HelpResponse => Payload::HelpResponse(serde_json::from_value(value)?),
            MessageKind::TechnicalExchange => {
                Payload::TechnicalExchange(serde_json::from_value(value)?)
            }
            MessageKind::SystemHealth => Payload::SystemHealth(serde_json::from_value(value)?),
            MessageKind::AgentLeave => Payload::AgentLeave(serde_json::from_value(value)?),
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_follows_variant() {
        let payload = Payload::CapabilityResponse(CapabilityAnnouncement::default());
        assert_eq!(payload.kind(), MessageKind::CapabilityResponse);
        assert_eq!(
            Payload::HelpResponse(HelpOffer::default()).kind(),
            MessageKind::HelpResponse
        );
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = Payload::from_value(MessageKind::Message, json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, MeshError::Serialization(_)));
    }

    #[test]
    fn test_text_message_keeps_extra_keys() {
        let value = json!({"content": "hi", "mood": "curious"});
        let payload = Payload::from_value(MessageKind::Message, value.clone()).unwrap();
        match &payload {
            Payload::Message(msg) => {
                assert_eq!(msg.content, "hi");
                assert_eq!(msg.extra.get("mood"), Some(&json!("curious")));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(payload.to_value().unwrap(), value);
    }

    #[test]
    fn test_help_wanted_wire_shape() {
        let value = json!({
            "request_id": "r1",
            "required_capabilities": ["python"],
            "description": "need a hand",
            "timeout_minutes": 10,
            "priority": 7,
            "tags": ["urgent"],
            "context": {"repo": "x"},
            "created_at": "2026-01-01T00:00:00Z"
        });
        let payload = Payload::from_value(MessageKind::HelpWanted, value).unwrap();
        let Payload::HelpWanted(help) = payload else {
            panic!("expected help_wanted");
        };
        assert_eq!(help.request_id, "r1");
        assert_eq!(help.priority, 7);
        assert!(help.created_at.is_some());
    }

    #[test]
    fn test_missing_fields_default() {
        let payload = Payload::from_value(MessageKind::DiscoveryRequest, json!({})).unwrap();
        assert_eq!(payload, Payload::DiscoveryRequest(DiscoveryQuery::default()));
    }
}
