//! Message protocol: kinds, envelope and the JSON wire codec
//!
//! Wire shape of an envelope:
//! `{kind, source, target|null, payload: {...}, timestamp: RFC 3339, priority: 1..=10, id}`

mod envelope;
mod payload;

pub(crate) use envelope::validate_priority;
pub use envelope::{Envelope, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};
pub use payload::{
    AgentLeave, CapabilityAnnouncement, DiscoveryQuery, HelpOffer, HelpWanted, Payload,
    SystemHealth, TechnicalExchange, TextMessage, EXCHANGE_HELPER_SELECTED,
    EXCHANGE_HELP_COMPLETED,
};

use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Enumerated message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    CapabilityAnnouncement,
    CapabilityResponse,
    DiscoveryRequest,
    HelpWanted,
    HelpResponse,
    TechnicalExchange,
    SystemHealth,
    AgentLeave,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Message,
        MessageKind::CapabilityAnnouncement,
        MessageKind::CapabilityResponse,
        MessageKind::DiscoveryRequest,
        MessageKind::HelpWanted,
        MessageKind::HelpResponse,
        MessageKind::TechnicalExchange,
        MessageKind::SystemHealth,
        MessageKind::AgentLeave,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::CapabilityAnnouncement => "capability_announcement",
            MessageKind::CapabilityResponse => "capability_response",
            MessageKind::DiscoveryRequest => "discovery_request",
            MessageKind::HelpWanted => "help_wanted",
            MessageKind::HelpResponse => "help_response",
            MessageKind::TechnicalExchange => "technical_exchange",
            MessageKind::SystemHealth => "system_health",
            MessageKind::AgentLeave => "agent_leave",
        }
    }

    /// Kinds the help coordinator consumes
    pub fn is_help(&self) -> bool {
        matches!(
            self,
            MessageKind::HelpWanted | MessageKind::HelpResponse | MessageKind::TechnicalExchange
        )
    }

    /// Kinds absorbed by the registry
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            MessageKind::CapabilityAnnouncement
                | MessageKind::CapabilityResponse
                | MessageKind::DiscoveryRequest
                | MessageKind::AgentLeave
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| MeshError::serialization(format!("unknown message kind: {}", s)))
    }
}

/// Encode an envelope to canonical JSON bytes
pub fn serialize(envelope: &Envelope) -> MeshResult<Vec<u8>> {
    if envelope.source.trim().is_empty() {
        return Err(MeshError::serialization("envelope source must not be empty"));
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&envelope.priority) {
        return Err(MeshError::serialization(format!(
            "priority {} outside [{}, {}]",
            envelope.priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }

    let wire = json!({
        "kind": envelope.kind().as_str(),
        "source": envelope.source,
        "target": envelope.target,
        "payload": envelope.payload.to_value()?,
        "timestamp": envelope.timestamp.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        "priority": envelope.priority,
        "id": envelope.id,
    });
    Ok(serde_json::to_vec(&wire)?)
}

/// Decode bytes into an envelope.
///
/// `kind` and `source` are required. Missing `target`, `payload`, `priority`
/// and `id` are defaulted; a missing or unparsable timestamp becomes "now".
pub fn deserialize(bytes: &[u8]) -> MeshResult<Envelope> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(mut obj) = value else {
        return Err(MeshError::serialization("envelope must be a JSON object"));
    };

    let kind = match obj.remove("kind") {
        Some(Value::String(s)) => s.parse::<MessageKind>()?,
        Some(other) => {
            return Err(MeshError::serialization(format!(
                "kind must be a string, got {}",
                other
            )))
        }
        None => return Err(MeshError::serialization("missing field: kind")),
    };

    let source = match obj.remove("source") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(Value::String(_)) => return Err(MeshError::serialization("source must not be empty")),
        Some(_) => return Err(MeshError::serialization("source must be a string")),
        None => return Err(MeshError::serialization("missing field: source")),
    };

    let target = match obj.remove("target") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => return Err(MeshError::serialization("target must be a string or null")),
    };

    let payload_value = match obj.remove("payload") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v,
    };
    let payload = Payload::from_value(kind, payload_value)?;

    let priority = match obj.remove("priority") {
        None | Some(Value::Null) => DEFAULT_PRIORITY,
        Some(v) => match v.as_i64() {
            Some(p) if (i64::from(MIN_PRIORITY)..=i64::from(MAX_PRIORITY)).contains(&p) => p as u8,
            _ => {
                return Err(MeshError::serialization(format!(
                    "priority must be an integer in [{}, {}], got {}",
                    MIN_PRIORITY, MAX_PRIORITY, v
                )))
            }
        },
    };

    let id = match obj.remove("id") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => Uuid::new_v4().to_string(),
    };

    let timestamp = obj
        .remove("timestamp")
        .and_then(|v| v.as_str().and_then(parse_timestamp))
        .unwrap_or_else(Utc::now);

    Ok(Envelope {
        source,
        target,
        payload,
        timestamp,
        priority,
        id,
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        let payload = Payload::HelpWanted(HelpWanted {
            request_id: "req-1".into(),
            required_capabilities: vec!["python".into()],
            description: "parse a csv".into(),
            timeout_minutes: 15,
            priority: 6,
            tags: vec!["data".into()],
            context: Map::new(),
            created_at: Some(Utc::now()),
        });
        Envelope::new("agent-a", payload)
            .unwrap()
            .with_target("agent-b")
            .with_priority(8)
            .unwrap()
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let env = sample();
        let bytes = serialize(&env).unwrap();
        let decoded = deserialize(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_missing_optional_fields_defaulted() {
        let bytes = br#"{"kind":"message","source":"a"}"#;
        let env = deserialize(bytes).unwrap();
        assert_eq!(env.kind(), MessageKind::Message);
        assert!(env.target.is_none());
        assert_eq!(env.priority, DEFAULT_PRIORITY);
        assert!(!env.id.is_empty());
        assert_eq!(env.payload, Payload::Message(TextMessage::default()));
    }

    #[test]
    fn test_bad_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let bytes = br#"{"kind":"message","source":"a","timestamp":"yesterday-ish"}"#;
        let env = deserialize(bytes).unwrap();
        assert!(env.timestamp >= before);
    }

    #[test]
    fn test_required_fields() {
        assert!(deserialize(br#"{"source":"a"}"#).is_err());
        assert!(deserialize(br#"{"kind":"message"}"#).is_err());
        assert!(deserialize(br#"{"kind":"message","source":""}"#).is_err());
    }

    #[test]
    fn test_structurally_invalid_input() {
        let cases: [&[u8]; 5] = [
            br#"{"kind":"carrier_pigeon","source":"a"}"#,
            br#"{"kind":"message","source":"a","payload":"text"}"#,
            br#"{"kind":"message","source":"a","priority":0}"#,
            br#"{"kind":"message","source":"a","priority":11}"#,
            br#"[1,2,3]"#,
        ];
        for bytes in cases {
            let err = deserialize(bytes).unwrap_err();
            assert!(matches!(err, MeshError::Serialization(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_serialize_rejects_out_of_range_priority() {
        let mut env = sample();
        env.priority = 42;
        assert!(matches!(serialize(&env), Err(MeshError::Serialization(_))));
    }

    #[test]
    fn test_kind_strings() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
