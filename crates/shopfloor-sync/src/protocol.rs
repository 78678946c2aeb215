//! # Wire Protocol
//!
//! Control message types and the tagged inbound event union.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Shopfloor Channel Messages                         │
//! │                                                                         │
//! │  SUBSCRIPTIONS                                                         │
//! │  ─────────────                                                         │
//! │  CLIENT ───► subscribe { eventType }                                   │
//! │  SERVER ───► subscription_confirmed { eventType }                      │
//! │  CLIENT ───► unsubscribe { eventType }                                 │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  Both   ◄──► ping { pingId }                                           │
//! │  Both   ◄──► pong { pingId }                                           │
//! │  SERVER ───► heartbeat                                                 │
//! │                                                                         │
//! │  BATCHING                                                              │
//! │  ────────                                                              │
//! │  Both   ◄──► batch { messages: [envelope, ...] }                       │
//! │                                                                         │
//! │  ENTITY OPERATIONS (offline queue replay)                              │
//! │  ────────────────────────────────────────                              │
//! │  CLIENT ───► entity_op { requestId, op, entityType, entityId, ... }    │
//! │  SERVER ───► entity_result { requestId, status, version, ... }         │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  SERVER ───► error { message, code }                                   │
//! │                                                                         │
//! │  Everything else is a domain event routed to subscribers.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format (JSON)
//! ```json
//! { "type": "oee_update", "data": { "lineId": "L1" }, "timestamp": 1718000000000,
//!   "id": "5f0c...-17", "priority": 3 }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shopfloor_core::{now_millis, Envelope};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Control Types
// =============================================================================

pub const HEARTBEAT: &str = "heartbeat";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const SUBSCRIPTION_CONFIRMED: &str = "subscription_confirmed";
pub const BATCH: &str = "batch";
pub const ERROR: &str = "error";
pub const ENTITY_OP: &str = "entity_op";
pub const ENTITY_RESULT: &str = "entity_result";

const CONTROL_TYPES: [&str; 8] = [
    HEARTBEAT,
    PING,
    PONG,
    SUBSCRIBE,
    UNSUBSCRIBE,
    SUBSCRIPTION_CONFIRMED,
    BATCH,
    ERROR,
];

/// True for protocol-level types that never reach subscribers as-is.
pub fn is_control_type(event_type: &str) -> bool {
    CONTROL_TYPES.contains(&event_type)
}

// =============================================================================
// Local Events
// =============================================================================

/// Socket state changed. `data`: the full `ConnectionStatus`.
pub const CONNECTION_STATE: &str = "connection:state";
/// Periodic health sample. `data`: `{ score, latencyMs, missedHeartbeats }`.
pub const CONNECTION_HEALTH: &str = "connection:health";
/// Reconnect attempts exhausted. `data`: `{ attempts, lastError }`.
pub const CONNECTION_ERROR: &str = "connection:error";
/// Conflict waiting for a decision. `data`: the `ConflictRecord`.
pub const SYNC_CONFLICT: &str = "sync:conflict";
/// Action reached `failed`. `data`: `{ actionId, entityType, entityId, error }`.
pub const SYNC_ACTION_FAILED: &str = "sync:action_failed";
/// Reconciler pass finished. `data`: the `PassReport`.
pub const SYNC_PASS_COMPLETE: &str = "sync:pass_complete";
/// Server sent an `error` envelope. `data`: `{ message, code }`.
pub const SERVER_ERROR: &str = "server:error";

const LOCAL_PREFIXES: [&str; 3] = ["connection:", "sync:", "server:"];

/// Local events are published in-process and never subscribed server side.
pub fn is_local_event(event_type: &str) -> bool {
    LOCAL_PREFIXES.iter().any(|p| event_type.starts_with(p))
}

// =============================================================================
// Inbound Events (Tagged Union)
// =============================================================================

/// A domain event as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub event_type: String,
    pub data: Value,
    pub id: Option<String>,
    pub timestamp: i64,
}

impl EventMessage {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        EventMessage {
            event_type: event_type.into(),
            data,
            id: None,
            timestamp: now_millis(),
        }
    }

    /// Reads a top-level payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|obj| obj.get(key))
    }
}

impl From<Envelope> for EventMessage {
    fn from(envelope: Envelope) -> Self {
        EventMessage {
            event_type: envelope.kind,
            data: envelope.data,
            id: envelope.id,
            timestamp: envelope.timestamp,
        }
    }
}

/// Every inbound frame decodes into exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Heartbeat,
    Ping { ping_id: Option<String> },
    Pong { ping_id: Option<String> },
    SubscriptionConfirmed { event_type: Option<String> },
    Batch(Vec<Envelope>),
    ServerError { message: String, code: Option<String> },
    Domain(EventMessage),
}

fn str_field(envelope: &Envelope, key: &str) -> Option<String> {
    envelope
        .field(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl InboundEvent {
    /// Decodes a raw text frame.
    pub fn parse(frame: &str) -> SyncResult<Self> {
        let envelope = Envelope::from_json(frame)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> SyncResult<Self> {
        let event = match envelope.kind.as_str() {
            HEARTBEAT => InboundEvent::Heartbeat,
            PING => InboundEvent::Ping {
                ping_id: str_field(&envelope, "pingId"),
            },
            PONG => InboundEvent::Pong {
                ping_id: str_field(&envelope, "pingId"),
            },
            SUBSCRIPTION_CONFIRMED => InboundEvent::SubscriptionConfirmed {
                event_type: str_field(&envelope, "eventType"),
            },
            BATCH => {
                let messages = envelope
                    .field("messages")
                    .cloned()
                    .ok_or_else(|| SyncError::InvalidMessage("batch without messages".into()))?;
                let messages: Vec<Envelope> = serde_json::from_value(messages)
                    .map_err(|e| SyncError::InvalidMessage(format!("bad batch entry: {}", e)))?;
                InboundEvent::Batch(messages)
            }
            ERROR => InboundEvent::ServerError {
                message: str_field(&envelope, "message")
                    .unwrap_or_else(|| "unspecified server error".to_string()),
                code: envelope.field("code").map(|c| match c {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            },
            SUBSCRIBE | UNSUBSCRIBE => {
                return Err(SyncError::UnexpectedMessageType {
                    expected: "server event".into(),
                    actual: envelope.kind,
                })
            }
            _ => InboundEvent::Domain(EventMessage::from(envelope)),
        };
        Ok(event)
    }
}

// =============================================================================
// Outbound Builders
// =============================================================================

pub fn ping(ping_id: &str) -> Envelope {
    Envelope::new(PING, json!({ "pingId": ping_id }))
}

pub fn pong(ping_id: Option<&str>) -> Envelope {
    Envelope::new(PONG, json!({ "pingId": ping_id }))
}

pub fn subscribe(event_type: &str) -> Envelope {
    Envelope::new(SUBSCRIBE, json!({ "eventType": event_type }))
}

pub fn unsubscribe(event_type: &str) -> Envelope {
    Envelope::new(UNSUBSCRIBE, json!({ "eventType": event_type }))
}

/// Wraps already-stamped envelopes into one `batch` frame.
pub fn batch(messages: &[Envelope]) -> SyncResult<Envelope> {
    let messages = serde_json::to_value(messages)?;
    Ok(Envelope::new(BATCH, json!({ "messages": messages })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfloor_core::Priority;

    #[test]
    fn test_parse_control_frames() {
        let ping = InboundEvent::parse(r#"{"type":"ping","data":{"pingId":"p-1"}}"#).unwrap();
        assert_eq!(
            ping,
            InboundEvent::Ping {
                ping_id: Some("p-1".into())
            }
        );

        let hb = InboundEvent::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(hb, InboundEvent::Heartbeat);

        let err = InboundEvent::parse(r#"{"type":"error","data":{"message":"nope","code":403}}"#)
            .unwrap();
        assert_eq!(
            err,
            InboundEvent::ServerError {
                message: "nope".into(),
                code: Some("403".into())
            }
        );
    }

    #[test]
    fn test_parse_batch_unwraps_messages() {
        let inner = Envelope::new("oee_update", json!({"lineId": "L1"})).with_priority(Priority::Low);
        let frame = batch(&[inner.clone(), inner]).unwrap().to_json().unwrap();

        match InboundEvent::parse(&frame).unwrap() {
            InboundEvent::Batch(messages) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].kind, "oee_update");
                assert_eq!(messages[0].priority, Some(Priority::Low));
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_domain_event_keeps_payload() {
        let event = InboundEvent::parse(
            r#"{"type":"andon_call","data":{"station":"S4"},"timestamp":42,"id":"x-1"}"#,
        )
        .unwrap();
        match event {
            InboundEvent::Domain(msg) => {
                assert_eq!(msg.event_type, "andon_call");
                assert_eq!(msg.field("station"), Some(&json!("S4")));
                assert_eq!(msg.timestamp, 42);
                assert_eq!(msg.id.as_deref(), Some("x-1"));
            }
            other => panic!("expected domain event, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        assert!(InboundEvent::parse("{not json").unwrap_err().is_protocol_error());
        assert!(InboundEvent::parse(r#"{"data":{}}"#).unwrap_err().is_protocol_error());
        assert!(InboundEvent::parse(r#"{"type":"batch","data":{}}"#)
            .unwrap_err()
            .is_protocol_error());
        assert!(InboundEvent::parse(r#"{"type":"subscribe","data":{}}"#)
            .unwrap_err()
            .is_protocol_error());
    }

    #[test]
    fn test_event_classification() {
        assert!(is_local_event(CONNECTION_STATE));
        assert!(is_local_event(SYNC_CONFLICT));
        assert!(!is_local_event("oee_update"));
        assert!(is_control_type(PING));
        assert!(!is_control_type(ENTITY_RESULT));
    }
}
