//! # Domain Types
//!
//! Wire envelope, priority lanes and connection status types.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Envelope     │   │    Priority     │   │ConnectionStatus │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  type           │   │  1 Critical     │   │  socket  ───────┼──┐    │
//! │  │  data (JSON)    │   │  2 High         │   │  network ───────┼─┐│    │
//! │  │  timestamp (ms) │   │  3 Normal       │   │  health_score   │ ││    │
//! │  │  id?            │   │  4 Low          │   │  latency_ms     │ ││    │
//! │  │  priority?      │   └─────────────────┘   └─────────────────┘ ││    │
//! │  └─────────────────┘                                              ││    │
//! │                                                                   ││    │
//! │  Two independent axes:   NetworkAvailability ◄────────────────────┘│    │
//! │                          SocketState         ◄─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! ```json
//! { "type": "oee_update", "data": { "lineId": "L1" }, "timestamp": 1718000000000,
//!   "id": "7f3a-12", "priority": 3 }
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Priority
// =============================================================================

/// Outbound delivery priority. Lower number is more urgent.
///
/// Serialized as the bare number `1..=4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// Safety and Andon traffic. Never batched.
    Critical = 1,
    /// Operator commands. Never batched.
    High = 2,
    /// Regular updates. Batched.
    #[default]
    Normal = 3,
    /// Bulk telemetry. Batched.
    Low = 4,
}

impl Priority {
    /// All priorities in drain order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Zero-based lane index (critical = 0).
    #[inline]
    pub const fn lane(self) -> usize {
        self as usize - 1
    }

    /// Whether messages of this priority are combined into batch frames.
    #[inline]
    pub const fn is_batched(self) -> bool {
        matches!(self, Priority::Normal | Priority::Low)
    }
}

impl TryFrom<u8> for Priority {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Normal),
            4 => Ok(Priority::Low),
            other => Err(CoreError::UnknownPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event or control type (`oee_update`, `ping`, `batch`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Payload object.
    #[serde(default = "empty_object")]
    pub data: Value,

    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,

    /// Message id, unique within one connection session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Delivery priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl Envelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Envelope {
            kind: kind.into(),
            data,
            timestamp: now_millis(),
            id: None,
            priority: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the message id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Returns the priority, defaulting to normal.
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    /// Reads a top-level payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|obj| obj.get(key))
    }

    /// Serializes to a JSON frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a JSON frame.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::MalformedEnvelope(e.to_string()))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Connection Axes
// =============================================================================

/// State of the socket itself.
///
/// ```text
///  Disconnected ──connect()──► Connecting ──open──► Connected
///        ▲                         │                    │
///        │ disconnect()            │ fail         close/error
///        │                         ▼                    ▼
///        └──────────────────── Reconnecting ◄───────────┘
///                                  │
///                          attempts exhausted
///                                  ▼
///                                Error  (terminal until reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SocketState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketState::Disconnected => write!(f, "disconnected"),
            SocketState::Connecting => write!(f, "connecting"),
            SocketState::Connected => write!(f, "connected"),
            SocketState::Reconnecting => write!(f, "reconnecting"),
            SocketState::Error => write!(f, "error"),
        }
    }
}

/// Whether the host has any network at all. Independent of [`SocketState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum NetworkAvailability {
    #[default]
    Online,
    Offline,
}

impl NetworkAvailability {
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkAvailability::Online
        } else {
            NetworkAvailability::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == NetworkAvailability::Online
    }
}

/// Latency probe classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
    Unreachable,
}

impl NetworkQuality {
    /// Buckets a measured round trip.
    pub fn from_latency_ms(ms: u64) -> Self {
        match ms {
            0..=99 => NetworkQuality::Excellent,
            100..=299 => NetworkQuality::Good,
            300..=999 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Unknown => "unknown",
            NetworkQuality::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Status Snapshots
// =============================================================================

/// Observable snapshot of the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConnectionStatus {
    pub socket: SocketState,
    pub network: NetworkAvailability,

    /// Reconnect attempts made since the last successful open.
    pub reconnect_attempts: u32,

    /// Always within `[0, 1]`.
    pub health_score: f64,

    /// Last measured heartbeat round trip.
    #[ts(type = "number | null")]
    pub latency_ms: Option<u64>,

    #[ts(type = "number")]
    pub messages_sent: u64,
    #[ts(type = "number")]
    pub messages_received: u64,
    #[ts(type = "number")]
    pub errors: u64,
    #[ts(type = "number")]
    pub parse_errors: u64,

    /// Messages waiting in the priority lanes.
    #[ts(type = "number")]
    pub queued_messages: usize,

    /// Replaced on every successful open.
    pub session_id: Option<String>,

    pub last_error: Option<String>,

    /// Delay before the scheduled reconnect, if one is pending.
    #[ts(type = "number | null")]
    pub next_retry_ms: Option<u64>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus {
            socket: SocketState::Disconnected,
            network: NetworkAvailability::Online,
            reconnect_attempts: 0,
            health_score: 1.0,
            latency_ms: None,
            messages_sent: 0,
            messages_received: 0,
            errors: 0,
            parse_errors: 0,
            queued_messages: 0,
            session_id: None,
            last_error: None,
            next_retry_ms: None,
        }
    }
}

impl ConnectionStatus {
    /// True when the socket is open and the network is up.
    pub fn is_connected(&self) -> bool {
        self.socket == SocketState::Connected && self.network.is_online()
    }

    /// True once reconnect attempts are exhausted.
    pub fn is_terminal(&self) -> bool {
        self.socket == SocketState::Error
    }
}

/// Observable snapshot of the network monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct NetworkStatus {
    pub availability: NetworkAvailability,
    pub quality: NetworkQuality,
    #[ts(type = "number | null")]
    pub latency_ms: Option<u64>,
    pub consecutive_probe_failures: u32,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        NetworkStatus {
            availability: NetworkAvailability::Online,
            quality: NetworkQuality::Unknown,
            latency_ms: None,
            consecutive_probe_failures: 0,
        }
    }
}
