//! # Remote Entity Service
//!
//! The reconciler's view of the backend: create, update, delete and fetch
//! one entity at a time.
//!
//! ```text
//!   SyncReconciler ──► EntityService
//!                          │
//!                          ▼  ChannelEntityService
//!   entity_op {requestId, op, entityType, entityId, payload, baseVersion}
//!        │  (High priority, over the connection manager)
//!        ▼
//!     server
//!        │
//!        ▼
//!   entity_result {requestId, status: ok | conflict | rejected | not_found,
//!                  version?, payload?, message?, retryable?}
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use shopfloor_core::{Envelope, Priority};

use crate::connection::ConnectionHandle;
use crate::error::SyncResult;
use crate::protocol::{self, EventMessage};
use crate::subscription::{SubscriptionHandle, SubscriptionRegistry};

/// Successful server acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAck {
    pub version: Option<u64>,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Version conflict: server is at {server_version}")]
    Conflict {
        server_version: u64,
        server_payload: Value,
    },

    #[error("Rejected: {message}")]
    Rejected { message: String, retryable: bool },

    #[error("Entity not found")]
    NotFound,

    /// The request never reached the server.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn retryable(message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        RemoteError::Unavailable(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Rejected { retryable: true, .. } | RemoteError::Unavailable(_)
        )
    }
}

pub type RemoteResult = Result<RemoteAck, RemoteError>;

#[async_trait]
pub trait EntityService: Send + Sync {
    async fn create(&self, entity_type: &str, entity_id: &str, payload: &Value) -> RemoteResult;

    async fn update(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        base_version: Option<u64>,
    ) -> RemoteResult;

    async fn delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        base_version: Option<u64>,
    ) -> RemoteResult;

    async fn get(&self, entity_type: &str, entity_id: &str) -> RemoteResult;
}

// =============================================================================
// Channel Implementation
// =============================================================================

type PendingMap = HashMap<String, oneshot::Sender<Value>>;

fn lock_pending(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Request/response over the realtime connection.
pub struct ChannelEntityService {
    connection: ConnectionHandle,
    pending: Arc<Mutex<PendingMap>>,
    timeout: Duration,
    _results: SubscriptionHandle,
}

impl ChannelEntityService {
    pub fn new(
        connection: ConnectionHandle,
        registry: &SubscriptionRegistry,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));

        let waiting = pending.clone();
        let results = registry.on(protocol::ENTITY_RESULT, move |event: &EventMessage| {
            let Some(request_id) = event.field("requestId").and_then(Value::as_str) else {
                warn!("entity_result without requestId");
                return;
            };
            match lock_pending(&waiting).remove(request_id) {
                Some(reply) => {
                    let _ = reply.send(event.data.clone());
                }
                None => debug!(request_id, "Late or unknown entity_result"),
            }
        })?;

        Ok(ChannelEntityService {
            connection,
            pending,
            timeout,
            _results: results,
        })
    }

    async fn request(
        &self,
        op: &str,
        entity_type: &str,
        entity_id: &str,
        payload: Option<&Value>,
        base_version: Option<u64>,
    ) -> RemoteResult {
        if !self.connection.is_connected() {
            return Err(RemoteError::unavailable("not connected"));
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request_id.clone(), tx);

        let envelope = Envelope::new(
            protocol::ENTITY_OP,
            json!({
                "requestId": request_id,
                "op": op,
                "entityType": entity_type,
                "entityId": entity_id,
                "payload": payload,
                "baseVersion": base_version,
            }),
        );
        if let Err(e) = self.connection.send(envelope, Priority::High) {
            lock_pending(&self.pending).remove(&request_id);
            return Err(RemoteError::unavailable(e.to_string()));
        }

        let mut status = self.connection.watch_status();
        let outcome = tokio::select! {
            reply = tokio::time::timeout(self.timeout, rx) => match reply {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(_)) => Err(RemoteError::retryable("request abandoned")),
                Err(_) => Err(RemoteError::retryable("request timed out")),
            },
            _ = status.wait_for(|s| !s.is_connected()) => {
                Err(RemoteError::unavailable("connection lost"))
            }
        };

        if outcome.is_err() {
            lock_pending(&self.pending).remove(&request_id);
        }
        outcome.and_then(|data| interpret_result(&data))
    }
}

/// Maps an `entity_result` payload onto the service contract.
fn interpret_result(data: &Value) -> RemoteResult {
    let status = data.get("status").and_then(Value::as_str).unwrap_or("rejected");
    let version = data.get("version").and_then(Value::as_u64);
    let payload = data.get("payload").filter(|p| !p.is_null()).cloned();

    match status {
        "ok" => Ok(RemoteAck { version, payload }),
        "conflict" => Err(RemoteError::Conflict {
            server_version: version.unwrap_or(0),
            server_payload: payload.unwrap_or(Value::Null),
        }),
        "not_found" => Err(RemoteError::NotFound),
        _ => Err(RemoteError::Rejected {
            message: data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("rejected by server")
                .to_string(),
            retryable: data.get("retryable").and_then(Value::as_bool).unwrap_or(false),
        }),
    }
}

#[async_trait]
impl EntityService for ChannelEntityService {
    async fn create(&self, entity_type: &str, entity_id: &str, payload: &Value) -> RemoteResult {
        self.request("create", entity_type, entity_id, Some(payload), None)
            .await
    }

    async fn update(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        base_version: Option<u64>,
    ) -> RemoteResult {
        self.request("update", entity_type, entity_id, Some(payload), base_version)
            .await
    }

    async fn delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        base_version: Option<u64>,
    ) -> RemoteResult {
        self.request("delete", entity_type, entity_id, None, base_version)
            .await
    }

    async fn get(&self, entity_type: &str, entity_id: &str) -> RemoteResult {
        self.request("get", entity_type, entity_id, None, None).await
    }
}
