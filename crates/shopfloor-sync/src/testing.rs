//! In-process doubles for the transport, the store and the backend.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use shopfloor_core::{ActionId, Envelope, EntitySnapshot, QueuedAction};

use crate::error::{SyncError, SyncResult};
use crate::remote::{EntityService, RemoteAck, RemoteResult};
use crate::store::{ActionStore, MemoryStore};
use crate::transport::{Connector, FrameReader, FrameWriter, Link};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lets every spawned task run until it blocks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// =============================================================================
// Store
// =============================================================================

/// Memory store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::DatabaseError("disk I/O error".into()));
        }
        Ok(())
    }

    pub fn stored(&self, id: ActionId) -> Option<QueuedAction> {
        self.inner.stored(id)
    }
}

#[async_trait]
impl ActionStore for FlakyStore {
    async fn load_actions(&self) -> SyncResult<Vec<QueuedAction>> {
        self.inner.load_actions().await
    }

    async fn save_action(&self, action: &QueuedAction) -> SyncResult<()> {
        self.check()?;
        self.inner.save_action(action).await
    }

    async fn save_actions(&self, actions: &[QueuedAction]) -> SyncResult<()> {
        self.check()?;
        self.inner.save_actions(actions).await
    }

    async fn delete_actions(&self, ids: &[ActionId]) -> SyncResult<u64> {
        self.check()?;
        self.inner.delete_actions(ids).await
    }

    async fn high_water_mark(&self) -> SyncResult<Option<ActionId>> {
        self.inner.high_water_mark().await
    }

    async fn save_snapshot(&self, snapshot: &EntitySnapshot) -> SyncResult<()> {
        self.check()?;
        self.inner.save_snapshot(snapshot).await
    }

    async fn load_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Option<EntitySnapshot>> {
        self.inner.load_snapshot(entity_type, entity_id).await
    }
}

// =============================================================================
// Transport
// =============================================================================

enum ServerFrame {
    Text(String),
    Close,
}

/// The server side of one in-memory link.
#[derive(Clone)]
pub struct ServerEnd {
    sent: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedSender<ServerFrame>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl ServerEnd {
    pub fn push(&self, envelope: Envelope) {
        if let Ok(text) = envelope.to_json() {
            self.push_raw(&text);
        }
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.inbound.send(ServerFrame::Text(text.to_string()));
    }

    /// Closes the link from the server side.
    pub fn close(&self) {
        let _ = self.inbound.send(ServerFrame::Close);
    }

    pub fn sent_frames(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent_frames()
            .iter()
            .filter_map(|f| Envelope::from_json(f).ok())
            .collect()
    }

    pub fn sent_of_type(&self, kind: &str) -> Vec<Envelope> {
        self.sent_envelopes()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// The client sent a close handshake.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The client let go of its write half.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct MemoryWriter {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: String) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::WebSocketError("broken pipe".into()));
        }
        lock(&self.sent).push(frame);
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Option<SyncResult<String>> {
        match self.inbound.recv().await {
            Some(ServerFrame::Text(text)) => Some(Ok(text)),
            Some(ServerFrame::Close) | None => None,
        }
    }
}

#[derive(Default)]
struct ConnectorState {
    call_times: Vec<Instant>,
    fail_next: u32,
    hang_next: u32,
    always_fail: bool,
    links: Vec<ServerEnd>,
}

/// Connector that hands out in-process links.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        lock(&self.state).fail_next = count;
    }

    /// The next `count` attempts never complete.
    pub fn hang_next(&self, count: u32) {
        lock(&self.state).hang_next = count;
    }

    pub fn always_fail(&self, fail: bool) {
        lock(&self.state).always_fail = fail;
    }

    /// Every write on every link fails while set.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        lock(&self.state).call_times.len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        lock(&self.state).call_times.clone()
    }

    pub fn links(&self) -> usize {
        lock(&self.state).links.len()
    }

    /// Server end of the most recent link.
    ///
    /// Panics when no link was ever opened.
    pub fn latest(&self) -> ServerEnd {
        lock(&self.state)
            .links
            .last()
            .cloned()
            .expect("no link opened yet")
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> SyncResult<Link> {
        let hang = {
            let mut state = lock(&self.state);
            state.call_times.push(Instant::now());
            if state.hang_next > 0 {
                state.hang_next -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = lock(&self.state);
        if state.always_fail {
            return Err(SyncError::ConnectionFailed("connection refused".into()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SyncError::ConnectionFailed("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let server = ServerEnd {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: tx,
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicBool::new(false)),
        };
        let writer = MemoryWriter {
            sent: server.sent.clone(),
            closed: server.closed.clone(),
            dropped: server.dropped.clone(),
            fail_writes: self.fail_writes.clone(),
        };
        state.links.push(server);

        Ok((Box::new(writer), Box::new(MemoryReader { inbound: rx })))
    }
}

// =============================================================================
// Backend
// =============================================================================

/// One recorded call to the scripted service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub op: &'static str,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Option<Value>,
    pub base_version: Option<u64>,
}

/// Backend that answers from a script, then acknowledges with version 1.
#[derive(Clone, Default)]
pub struct ScriptedEntityService {
    script: Arc<Mutex<VecDeque<RemoteResult>>>,
    calls: Arc<Mutex<Vec<ServiceCall>>>,
}

impl ScriptedEntityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(&self, result: RemoteResult) -> &Self {
        lock(&self.script).push_back(result);
        self
    }

    pub fn then_ok(&self, version: u64) -> &Self {
        self.then(Ok(RemoteAck {
            version: Some(version),
            payload: None,
        }))
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        lock(&self.calls).clone()
    }

    fn answer(
        &self,
        op: &'static str,
        entity_type: &str,
        entity_id: &str,
        payload: Option<&Value>,
        base_version: Option<u64>,
    ) -> RemoteResult {
        lock(&self.calls).push(ServiceCall {
            op,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            payload: payload.cloned(),
            base_version,
        });
        lock(&self.script).pop_front().unwrap_or(Ok(RemoteAck {
            version: Some(1),
            payload: None,
        }))
    }
}

#[async_trait]
impl EntityService for ScriptedEntityService {
    async fn create(&self, entity_type: &str, entity_id: &str, payload: &Value) -> RemoteResult {
        self.answer("create", entity_type, entity_id, Some(payload), None)
    }

    async fn update(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        base_version: Option<u64>,
    ) -> RemoteResult {
        self.answer("update", entity_type, entity_id, Some(payload), base_version)
    }

    async fn delete(
        &self,
        entity_type: &str,
        entity_id: &str,
        base_version: Option<u64>,
    ) -> RemoteResult {
        self.answer("delete", entity_type, entity_id, None, base_version)
    }

    async fn get(&self, entity_type: &str, entity_id: &str) -> RemoteResult {
        self.answer("get", entity_type, entity_id, None, None)
    }
}
