//! # Connection Manager
//!
//! One tokio task that owns the socket, the outbound lanes and the health
//! tracker. Everything else talks to it through a [`ConnectionHandle`].
//!
//! ## Socket State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Socket States (network axis separate)                │
//! │                                                                         │
//! │  ┌────────────┐  connect()   ┌────────────┐   open    ┌────────────┐   │
//! │  │Disconnected│─────────────►│ Connecting │──────────►│ Connected  │   │
//! │  └────────────┘              └─────┬──────┘           └─────┬──────┘   │
//! │        ▲                           │ fail/timeout           │          │
//! │        │ disconnect()              ▼                        │ close,   │
//! │        │                    ┌──────────────┐                │ error,   │
//! │        └────────────────────│ Reconnecting │◄───────────────┘ missed   │
//! │                             └──────┬───────┘                  pings,   │
//! │                                    │ attempts > max           low      │
//! │                                    ▼                          health   │
//! │                             ┌──────────────┐                           │
//! │                             │    Error     │ terminal until reset()    │
//! │                             └──────────────┘                           │
//! │                                                                         │
//! │  NETWORK OFFLINE: link closed, every timer suspended. Back online:     │
//! │  attempt counter reset and an immediate reconnect if one was wanted.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Actor Loop
//! ```text
//!   select! {
//!     command           ← ConnectionHandle (connect, send, disconnect, ...)
//!     subscription diff ← SubscriptionRegistry (subscribe/unsubscribe frames)
//!     inbound frame     ← FrameReader            (only while linked)
//!     reconnect timer                             (only while online)
//!     heartbeat timer, health timer, batch deadline (only while linked)
//!   }
//! ```

use serde_json::json;
use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shopfloor_core::{
    ConnectionStatus, Envelope, HealthTracker, NetworkAvailability, Priority, SocketState,
};

use crate::config::{ConnectionSettings, DispatchSettings};
use crate::dispatcher::{Frame, PriorityDispatcher};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{self, InboundEvent};
use crate::reconnect::ReconnectPolicy;
use crate::subscription::{SubscriptionChange, SubscriptionRegistry};
use crate::transport::{Connector, FrameReader, FrameWriter};

// =============================================================================
// Commands & Handle
// =============================================================================

enum Command {
    Connect(oneshot::Sender<SyncResult<()>>),
    Disconnect(oneshot::Sender<()>),
    Send { envelope: Envelope, priority: Priority },
    SetNetwork(bool),
    Reset(oneshot::Sender<()>),
    Shutdown,
}

/// Cheap, cloneable handle to the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    fn command(&self, command: Command) -> SyncResult<()> {
        self.tx.send(command).map_err(|_| SyncError::ShuttingDown)
    }

    /// Opens the socket. Resolves once it is open.
    ///
    /// Fails immediately while the network is offline or the manager is in
    /// the terminal `Error` state. Other failures schedule a retry.
    pub async fn connect(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// Closes the socket and stops reconnecting. Queued messages stay.
    pub async fn disconnect(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Disconnect(tx))?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Queues a message. Delivered when connected; only fails once the
    /// manager has shut down.
    pub fn send(&self, envelope: Envelope, priority: Priority) -> SyncResult<()> {
        self.command(Command::Send { envelope, priority })
    }

    /// Feeds the network axis.
    pub fn set_network(&self, online: bool) -> SyncResult<()> {
        self.command(Command::SetNetwork(online))
    }

    /// Clears the terminal `Error` state and the attempt counter.
    pub async fn reset(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Reset(tx))?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }
}

// =============================================================================
// Actor
// =============================================================================

enum Event {
    Command(Option<Command>),
    Subscription(SubscriptionChange),
    Frame(Option<SyncResult<String>>),
    ReconnectDue,
    HeartbeatDue,
    HealthDue,
    BatchDue,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn recv_frame(reader: Option<&mut Box<dyn FrameReader>>) -> Option<SyncResult<String>> {
    match reader {
        Some(reader) => reader.recv().await,
        None => pending().await,
    }
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    registry: SubscriptionRegistry,
    dispatcher: PriorityDispatcher,
    policy: ReconnectPolicy,
    health: HealthTracker,

    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    changes: mpsc::UnboundedReceiver<SubscriptionChange>,

    writer: Option<Box<dyn FrameWriter>>,
    reader: Option<Box<dyn FrameReader>>,
    /// The host asked for a connection and has not disconnected since.
    wanted: bool,

    session: String,
    seq: u64,
    outstanding_ping: Option<(String, Instant)>,
    last_inbound: Instant,
    connected_at: Instant,

    reconnect_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
    health_at: Option<Instant>,
}

impl ConnectionManager {
    /// Spawns the connection task.
    pub fn spawn(
        settings: ConnectionSettings,
        dispatch: DispatchSettings,
        connector: Arc<dyn Connector>,
        registry: SubscriptionRegistry,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let policy = ReconnectPolicy::from_settings(&settings);
        Self::spawn_with_policy(settings, dispatch, connector, registry, policy)
    }

    pub fn spawn_with_policy(
        settings: ConnectionSettings,
        dispatch: DispatchSettings,
        connector: Arc<dyn Connector>,
        registry: SubscriptionRegistry,
        policy: ReconnectPolicy,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let changes = registry.attach();
        let health = HealthTracker::new(settings.health_weights(), settings.health_thresholds());
        let now = Instant::now();

        let manager = ConnectionManager {
            settings,
            connector,
            registry,
            dispatcher: PriorityDispatcher::new(dispatch),
            policy,
            health,
            status: ConnectionStatus::default(),
            status_tx,
            commands,
            changes,
            writer: None,
            reader: None,
            wanted: false,
            session: String::new(),
            seq: 0,
            outstanding_ping: None,
            last_inbound: now,
            connected_at: now,
            reconnect_at: None,
            heartbeat_at: None,
            health_at: None,
        };

        let task = tokio::spawn(manager.run());
        let handle = ConnectionHandle {
            tx,
            status: status_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        info!(url = %self.settings.server_url, "Connection manager starting");

        loop {
            let linked = self.writer.is_some();
            let online = self.status.network.is_online();
            let batch_deadline = self.dispatcher.next_deadline();

            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                Some(change) = self.changes.recv() => Event::Subscription(change),
                frame = recv_frame(self.reader.as_mut()), if linked => Event::Frame(frame),
                _ = sleep_until_opt(self.reconnect_at), if online && self.reconnect_at.is_some() => Event::ReconnectDue,
                _ = sleep_until_opt(self.heartbeat_at), if linked => Event::HeartbeatDue,
                _ = sleep_until_opt(self.health_at), if linked => Event::HealthDue,
                _ = sleep_until_opt(batch_deadline), if linked && batch_deadline.is_some() => Event::BatchDue,
            };

            match event {
                Event::Command(None) | Event::Command(Some(Command::Shutdown)) => break,
                Event::Command(Some(command)) => self.handle_command(command).await,
                Event::Subscription(change) => self.handle_subscription_change(change).await,
                Event::Frame(frame) => self.handle_frame(frame).await,
                Event::ReconnectDue => {
                    self.reconnect_at = None;
                    let _ = self.attempt_connect().await;
                }
                Event::HeartbeatDue => self.heartbeat().await,
                Event::HealthDue => self.health_check().await,
                Event::BatchDue => self.flush_ready().await,
            }
        }

        self.close_link().await;
        self.reconnect_at = None;
        if self.status.socket != SocketState::Error {
            self.status.socket = SocketState::Disconnected;
        }
        self.publish_state();
        info!("Connection manager stopped");
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.wanted = true;
                let result = if self.status.socket == SocketState::Error {
                    Err(SyncError::ReconnectExhausted {
                        attempts: self.status.reconnect_attempts,
                    })
                } else if !self.status.network.is_online() {
                    Err(SyncError::Offline)
                } else if self.writer.is_some() {
                    Ok(())
                } else {
                    self.attempt_connect().await
                };
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.wanted = false;
                self.reconnect_at = None;
                self.status.next_retry_ms = None;
                self.close_link().await;
                if self.status.socket != SocketState::Error {
                    self.status.socket = SocketState::Disconnected;
                }
                info!(queued = self.dispatcher.len(), "Disconnected by request");
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Send { envelope, priority } => {
                self.dispatcher.enqueue(envelope, priority, Instant::now());
                if self.writer.is_some() {
                    self.flush_ready().await;
                }
                self.sync_status();
            }
            Command::SetNetwork(online) => self.set_network(online).await,
            Command::Reset(reply) => {
                if self.status.socket == SocketState::Error {
                    info!("Clearing terminal connection error");
                    self.status.socket = SocketState::Disconnected;
                    self.wanted = false;
                }
                self.status.reconnect_attempts = 0;
                self.status.next_retry_ms = None;
                self.status.last_error = None;
                self.publish_state();
                let _ = reply.send(());
            }
            // handled by the loop
            Command::Shutdown => {}
        }
    }

    async fn set_network(&mut self, online: bool) {
        let availability = NetworkAvailability::from_online(online);
        if self.status.network == availability {
            return;
        }
        self.status.network = availability;

        if online {
            info!("Network back online");
            if self.status.socket != SocketState::Error {
                self.status.reconnect_attempts = 0;
            }
            self.publish_state();
            if self.wanted && self.writer.is_none() && self.status.socket != SocketState::Error {
                let _ = self.attempt_connect().await;
            }
        } else {
            warn!("Network offline, suspending connection");
            self.close_link().await;
            self.reconnect_at = None;
            self.status.next_retry_ms = None;
            if self.status.socket != SocketState::Error {
                self.status.socket = if self.wanted {
                    SocketState::Reconnecting
                } else {
                    SocketState::Disconnected
                };
            }
            self.publish_state();
        }
    }

    async fn handle_subscription_change(&mut self, change: SubscriptionChange) {
        if self.writer.is_none() {
            // resubscribed in full on the next open
            return;
        }
        let envelope = match &change {
            SubscriptionChange::Added(t) => protocol::subscribe(t),
            SubscriptionChange::Removed(t) => protocol::unsubscribe(t),
        };
        debug!(?change, "Updating server subscription");
        if let Err(e) = self.write_control(envelope).await {
            self.on_link_lost(e).await;
        }
    }

    // =========================================================================
    // Connect / Reconnect
    // =========================================================================

    async fn attempt_connect(&mut self) -> SyncResult<()> {
        self.reconnect_at = None;
        self.status.next_retry_ms = None;
        self.status.socket = if self.status.reconnect_attempts > 0 {
            SocketState::Reconnecting
        } else {
            SocketState::Connecting
        };
        self.publish_state();

        debug!(attempt = self.status.reconnect_attempts, "Opening connection");
        let connect_timeout = self.settings.connect_timeout();
        let result = match timeout(connect_timeout, self.connector.connect()).await {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Timeout(self.settings.connect_timeout_ms)),
        };

        match result {
            Ok((writer, reader)) => {
                self.on_open(writer, reader).await;
                Ok(())
            }
            Err(e) => {
                let reply = match &e {
                    SyncError::Timeout(ms) => SyncError::Timeout(*ms),
                    other => SyncError::ConnectionFailed(other.to_string()),
                };
                self.on_connect_failed(e);
                Err(reply)
            }
        }
    }

    async fn on_open(&mut self, writer: Box<dyn FrameWriter>, reader: Box<dyn FrameReader>) {
        let now = Instant::now();
        self.session = Uuid::new_v4().to_string();
        self.seq = 0;
        self.writer = Some(writer);
        self.reader = Some(reader);
        self.health.reset();
        self.outstanding_ping = None;
        self.last_inbound = now;
        self.connected_at = now;
        self.heartbeat_at = Some(now + self.settings.heartbeat_interval());
        self.health_at = Some(now + self.settings.health_check_interval());

        self.status.socket = SocketState::Connected;
        self.status.session_id = Some(self.session.clone());
        self.status.reconnect_attempts = 0;
        self.status.next_retry_ms = None;
        self.status.health_score = 1.0;
        self.status.latency_ms = None;

        info!(session = %self.session, "Connection open");
        self.publish_state();

        for event_type in self.registry.active_event_types() {
            if let Err(e) = self.write_control(protocol::subscribe(&event_type)).await {
                self.on_link_lost(e).await;
                return;
            }
        }

        let frames = self.dispatcher.drain_all();
        if !frames.is_empty() {
            debug!(frames = frames.len(), "Draining queued messages");
        }
        self.transmit(frames).await;
    }

    fn on_connect_failed(&mut self, err: SyncError) {
        warn!(error = %err, attempt = self.status.reconnect_attempts, "Connection attempt failed");
        self.status.errors += 1;
        self.status.last_error = Some(err.to_string());
        self.health.record_error();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.wanted {
            self.status.socket = SocketState::Disconnected;
            self.publish_state();
            return;
        }

        if !self.status.network.is_online() {
            // resumed by set_network(true)
            self.status.socket = SocketState::Reconnecting;
            self.publish_state();
            return;
        }

        let max = self.settings.max_reconnect_attempts;
        if self.status.reconnect_attempts >= max {
            self.enter_error();
            return;
        }

        self.status.reconnect_attempts += 1;
        let attempt = self.status.reconnect_attempts;
        let delay = self.policy.delay(attempt);
        self.reconnect_at = Some(Instant::now() + delay);
        self.status.next_retry_ms = Some(delay.as_millis() as u64);
        self.status.socket = SocketState::Reconnecting;

        info!(
            attempt,
            max_attempts = max,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.publish_state();
    }

    fn enter_error(&mut self) {
        error!(
            attempts = self.status.reconnect_attempts,
            last_error = ?self.status.last_error,
            "Reconnect attempts exhausted"
        );
        self.reconnect_at = None;
        self.status.next_retry_ms = None;
        self.status.socket = SocketState::Error;
        self.publish_state();
        self.registry.publish_local(
            protocol::CONNECTION_ERROR,
            json!({
                "attempts": self.status.reconnect_attempts,
                "lastError": self.status.last_error,
            }),
        );
    }

    /// Drops the link after a failure and decides what comes next.
    async fn on_link_lost(&mut self, err: SyncError) {
        if self.writer.is_none() {
            return;
        }
        warn!(error = %err, session = %self.session, "Connection lost");
        self.drop_link();
        self.status.errors += 1;
        self.status.last_error = Some(err.to_string());
        self.health.record_error();
        self.schedule_reconnect();
    }

    fn drop_link(&mut self) {
        self.writer = None;
        self.reader = None;
        self.heartbeat_at = None;
        self.health_at = None;
        self.outstanding_ping = None;
        self.status.session_id = None;
    }

    async fn close_link(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.close().await {
                debug!(error = %e, "Close handshake failed");
            }
        }
        self.drop_link();
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn next_message_id(&mut self) -> String {
        self.seq += 1;
        format!("{}-{}", self.session, self.seq)
    }

    async fn write_envelope(&mut self, mut envelope: Envelope) -> SyncResult<()> {
        if envelope.id.is_none() {
            envelope.id = Some(self.next_message_id());
        }
        let json = envelope.to_json()?;
        let writer = self.writer.as_mut().ok_or(SyncError::Disconnected)?;
        writer.send(json).await?;
        self.status.messages_sent += 1;
        Ok(())
    }

    async fn write_control(&mut self, envelope: Envelope) -> SyncResult<()> {
        debug!(event_type = %envelope.kind, "Sending control message");
        self.write_envelope(envelope).await
    }

    async fn write_frame(&mut self, frame: &mut Frame) -> SyncResult<()> {
        for message in frame.messages.iter_mut() {
            self.seq += 1;
            message.envelope.id = Some(format!("{}-{}", self.session, self.seq));
        }
        let envelope = frame.to_envelope()?;
        self.write_envelope(envelope).await
    }

    /// Writes frames in order. On the first failure the rest go back to
    /// their lanes and the link is treated as lost.
    async fn transmit(&mut self, frames: Vec<Frame>) {
        let mut frames = frames.into_iter();
        while let Some(mut frame) = frames.next() {
            match self.write_frame(&mut frame).await {
                Ok(()) => {
                    self.health.record_success();
                    debug!(
                        priority = %frame.priority,
                        messages = frame.len(),
                        batched = frame.batched,
                        "Frame sent"
                    );
                }
                Err(e) => {
                    let unsent: Vec<Frame> = frames.collect();
                    for rest in unsent.into_iter().rev() {
                        self.dispatcher.requeue(rest, false);
                    }
                    self.dispatcher.requeue(frame, true);
                    self.on_link_lost(e).await;
                    self.sync_status();
                    return;
                }
            }
        }
        self.sync_status();
    }

    async fn flush_ready(&mut self) {
        if self.writer.is_none() {
            return;
        }
        let frames = self.dispatcher.ready_frames(Instant::now());
        if !frames.is_empty() {
            self.transmit(frames).await;
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn handle_frame(&mut self, frame: Option<SyncResult<String>>) {
        let text = match frame {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                self.on_link_lost(e).await;
                return;
            }
            None => {
                self.on_link_lost(SyncError::Disconnected).await;
                return;
            }
        };

        self.last_inbound = Instant::now();
        self.status.messages_received += 1;
        self.health.record_success();

        match InboundEvent::parse(&text) {
            Ok(event) => self.handle_inbound(event).await,
            Err(e) => {
                self.status.parse_errors += 1;
                warn!(error = %e, "Dropping malformed inbound frame");
                self.sync_status();
            }
        }
    }

    async fn handle_inbound(&mut self, event: InboundEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            match event {
                InboundEvent::Heartbeat => debug!("Server heartbeat"),
                InboundEvent::Ping { ping_id } => {
                    if let Err(e) = self.write_control(protocol::pong(ping_id.as_deref())).await {
                        self.on_link_lost(e).await;
                        return;
                    }
                }
                InboundEvent::Pong { ping_id } => self.on_pong(ping_id),
                InboundEvent::SubscriptionConfirmed { event_type } => {
                    debug!(event_type = ?event_type, "Subscription confirmed");
                }
                InboundEvent::Batch(messages) => {
                    for message in messages {
                        match InboundEvent::from_envelope(message) {
                            Ok(inner) => events.push_back(inner),
                            Err(e) => {
                                self.status.parse_errors += 1;
                                warn!(error = %e, "Dropping malformed batch entry");
                            }
                        }
                    }
                }
                InboundEvent::ServerError { message, code } => {
                    warn!(%message, code = ?code, "Server reported an error");
                    self.registry.publish_local(
                        protocol::SERVER_ERROR,
                        json!({ "message": message, "code": code }),
                    );
                }
                InboundEvent::Domain(event) => {
                    let delivered = self.registry.dispatch(&event);
                    debug!(event_type = %event.event_type, delivered, "Event dispatched");
                }
            }
        }
        self.sync_status();
    }

    fn on_pong(&mut self, ping_id: Option<String>) {
        let Some((outstanding, sent_at)) = self.outstanding_ping.take() else {
            return;
        };
        if ping_id.as_deref().is_some_and(|id| id != outstanding) {
            debug!(?ping_id, expected = %outstanding, "Ignoring stale pong");
            self.outstanding_ping = Some((outstanding, sent_at));
            return;
        }

        let rtt = Instant::now().saturating_duration_since(sent_at);
        self.health.record_latency(rtt);
        self.health.reset_missed_heartbeats();
        self.status.latency_ms = Some(rtt.as_millis() as u64);
        debug!(rtt_ms = rtt.as_millis() as u64, "Pong received");
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn heartbeat(&mut self) {
        let now = Instant::now();
        self.heartbeat_at = Some(now + self.settings.heartbeat_interval());

        if self.outstanding_ping.is_some() {
            let missed = self.health.record_missed_heartbeat();
            warn!(missed, max = self.settings.max_missed_heartbeats, "Heartbeat missed");
            if missed >= self.settings.max_missed_heartbeats {
                self.on_link_lost(SyncError::Timeout(self.settings.heartbeat_interval_ms))
                    .await;
                return;
            }
        }

        let ping_id = self.next_message_id();
        let ping = protocol::ping(&ping_id).with_id(ping_id.clone());
        match self.write_control(ping).await {
            Ok(()) => self.outstanding_ping = Some((ping_id, now)),
            Err(e) => self.on_link_lost(e).await,
        }
    }

    async fn health_check(&mut self) {
        let now = Instant::now();
        self.health_at = Some(now + self.settings.health_check_interval());

        let idle = now.saturating_duration_since(self.last_inbound);
        let score = self.health.score(idle);
        self.status.health_score = score;
        self.sync_status();

        self.registry.publish_local(
            protocol::CONNECTION_HEALTH,
            json!({
                "score": score,
                "latencyMs": self.status.latency_ms,
                "missedHeartbeats": self.health.missed_heartbeats(),
                "errorRate": self.health.error_rate(),
            }),
        );

        let grace: Duration = self.settings.heartbeat_interval() * 2;
        let settled = now.saturating_duration_since(self.connected_at) >= grace;
        if settled && score < self.settings.proactive_reconnect_threshold {
            warn!(
                score,
                threshold = self.settings.proactive_reconnect_threshold,
                "Connection health degraded, reconnecting proactively"
            );
            self.close_link().await;
            let _ = self.attempt_connect().await;
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    fn sync_status(&mut self) {
        self.status.queued_messages = self.dispatcher.len();
        self.status_tx.send_replace(self.status.clone());
    }

    /// Updates watchers and emits `connection:state`.
    fn publish_state(&mut self) {
        self.sync_status();
        match serde_json::to_value(&self.status) {
            Ok(data) => {
                self.registry.publish_local(protocol::CONNECTION_STATE, data);
            }
            Err(e) => warn!(error = %e, "Failed to encode connection status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventMessage;
    use crate::testing::{settle, MemoryConnector};
    use serde_json::Value;
    use std::sync::Mutex;

    struct Harness {
        handle: ConnectionHandle,
        connector: MemoryConnector,
        registry: SubscriptionRegistry,
    }

    fn harness_with(settings: ConnectionSettings, dispatch: DispatchSettings) -> Harness {
        let connector = MemoryConnector::new();
        let registry = SubscriptionRegistry::new();
        let policy = ReconnectPolicy::new(
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_cap_ms),
            settings.jitter_ratio,
            42,
        );
        let (handle, _task) = ConnectionManager::spawn_with_policy(
            settings,
            dispatch,
            Arc::new(connector.clone()),
            registry.clone(),
            policy,
        );
        Harness {
            handle,
            connector,
            registry,
        }
    }

    fn harness() -> Harness {
        harness_with(ConnectionSettings::default(), DispatchSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_resubscribes_and_drains_lanes_in_priority_order() {
        let h = harness();
        let _sub = h.registry.on("oee_update", |_: &EventMessage| {}).unwrap();

        h.handle.send(Envelope::new("telemetry", json!({})), Priority::Low).unwrap();
        h.handle.send(Envelope::new("andon_call", json!({})), Priority::Critical).unwrap();
        h.handle.send(Envelope::new("count", json!({})), Priority::Normal).unwrap();
        settle().await;
        assert_eq!(h.handle.status().queued_messages, 3);

        h.handle.connect().await.unwrap();
        settle().await;

        let kinds: Vec<String> = h
            .connector
            .latest()
            .sent_envelopes()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec!["subscribe", "andon_call", "batch", "batch"]);
        assert!(h.handle.is_connected());
        assert_eq!(h.handle.status().queued_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_twelve_normal_messages_leave_as_two_batches() {
        let dispatch = DispatchSettings {
            batch_size: 10,
            ..DispatchSettings::default()
        };
        let h = harness_with(ConnectionSettings::default(), dispatch);
        h.handle.connect().await.unwrap();

        for n in 0..12 {
            h.handle
                .send(Envelope::new("count", json!({ "n": n })), Priority::Normal)
                .unwrap();
        }
        settle().await;

        let server = h.connector.latest();
        assert_eq!(server.sent_of_type("batch").len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let batches = server.sent_of_type("batch");
        let sizes: Vec<usize> = batches
            .iter()
            .map(|b| b.field("messages").and_then(Value::as_array).map_or(0, Vec::len))
            .collect();
        assert_eq!(sizes, vec![10, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_then_terminal_error() {
        let settings = ConnectionSettings {
            max_reconnect_attempts: 5,
            ..ConnectionSettings::default()
        };
        let h = harness_with(settings, DispatchSettings::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _sub = h
            .registry
            .on(protocol::CONNECTION_ERROR, move |e: &EventMessage| {
                sink.lock().unwrap().push(e.data.clone())
            })
            .unwrap();

        h.handle.connect().await.unwrap();
        h.connector.always_fail(true);
        h.connector.latest().close();

        let mut status = h.handle.watch_status();
        status
            .wait_for(|s| s.socket == SocketState::Error)
            .await
            .unwrap();

        // one successful open plus exactly five reconnect attempts
        let calls = h.connector.call_times();
        assert_eq!(calls.len(), 6);
        let gaps: Vec<Duration> = calls.windows(2).skip(1).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|w| w[1] > w[0]), "gaps {:?}", gaps);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.connector.calls(), 6);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(matches!(
            h.handle.connect().await,
            Err(SyncError::ReconnectExhausted { attempts: 5 })
        ));

        h.handle.reset().await.unwrap();
        h.connector.always_fail(false);
        h.handle.connect().await.unwrap();
        assert!(h.handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejected_while_offline() {
        let h = harness();
        h.handle.set_network(false).unwrap();
        assert!(matches!(h.handle.connect().await, Err(SyncError::Offline)));
        assert_eq!(h.connector.calls(), 0);

        // connectivity returns: the pending wish to connect is honoured
        h.handle.set_network(true).unwrap();
        settle().await;
        assert_eq!(h.connector.calls(), 1);
        assert!(h.handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_recoverable() {
        let h = harness();
        h.connector.hang_next(1);
        let err = h.handle.connect().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(10_000)));
        assert!(err.is_retryable());

        let status = h.handle.status();
        assert_eq!(status.socket, SocketState::Reconnecting);
        assert_eq!(status.reconnect_attempts, 1);

        let mut watch = h.handle.watch_status();
        watch.wait_for(|s| s.is_connected()).await.unwrap();
        assert_eq!(h.connector.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_retries_in_background() {
        let h = harness();
        h.connector.fail_next(2);
        let err = h.handle.connect().await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionFailed(_)));
        assert_eq!(h.connector.links(), 0);

        let status = h.handle.status();
        assert_eq!(status.socket, SocketState::Reconnecting);
        assert_eq!(status.last_error.as_deref(), Some("Connection failed: connection refused"));

        let mut watch = h.handle.watch_status();
        watch.wait_for(|s| s.is_connected()).await.unwrap();
        assert_eq!(h.connector.calls(), 3);
        assert_eq!(h.connector.links(), 1);
        assert_eq!(h.handle.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_suspends_reconnects() {
        let h = harness();
        h.handle.connect().await.unwrap();
        h.handle.set_network(false).unwrap();
        settle().await;

        let status = h.handle.status();
        assert_eq!(status.network, NetworkAvailability::Offline);
        assert!(!status.is_connected());
        assert!(h.connector.latest().is_closed());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.connector.calls(), 1);

        h.handle.set_network(true).unwrap();
        settle().await;
        assert_eq!(h.connector.calls(), 2);
        assert!(h.handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_measures_latency_and_detects_silence() {
        let settings = ConnectionSettings {
            heartbeat_interval_ms: 1_000,
            max_missed_heartbeats: 2,
            ..ConnectionSettings::default()
        };
        let h = harness_with(settings, DispatchSettings::default());
        h.handle.connect().await.unwrap();
        let server = h.connector.latest();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle().await;
        let pings = server.sent_of_type("ping");
        assert_eq!(pings.len(), 1);
        let ping_id = pings[0].field("pingId").and_then(Value::as_str).unwrap().to_string();

        tokio::time::sleep(Duration::from_millis(40)).await;
        server.push(Envelope::new("pong", json!({ "pingId": ping_id })));
        settle().await;
        let latency = h.handle.status().latency_ms.unwrap();
        assert!((40..50).contains(&latency), "latency {}", latency);

        // stop answering: two missed pings drop the link
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert!(server.is_dropped());
        assert_eq!(h.handle.status().socket, SocketState::Reconnecting);
        assert_eq!(h.handle.status().reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_ping_gets_pong_and_events_fan_out() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h
            .registry
            .on("andon_call", move |e: &EventMessage| sink.lock().unwrap().push(e.data.clone()))
            .unwrap();
        h.handle.connect().await.unwrap();
        let server = h.connector.latest();

        server.push(Envelope::new("ping", json!({ "pingId": "srv-1" })));
        server.push_raw(
            r#"{"type":"batch","data":{"messages":[
                {"type":"andon_call","data":{"station":1}},
                {"type":"andon_call","data":{"station":2}}]}}"#,
        );
        server.push_raw("{garbage");
        settle().await;

        let pongs = server.sent_of_type("pong");
        assert_eq!(pongs.len(), 1);
        assert_eq!(pongs[0].field("pingId"), Some(&json!("srv-1")));
        assert_eq!(seen.lock().unwrap().len(), 2);

        let status = h.handle.status();
        assert_eq!(status.parse_errors, 1);
        assert_eq!(status.messages_received, 3);
        assert!(status.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_ids_unique_per_session() {
        let h = harness();
        h.handle.connect().await.unwrap();
        for n in 0..3 {
            h.handle
                .send(Envelope::new("cmd", json!({ "n": n })), Priority::High)
                .unwrap();
        }
        settle().await;

        let session = h.handle.status().session_id.unwrap();
        let ids: Vec<String> = h
            .connector
            .latest()
            .sent_envelopes()
            .into_iter()
            .filter_map(|e| e.id)
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id.starts_with(&session)));
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(unique, ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_requeues_and_redelivers() {
        let h = harness();
        h.handle.connect().await.unwrap();
        h.connector.fail_writes(true);
        h.handle
            .send(Envelope::new("andon_call", json!({"station": 7})), Priority::Critical)
            .unwrap();
        settle().await;
        assert_eq!(h.handle.status().socket, SocketState::Reconnecting);
        assert_eq!(h.handle.status().queued_messages, 1);

        h.connector.fail_writes(false);
        let mut watch = h.handle.watch_status();
        watch.wait_for(|s| s.is_connected()).await.unwrap();
        settle().await;

        let delivered = h.connector.latest().sent_of_type("andon_call");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data["station"], json!(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_keeps_lanes() {
        let h = harness();
        h.handle.connect().await.unwrap();
        h.handle.disconnect().await.unwrap();
        h.handle.disconnect().await.unwrap();
        assert_eq!(h.handle.status().socket, SocketState::Disconnected);

        h.handle.send(Envelope::new("count", json!({})), Priority::Normal).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.calls(), 1);
        assert_eq!(h.handle.status().queued_messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_changes_reach_server() {
        let h = harness();
        h.handle.connect().await.unwrap();
        let sub = h.registry.on("oee_update", |_: &EventMessage| {}).unwrap();
        settle().await;
        drop(sub);
        settle().await;

        let kinds: Vec<String> = h
            .connector
            .latest()
            .sent_envelopes()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec!["subscribe", "unsubscribe"]);
    }
}
