//! # Shopfloor Client
//!
//! Owns one instance of every component and wires them together. Nothing
//! is global: several clients can run side by side in one process.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ShopfloorClient                                │
//! │                                                                         │
//! │   NetworkMonitor ──set_network──► ConnectionManager ◄──send── app      │
//! │        │                               │      ▲                         │
//! │        │ trigger                       │      │ entity_op               │
//! │        ▼                     inbound   │      │                         │
//! │   SyncReconciler ◄──status watch───────┤  ChannelEntityService         │
//! │        │                               ▼      ▲                         │
//! │        │                     SubscriptionRegistry ──► app callbacks    │
//! │        ▼                               │ entity_result                  │
//! │   OfflineActionQueue ──► ActionStore   └──────┘                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shopfloor_sync::{ShopfloorClient, SyncConfig, Priority};
//!
//! let client = ShopfloorClient::builder(SyncConfig::tablet())
//!     .with_store(Arc::new(database))
//!     .build()
//!     .await?;
//!
//! let _andon = client.on("andon_call", |event| println!("{:?}", event.data))?;
//! client.connect().await?;
//! client.send("count", json!({"station": 4, "good": 12}), Priority::Normal)?;
//! ```

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use shopfloor_core::{
    ActionFilter, ActionId, ConflictRecord, ConnectionStatus, Envelope, NetworkStatus, NewAction,
    Priority, QueueStats, QueuedAction, ResolutionStrategy,
};

use crate::config::SyncConfig;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::error::SyncResult;
use crate::network::{
    LatencyProbe, NetworkApi, NetworkHandle, NetworkMonitor, NetworkSignal, TcpLatencyProbe,
};
use crate::protocol::EventMessage;
use crate::queue::OfflineActionQueue;
use crate::reconciler::{PassReport, ReconcilerHandle, SyncReconciler};
use crate::remote::{ChannelEntityService, EntityService};
use crate::store::{ActionStore, MemoryStore};
use crate::subscription::{
    EventFilter, SubscriptionHandle, SubscriptionId, SubscriptionRegistry,
};
use crate::transport::{Connector, TungsteniteConnector};

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ShopfloorClient`]. Every collaborator has a default.
pub struct ShopfloorClientBuilder {
    config: SyncConfig,
    connector: Option<Arc<dyn Connector>>,
    store: Option<Arc<dyn ActionStore>>,
    service: Option<Arc<dyn EntityService>>,
    network: Option<Arc<dyn NetworkApi>>,
    probe: Option<Arc<dyn LatencyProbe>>,
    probing: bool,
}

impl ShopfloorClientBuilder {
    pub fn new(config: SyncConfig) -> Self {
        ShopfloorClientBuilder {
            config,
            connector: None,
            store: None,
            service: None,
            network: None,
            probe: None,
            probing: true,
        }
    }

    /// Transport. Defaults to tokio-tungstenite against `server_url`.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Durable store. Defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn ActionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Backend for queued actions. Defaults to `entity_op` over the socket.
    pub fn with_entity_service(mut self, service: Arc<dyn EntityService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Connectivity signal. Defaults to a [`NetworkSignal`] the host drives
    /// through [`ShopfloorClient::set_online`].
    pub fn with_network(mut self, network: Arc<dyn NetworkApi>) -> Self {
        self.network = Some(network);
        self
    }

    /// Latency probe. Defaults to a TCP probe against the health endpoint.
    pub fn with_probe(mut self, probe: Arc<dyn LatencyProbe>) -> Self {
        self.probe = Some(probe);
        self.probing = true;
        self
    }

    /// Disables latency probing; the network signal alone decides.
    pub fn without_probe(mut self) -> Self {
        self.probe = None;
        self.probing = false;
        self
    }

    fn default_probe(config: &SyncConfig) -> SyncResult<Arc<dyn LatencyProbe>> {
        let target = config
            .network
            .health_endpoint
            .as_deref()
            .unwrap_or(config.server_url());
        Ok(Arc::new(TcpLatencyProbe::from_url(
            target,
            config.network.probe_timeout(),
        )?))
    }

    /// Validates the config, loads the queue and starts every task.
    pub async fn build(self) -> SyncResult<ShopfloorClient> {
        let config = self.config;
        config.validate()?;

        let registry = SubscriptionRegistry::new();

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TungsteniteConnector::new(config.server_url())?),
        };
        let (connection, connection_task) = ConnectionManager::spawn(
            config.connection.clone(),
            config.dispatch.clone(),
            connector,
            registry.clone(),
        );

        let store: Arc<dyn ActionStore> = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let queue = OfflineActionQueue::load(store, config.queue.clone()).await?;

        let service: Arc<dyn EntityService> = match self.service {
            Some(service) => service,
            None => Arc::new(ChannelEntityService::new(
                connection.clone(),
                &registry,
                config.queue.request_timeout(),
            )?),
        };

        let reconciler = Arc::new(SyncReconciler::new(
            queue.clone(),
            service,
            registry.clone(),
        ));
        let (reconciler_handle, reconciler_task) = reconciler
            .clone()
            .spawn(connection.watch_status(), config.queue.sync_interval());

        let (network_api, signal): (Arc<dyn NetworkApi>, Option<NetworkSignal>) = match self.network {
            Some(api) => (api, None),
            None => {
                let signal = NetworkSignal::default();
                (Arc::new(signal.clone()), Some(signal))
            }
        };
        let probe = match (self.probing, self.probe) {
            (false, _) => None,
            (true, Some(probe)) => Some(probe),
            (true, None) => Some(Self::default_probe(&config)?),
        };
        let (network, network_task) = NetworkMonitor::spawn(
            config.network.clone(),
            network_api.as_ref(),
            probe,
            connection.clone(),
            Some(reconciler_handle.clone()),
        );

        info!(
            device_id = %config.device_id(),
            server_url = %config.server_url(),
            "Shopfloor client ready"
        );

        Ok(ShopfloorClient {
            config,
            registry,
            connection,
            queue,
            reconciler,
            reconciler_handle,
            network,
            signal,
            tasks: Mutex::new(vec![connection_task, reconciler_task, network_task]),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

pub struct ShopfloorClient {
    config: SyncConfig,
    registry: SubscriptionRegistry,
    connection: ConnectionHandle,
    queue: OfflineActionQueue,
    reconciler: Arc<SyncReconciler>,
    reconciler_handle: ReconcilerHandle,
    network: NetworkHandle,
    signal: Option<NetworkSignal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShopfloorClient {
    pub fn builder(config: SyncConfig) -> ShopfloorClientBuilder {
        ShopfloorClientBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // =========================================================================
    // Connection
    // =========================================================================

    pub async fn connect(&self) -> SyncResult<()> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> SyncResult<()> {
        self.connection.disconnect().await
    }

    /// Clears a terminal connection error.
    pub async fn reset(&self) -> SyncResult<()> {
        self.connection.reset().await
    }

    /// Queues a message for the server.
    pub fn send(&self, event_type: &str, data: Value, priority: Priority) -> SyncResult<()> {
        self.send_envelope(Envelope::new(event_type, data), priority)
    }

    pub fn send_envelope(&self, envelope: Envelope, priority: Priority) -> SyncResult<()> {
        self.connection.send(envelope.with_priority(priority), priority)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    // =========================================================================
    // Network
    // =========================================================================

    pub fn network_status(&self) -> NetworkStatus {
        self.network.status()
    }

    pub fn watch_network(&self) -> watch::Receiver<NetworkStatus> {
        self.network.watch_status()
    }

    /// Feeds the built-in network signal. Ignored when the builder was given
    /// its own [`NetworkApi`].
    pub fn set_online(&self, online: bool) {
        match &self.signal {
            Some(signal) => signal.set_online(online),
            None => warn!("set_online ignored: network is driven by a custom NetworkApi"),
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub fn subscribe<F>(
        &self,
        event_type: &str,
        filter: Option<EventFilter>,
        callback: F,
    ) -> SyncResult<SubscriptionHandle>
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.registry.subscribe(event_type, filter, Arc::new(callback))
    }

    pub fn on<F>(&self, event_type: &str, callback: F) -> SyncResult<SubscriptionHandle>
    where
        F: Fn(&EventMessage) + Send + Sync + 'static,
    {
        self.registry.on(event_type, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    // =========================================================================
    // Offline Actions
    // =========================================================================

    /// Queues an entity change and nudges the reconciler.
    pub async fn submit_action(&self, action: NewAction) -> SyncResult<QueuedAction> {
        let queued = self.queue.add_action(action).await?;
        self.reconciler_handle.trigger();
        Ok(queued)
    }

    pub async fn get_actions(&self, filter: &ActionFilter) -> Vec<QueuedAction> {
        self.queue.get_actions(filter).await
    }

    pub async fn cancel_action(&self, id: ActionId) -> SyncResult<bool> {
        self.queue.cancel(id).await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.queue.conflicts().await
    }

    pub async fn purge_finished(&self) -> SyncResult<usize> {
        self.queue.purge_finished().await
    }

    /// Drops finished actions older than the configured retention.
    pub async fn cleanup(&self) -> SyncResult<usize> {
        self.queue.cleanup(self.config.queue.retention()).await
    }

    pub async fn clear_failed(&self) -> SyncResult<usize> {
        self.queue.clear_failed().await
    }

    pub fn queue(&self) -> &OfflineActionQueue {
        &self.queue
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Runs a sync pass now. Fails with `Offline` while disconnected.
    pub async fn sync_now(&self) -> SyncResult<PassReport> {
        self.reconciler_handle.sync_now().await
    }

    pub async fn resolve_conflict(
        &self,
        id: ActionId,
        strategy: ResolutionStrategy,
        resolver: &str,
    ) -> SyncResult<QueuedAction> {
        let action = self.reconciler.resolve_conflict(id, strategy, resolver).await?;
        self.reconciler_handle.trigger();
        Ok(action)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops every task. Queued actions stay in the store.
    pub async fn shutdown(&self) {
        info!("Shutting down shopfloor client");
        self.network.shutdown();
        self.reconciler_handle.shutdown();
        self.connection.shutdown();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Client task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::protocol;
    use crate::testing::{settle, MemoryConnector, ServerEnd};
    use serde_json::json;
    use shopfloor_core::{ActionStatus, SocketState};
    use std::sync::Mutex as StdMutex;

    async fn client(connector: &MemoryConnector) -> ShopfloorClient {
        ShopfloorClient::builder(SyncConfig::tablet())
            .with_connector(Arc::new(connector.clone()))
            .without_probe()
            .build()
            .await
            .unwrap()
    }

    /// Acknowledges every entity_op on `server`, versions counting from 1.
    fn auto_ack(server: ServerEnd) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut answered = 0;
            loop {
                settle().await;
                let ops = server.sent_of_type(protocol::ENTITY_OP);
                for op in ops.iter().skip(answered) {
                    answered += 1;
                    server.push(Envelope::new(
                        protocol::ENTITY_RESULT,
                        json!({
                            "requestId": op.data["requestId"],
                            "status": "ok",
                            "version": answered,
                        }),
                    ));
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_edits_replay_in_order_after_connect() {
        let connector = MemoryConnector::new();
        let client = client(&connector).await;

        client
            .submit_action(NewAction::create("work_order", "wo-1", json!({"qty": 5})))
            .await
            .unwrap();
        client
            .submit_action(NewAction::update("work_order", "wo-1", json!({"qty": 7})))
            .await
            .unwrap();
        client
            .submit_action(NewAction::delete("work_order", "wo-1"))
            .await
            .unwrap();
        assert_eq!(client.queue_stats().await.pending, 3);

        client.connect().await.unwrap();
        let responder = auto_ack(connector.latest());

        for _ in 0..200 {
            if client.queue_stats().await.completed == 3 {
                break;
            }
            settle().await;
        }
        responder.abort();

        let ops: Vec<String> = connector
            .latest()
            .sent_of_type(protocol::ENTITY_OP)
            .iter()
            .map(|e| e.data["op"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ops, vec!["create", "update", "delete"]);

        let done = client
            .get_actions(&ActionFilter::with_status(ActionStatus::Completed))
            .await;
        assert_eq!(done.len(), 3);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_now_requires_connection() {
        let connector = MemoryConnector::new();
        let client = client(&connector).await;
        assert!(matches!(client.sync_now().await, Err(SyncError::Offline)));

        client.connect().await.unwrap();
        let report = client.sync_now().await.unwrap();
        assert_eq!(report.attempted, 0);
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_online_drives_connection() {
        let connector = MemoryConnector::new();
        let client = client(&connector).await;
        let states = Arc::new(StdMutex::new(Vec::new()));
        let sink = states.clone();
        let _sub = client
            .on(protocol::CONNECTION_STATE, move |e: &EventMessage| {
                sink.lock().unwrap().push(e.data["socket"].clone())
            })
            .unwrap();

        client.connect().await.unwrap();
        client.set_online(false);
        settle().await;
        assert!(!client.is_connected());
        assert!(!client.network_status().availability.is_online());

        client.set_online(true);
        settle().await;
        assert!(client.is_connected());
        assert!(states.lock().unwrap().contains(&json!("connected")));
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_are_isolated() {
        let first_connector = MemoryConnector::new();
        let second_connector = MemoryConnector::new();
        let first = client(&first_connector).await;
        let second = client(&second_connector).await;

        first.connect().await.unwrap();
        first.send("count", json!({"good": 1}), Priority::High).unwrap();
        settle().await;

        assert!(first.is_connected());
        assert_eq!(second.status().socket, SocketState::Disconnected);
        assert_eq!(second_connector.calls(), 0);
        assert_eq!(first_connector.latest().sent_of_type("count").len(), 1);

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = SyncConfig::tablet();
        config.connection.server_url = "http://plant.local/ws".into();
        let result = ShopfloorClient::builder(config).without_probe().build().await;
        assert!(matches!(result, Err(e) if e.is_config_error()));
    }
}
