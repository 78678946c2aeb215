//! # shopfloor-sync: Resilient Sync Layer for Shopfloor Link
//!
//! Keeps a floor client (operator tablet, line terminal) talking to the
//! manufacturing backend over plant networks that drop out constantly.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Shopfloor Sync Layer                             │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 ShopfloorClient (one per instance)                │  │
//! │  │                                                                  │  │
//! │  │  Built with ShopfloorClientBuilder, owns every task below        │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ NetworkMonitor │  │ Connection     │  │ SubscriptionRegistry   │    │
//! │  │                │  │ Manager        │  │                        │    │
//! │  │ OS signal +    │─►│ WS actor,      │─►│ typed fan-out with     │    │
//! │  │ latency probe  │  │ heartbeat,     │  │ payload filters and    │    │
//! │  │                │  │ backoff, lanes │  │ disposable handles     │    │
//! │  └────────────────┘  └───────▲────────┘  └────────────────────────┘    │
//! │                              │ entity_op                                │
//! │  ┌────────────────┐  ┌───────┴────────┐                                │
//! │  │ OfflineAction  │◄─│ SyncReconciler │                                │
//! │  │ Queue          │  │                │                                │
//! │  │ durable, with  │  │ replays queue, │                                │
//! │  │ dependencies   │  │ settles        │                                │
//! │  │                │  │ conflicts      │                                │
//! │  └───────┬────────┘  └────────────────┘                                │
//! │          ▼                                                              │
//! │    ActionStore (shopfloor-store SQLite, or in-memory)                  │
//! │                                                                         │
//! │  LOCAL EVENTS (through the registry):                                  │
//! │  • "connection:state" / "connection:health" / "connection:error"       │
//! │  • "sync:conflict" / "sync:action_failed" / "sync:pass_complete"       │
//! │  • "server:error"                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Channel
//! - [`connection`] - Connection manager actor and its handle
//! - [`dispatcher`] - Four priority lanes with batching
//! - [`reconnect`] - Exponential backoff with per-client jitter
//! - [`transport`] - Framed text channel (tokio-tungstenite)
//! - [`protocol`] - Wire message types and control messages
//! - [`network`] - Connectivity signal and latency probe
//!
//! ### Data
//! - [`subscription`] - Event subscriptions
//! - [`queue`] - Offline action queue
//! - [`store`] - Durable backing for the queue
//! - [`reconciler`] - Queue replay and conflict handling
//! - [`remote`] - Entity service over the channel
//!
//! ### Shared
//! - [`client`] - Wiring of all of the above
//! - [`config`] - TOML configuration and presets
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shopfloor_sync::{ShopfloorClient, SyncConfig};
//! use shopfloor_core::NewAction;
//!
//! let config = SyncConfig::load_or_default(None);
//! let client = ShopfloorClient::builder(config).build().await?;
//! client.connect().await?;
//!
//! client
//!     .submit_action(NewAction::update("work_order", "wo-17", json!({"qty": 40})))
//!     .await?;
//!
//! let stats = client.queue_stats().await;
//! println!("Pending: {}", stats.pending);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Channel
pub mod connection;
pub mod dispatcher;
pub mod network;
pub mod protocol;
pub mod reconnect;
pub mod transport;

// Data
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod store;
pub mod subscription;

// Shared
pub mod client;
pub mod config;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{ShopfloorClient, ShopfloorClientBuilder};
pub use config::{
    ConnectionSettings, DeviceConfig, DispatchSettings, NetworkSettings, Preset, QueueSettings,
    SyncConfig,
};
pub use connection::{ConnectionHandle, ConnectionManager};
pub use dispatcher::{Frame, OutboundMessage, PriorityDispatcher};
pub use error::{SyncError, SyncResult};
pub use network::{
    LatencyProbe, NetworkApi, NetworkHandle, NetworkMonitor, NetworkSignal, TcpLatencyProbe,
};
pub use protocol::{EventMessage, InboundEvent};
pub use queue::OfflineActionQueue;
pub use reconciler::{PassReport, ReconcilerHandle, SyncReconciler};
pub use reconnect::ReconnectPolicy;
pub use remote::{ChannelEntityService, EntityService, RemoteAck, RemoteError, RemoteResult};
pub use store::{ActionStore, MemoryStore};
pub use subscription::{
    EventCallback, EventFilter, SubscriptionHandle, SubscriptionId, SubscriptionRegistry,
};
pub use transport::{Connector, FrameReader, FrameWriter, TungsteniteConnector};

pub use shopfloor_core::{
    ActionFilter, ActionId, ActionStatus, ActionVerb, ConflictRecord, ConnectionStatus, Envelope,
    NetworkAvailability, NetworkQuality, NetworkStatus, NewAction, Priority, QueueStats,
    QueuedAction, ResolutionStrategy, SocketState,
};
