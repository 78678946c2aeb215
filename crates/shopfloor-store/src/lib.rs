//! # shopfloor-store: Durable Storage for Shopfloor Link
//!
//! SQLite persistence for the offline action queue. Queued actions survive
//! restarts so work captured on the floor during an outage is never lost.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Shopfloor Link Data Flow                           │
//! │                                                                         │
//! │  OfflineActionQueue (shopfloor-sync)                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 shopfloor-store (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│ ActionRepo    │    │  (embedded)  │  │   │
//! │  │   │ SqlitePool    │    │ SnapshotRepo  │    │ 001_init.sql │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file under the agent's data directory                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shopfloor_store::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("queue.db")).await?;
//! let pending = db.actions().load_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::actions::QueuedActionRepository;
pub use repository::snapshots::EntitySnapshotRepository;
