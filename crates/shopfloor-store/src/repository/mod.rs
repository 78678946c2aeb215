//! # Repository Module
//!
//! Repository implementations for the action queue store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  shopfloor-sync (ActionStore impl for Database)                        │
//! │       │                                                                 │
//! │       │  db.actions().upsert(&action)                                  │
//! │       ▼                                                                 │
//! │  QueuedActionRepository / EntitySnapshotRepository                                 │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`QueuedActionRepository`](actions::QueuedActionRepository) - Offline action queue rows
//! - [`EntitySnapshotRepository`](snapshots::EntitySnapshotRepository) - Cached server copies

pub mod actions;
pub mod snapshots;
