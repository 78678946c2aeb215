//! # shopfloor-core: Pure Types for Shopfloor Link
//!
//! Everything the synchronization layer agrees on, with zero I/O:
//! the wire envelope, priority lanes, queued actions, conflict records
//! and the connection health score.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Shopfloor Link Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Dashboard (screens, state store)                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ subscribe / submit / status            │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 shopfloor-sync (client context)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ shopfloor-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  action   │  │  health   │  │ validation│  │   │
//! │  │   │ Envelope  │  │ Queued    │  │ Tracker   │  │  rules    │  │   │
//! │  │   │ Priority  │  │ Conflict  │  │ Weights   │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Envelope, priority, connection status
//! - [`action`] - Queued actions, filters, conflict records
//! - [`health`] - Connection health scoring
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use shopfloor_core::types::{Envelope, Priority};
//! use serde_json::json;
//!
//! let msg = Envelope::new("andon_call", json!({ "lineId": "L1" }))
//!     .with_priority(Priority::Critical);
//!
//! let wire = msg.to_json().unwrap();
//! assert!(wire.contains("\"priority\":1"));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod action;
pub mod error;
pub mod health;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use action::*;
pub use error::{CoreError, CoreResult, ValidationError};
pub use health::{HealthThresholds, HealthTracker, HealthWeights};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Highest priority an offline action may carry.
pub const MAX_ACTION_PRIORITY: u8 = 10;

/// Priority assigned to actions submitted without one.
pub const DEFAULT_ACTION_PRIORITY: u8 = 5;

/// Retry budget assigned to actions submitted without one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Longest accepted entity type name.
pub const MAX_ENTITY_TYPE_LEN: usize = 64;

/// Longest accepted entity id.
pub const MAX_ENTITY_ID_LEN: usize = 128;
