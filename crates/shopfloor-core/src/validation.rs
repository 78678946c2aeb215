//! # Validation Module
//!
//! Input checks applied before anything reaches the offline queue or the wire.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Dashboard (TypeScript)                                       │
//! │  └── Form-level checks, immediate operator feedback                    │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Client context (Rust)                                        │
//! │  └── THIS MODULE: action and event-type rules                          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                                                       │
//! │  └── NOT NULL / CHECK constraints on queued_actions                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use shopfloor_core::action::NewAction;
//! use shopfloor_core::validation::validate_new_action;
//! use serde_json::json;
//!
//! let action = NewAction::update("work_order", "wo-17", json!({ "qty": 4 }));
//! assert!(validate_new_action(&action).is_ok());
//! ```

use crate::action::{ActionVerb, NewAction};
use crate::error::ValidationError;
use crate::{MAX_ACTION_PRIORITY, MAX_ENTITY_ID_LEN, MAX_ENTITY_TYPE_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted event type name.
pub const MAX_EVENT_TYPE_LEN: usize = 96;

// =============================================================================
// String Validators
// =============================================================================

fn validate_identifier(value: &str, field: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates an entity type name such as `work_order`.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Letters, numbers, underscores, hyphens and dots only
pub fn validate_entity_type(entity_type: &str) -> ValidationResult<()> {
    validate_identifier(entity_type, "entity_type", MAX_ENTITY_TYPE_LEN)?;

    if !entity_type
        .trim()
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: "entity_type".to_string(),
            reason: "must contain only letters, numbers, underscores, hyphens, and dots"
                .to_string(),
        });
    }

    Ok(())
}

pub fn validate_entity_id(entity_id: &str) -> ValidationResult<()> {
    validate_identifier(entity_id, "entity_id", MAX_ENTITY_ID_LEN)
}

/// Validates an event type used for subscriptions and outbound messages.
///
/// Local event types use a `namespace:name` form (`connection:state`), so
/// colons are accepted alongside the entity-type alphabet.
pub fn validate_event_type(event_type: &str) -> ValidationResult<()> {
    validate_identifier(event_type, "event_type", MAX_EVENT_TYPE_LEN)?;

    if event_type.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: "event_type".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Action Validators
// =============================================================================

pub fn validate_action_priority(priority: u8) -> ValidationResult<()> {
    if priority > MAX_ACTION_PRIORITY {
        return Err(ValidationError::OutOfRange {
            field: "priority".to_string(),
            min: 0,
            max: MAX_ACTION_PRIORITY as i64,
        });
    }
    Ok(())
}

/// Validates an action before it is queued.
///
/// ## Rules
/// - Entity type and id pass their string rules
/// - Priority within 0..=10
/// - Create and update carry a JSON object payload
/// - Delete and sync carry an object or null
pub fn validate_new_action(action: &NewAction) -> ValidationResult<()> {
    validate_entity_type(&action.entity_type)?;
    validate_entity_id(&action.entity_id)?;
    if let Some(priority) = action.priority {
        validate_action_priority(priority)?;
    }

    let payload_ok = match action.verb {
        ActionVerb::Create | ActionVerb::Update => action.payload.is_object(),
        ActionVerb::Delete | ActionVerb::Sync => {
            action.payload.is_object() || action.payload.is_null()
        }
    };

    if !payload_ok {
        return Err(ValidationError::InvalidFormat {
            field: "payload".to_string(),
            reason: format!("{} requires a JSON object", action.verb),
        });
    }

    Ok(())
}
