//! # Error Types
//!
//! Domain-specific error types for shopfloor-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  shopfloor-core errors (this file)                                     │
//! │  ├── CoreError        - Unknown enum codes, malformed envelopes        │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  shopfloor-store errors (separate crate)                               │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  shopfloor-sync errors (separate crate)                                │
//! │  └── SyncError        - Connection, queue and reconcile failures       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → observable status     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while decoding or building domain values.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Priority outside the 1..=4 lane range.
    #[error("Unknown message priority: {0} (expected 1-4)")]
    UnknownPriority(u8),

    /// Unrecognized action verb.
    #[error("Unknown action verb: {0}")]
    UnknownVerb(String),

    /// Unrecognized action status.
    #[error("Unknown action status: {0}")]
    UnknownStatus(String),

    /// Unrecognized conflict resolution strategy.
    #[error("Unknown resolution strategy: {0}")]
    UnknownStrategy(String),

    /// Envelope could not be decoded from the wire.
    ///
    /// ## When This Occurs
    /// - Frame is not JSON
    /// - `type` field missing or not a string
    /// - `priority` present but out of range
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., payload is not a JSON object).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CoreError::UnknownPriority(9).to_string(),
            "Unknown message priority: 9 (expected 1-4)"
        );

        let err = ValidationError::TooLong {
            field: "entity_type".to_string(),
            max: 64,
        };
        assert_eq!(err.to_string(), "entity_type must be at most 64 characters");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "entity_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
