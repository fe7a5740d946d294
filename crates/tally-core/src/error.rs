// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tally-core.
//!
//! Provides a unified error type with stable machine-readable codes so that
//! controllers can log and classify failures at the tick boundary.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while reconciling records.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A conditional transition affected a different number of rows than
    /// the caller named explicitly.
    Conflict {
        /// The table the transition ran against.
        table: String,
        /// Number of rows the caller expected to move.
        expected: u64,
        /// Number of rows actually moved.
        effected: u64,
    },

    /// Requested status transition is not allowed.
    InvalidTransition {
        /// Source status.
        from: String,
        /// Target status.
        to: String,
    },

    /// Vendor has no entry in the vendor table.
    UnknownVendor {
        /// The vendor tag as stored.
        vendor: String,
    },

    /// Persisted checkpoint could not be decoded.
    CheckpointDecodeFailed {
        /// The record owning the checkpoint.
        record_id: String,
        /// Decoder error details.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::UnknownVendor { .. } => "UNKNOWN_VENDOR",
            Self::CheckpointDecodeFailed { .. } => "CHECKPOINT_DECODE_FAILED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the error means another actor changed the rows first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict {
                table,
                expected,
                effected,
            } => {
                write!(
                    f,
                    "Conflicting update on '{}': expected {} rows, moved {}",
                    table, expected, effected
                )
            }
            Self::InvalidTransition { from, to } => {
                write!(f, "Transition from '{}' to '{}' is not allowed", from, to)
            }
            Self::UnknownVendor { vendor } => {
                write!(f, "Unknown vendor '{}'", vendor)
            }
            Self::CheckpointDecodeFailed { record_id, reason } => {
                write!(
                    f,
                    "Failed to decode checkpoint of record '{}': {}",
                    record_id, reason
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
