// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tally-reconciler.

use thiserror::Error;

/// Reconciler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store or domain operation failed.
    #[error("Core error: {0}")]
    Core(#[from] tally_core::CoreError),

    /// Flow service call failed.
    #[error("Flow error: {0}")]
    Flow(#[from] tally_core::FlowError),

    /// External service call failed.
    #[error("Client error: {0}")]
    Client(#[from] crate::clients::ClientError),

    /// Database connection failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using reconciler Error.
pub type Result<T> = std::result::Result<T, Error>;
