// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tally Core - reconciliation primitives
//!
//! This crate holds everything the reconciliation controllers share: the
//! persisted data model, the checkpoint codec, guarded status transitions,
//! leadership gates, the contract with the external flow service, and the
//! SQLite / PostgreSQL stores.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       tally-reconciler                              │
//! │   (ReconciliationLoop: bill sync, exchange rates, sub-tickets)      │
//! └─────────────────────────────────────────────────────────────────────┘
//!        │ is_leader()        │ create/get flow          │ filter/patch
//!        ▼                    ▼                          ▼
//! ┌──────────────┐   ┌─────────────────┐   ┌─────────────────────────────┐
//! │  LeaderGate  │   │  FlowDelegate   │   │  Store (+ CasStatusUpdater) │
//! └──────────────┘   └─────────────────┘   └─────────────────────────────┘
//!                                                        │
//!                                                        ▼
//!                                          ┌─────────────────────────────┐
//!                                          │    PostgreSQL / SQLite      │
//!                                          └─────────────────────────────┘
//! ```
//!
//! # Consistency
//!
//! Controllers never hold locks. Every write is one of:
//!
//! | Kind | Mechanism |
//! |------|-----------|
//! | Additive | `INSERT ... ON CONFLICT DO NOTHING` |
//! | Conditional | [`persistence::Store::update_where`] with the expected state in the filter |
//! | Owned | Checkpoint rewrite by the current leader |

#![deny(missing_docs)]

/// Compare-and-swap status transitions.
pub mod cas;

/// Per-record sub-item progress and its JSON codec.
pub mod checkpoint;

/// Error types with stable codes.
pub mod error;

/// Filter, page and patch expressions for store queries.
pub mod filter;

/// Flow service contract and in-memory mock.
pub mod flow;

/// Leadership gates.
pub mod leader;

/// Embedded database migrations.
pub mod migrations;

/// Store trait and database backends.
pub mod persistence;

/// Domain value types.
pub mod types;

pub use cas::{CasStatusUpdater, StatusTransition};
pub use checkpoint::{Checkpoint, SyncItem, SyncItemState};
pub use error::CoreError;
pub use filter::{Filter, Page, Patch, Value};
pub use flow::{FlowDelegate, FlowError, FlowState, MockFlowDelegate, TaskKind, TaskSpec};
pub use leader::{LeaderGate, LeaseLeaderGate, MIN_LEASE_TTL, StaticLeaderGate};
pub use persistence::{PostgresStore, SqliteStore, Store, Table};
pub use types::{CostColumn, Period, SubTicketStatus, SyncRecordState, Vendor};
