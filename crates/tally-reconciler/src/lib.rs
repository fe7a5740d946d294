// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tally Reconciler - leader-elected reconciliation controllers
//!
//! Runs singleton polling loops that keep the billing store in step with
//! external systems. Expensive work is delegated to an external flow service
//! and polled to completion across restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       ReconcilerRuntime                             │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌────────────────────┐   │
//! │  │   bill_sync    │  │  exchange_rate   │  │    sub_ticket      │   │
//! │  │  (60s, gated)  │  │  (1h, gated)     │  │  (30s, gated)      │   │
//! │  └────────────────┘  └──────────────────┘  └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//!        │        │              │                       │
//!        │        ▼              ▼                       ▼
//!        │  ┌───────────┐  ┌────────────┐        ┌───────────────┐
//!        │  │   Flow    │  │    Rate    │        │   Ticketing   │
//!        │  │  service  │  │   source   │        │    service    │
//!        │  └───────────┘  └────────────┘        └───────────────┘
//!        ▼
//! ┌──────────────────┐   ┌────────────────────────┐
//! │ Billing notifier │   │ Store (SQLite/Postgres)│
//! └──────────────────┘   └────────────────────────┘
//! ```
//!
//! # Activities
//!
//! | Activity | Work per tick |
//! |----------|---------------|
//! | `bill_sync` | Advance each active sync record one step |
//! | `exchange_rate` | Insert missing rates of the previous two periods |
//! | `sub_ticket` | Open approval tickets and apply their outcomes |
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables read by the binary.

#![deny(missing_docs)]

/// Bill synchronization controller and vendor table.
pub mod bill_sync;

/// External service clients (HTTP and in-memory).
pub mod clients;

/// Configuration loading.
pub mod config;

/// Error types.
pub mod error;

/// Exchange rate reconciliation.
pub mod exchange_rate;

/// Embeddable runtime.
pub mod runtime;

/// Sub-ticket approval watcher.
pub mod sub_ticket;

/// Reconciliation loop and the activity trait.
pub mod worker;

pub use error::{Error, Result};
pub use runtime::ReconcilerRuntime;
pub use worker::{Activity, LoopConfig, ReconciliationLoop};
