// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compare-and-swap status transitions.
//!
//! A transition is a single conditional update: the filter names the scope and
//! the expected current status, the patch names the target. Nothing is read
//! first, so two pollers racing on the same rows can never both win.
//!
//! ```ignore
//! let moved = CasStatusUpdater::new(store)
//!     .transition(
//!         &StatusTransition::new(ticket_id, SubTicketStatus::Init, SubTicketStatus::Auditing)
//!             .with_ids([11, 12]),
//!     )
//!     .await?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::filter::{Filter, Patch};
use crate::persistence::{Store, Table, columns};
use crate::types::SubTicketStatus;

/// A requested sub-ticket status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    /// Parent ticket scoping the rows.
    pub ticket_id: i64,
    /// Status the rows must currently be in.
    pub from: SubTicketStatus,
    /// Status to move them to.
    pub to: SubTicketStatus,
    /// Explicit rows to move. When set, all of them must move.
    pub ids: Option<Vec<i64>>,
    /// Message stored alongside the new status.
    pub message: Option<String>,
}

impl StatusTransition {
    /// Transition every `from` row of a ticket to `to`.
    pub fn new(ticket_id: i64, from: SubTicketStatus, to: SubTicketStatus) -> Self {
        Self {
            ticket_id,
            from,
            to,
            ids: None,
            message: None,
        }
    }

    /// Restrict the transition to explicit row IDs. Repeats are dropped.
    pub fn with_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        let distinct: BTreeSet<i64> = ids.into_iter().collect();
        self.ids = Some(distinct.into_iter().collect());
        self
    }

    /// Attach a status message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Check the transition before touching the store.
    pub fn validate(&self) -> Result<()> {
        if !self.from.can_transition_to(self.to) {
            return Err(CoreError::InvalidTransition {
                from: self.from.to_string(),
                to: self.to.to_string(),
            });
        }

        if self.to.is_failure()
            && self
                .message
                .as_deref()
                .is_none_or(|m| m.trim().is_empty())
        {
            return Err(CoreError::validation(
                "message",
                format!("transition to '{}' requires a message", self.to),
            ));
        }

        if matches!(&self.ids, Some(ids) if ids.is_empty()) {
            return Err(CoreError::validation("ids", "explicit id list is empty"));
        }

        Ok(())
    }

    /// Rows eligible for the transition.
    pub fn filter(&self) -> Filter {
        let filter = Filter::new()
            .eq(columns::TICKET_ID, self.ticket_id)
            .eq(columns::STATUS, self.from.as_str());
        match &self.ids {
            Some(ids) => filter.is_in(columns::ID, ids.iter().copied()),
            None => filter,
        }
    }

    /// Assignments applied to eligible rows.
    pub fn patch(&self) -> Patch {
        Patch::new()
            .set(columns::STATUS, self.to.as_str())
            .set(columns::MESSAGE, self.message.clone())
    }
}

/// Check the affected row count of a guarded update.
///
/// With an explicit expectation, any mismatch is a conflict. Without one,
/// zero rows just means there was nothing (left) to move.
pub fn verify_effected(table: Table, expected: Option<u64>, effected: u64) -> Result<u64> {
    match expected {
        Some(expected) if expected != effected => Err(CoreError::Conflict {
            table: table.name().to_string(),
            expected,
            effected,
        }),
        _ => Ok(effected),
    }
}

/// Applies guarded status transitions through a [`Store`].
#[derive(Clone)]
pub struct CasStatusUpdater {
    store: Arc<dyn Store>,
}

impl CasStatusUpdater {
    /// Create an updater over a store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply a sub-ticket status transition, returning the rows moved.
    pub async fn transition(&self, transition: &StatusTransition) -> Result<u64> {
        transition.validate()?;

        let effected = self
            .store
            .update_where(
                Table::SubTickets,
                &transition.filter(),
                &transition.patch(),
            )
            .await?;

        debug!(
            ticket_id = transition.ticket_id,
            from = %transition.from,
            to = %transition.to,
            effected,
            "Applied sub-ticket transition"
        );

        let expected = transition.ids.as_ref().map(|ids| ids.len() as u64);
        verify_effected(Table::SubTickets, expected, effected)
    }

    /// Apply an arbitrary guarded update and verify its row count.
    pub async fn guarded_update(
        &self,
        table: Table,
        filter: &Filter,
        patch: &Patch,
        expected: Option<u64>,
    ) -> Result<u64> {
        let effected = self.store.update_where(table, filter, patch).await?;
        verify_effected(table, expected, effected)
    }
}
