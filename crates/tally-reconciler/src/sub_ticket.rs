// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sub-ticket approval watcher.
//!
//! Opens an approval ticket for sub-tickets still in `init` and follows the
//! approval ticket of sub-tickets in `auditing`:
//!
//! | Ticket status | Sub-ticket transition |
//! |---------------|-----------------------|
//! | `running` | none |
//! | `approved` | auditing → done |
//! | `rejected` | auditing → rejected (reviewer comment) |
//! | `revoked` | auditing → failed (reason) |
//!
//! Every move goes through [`CasStatusUpdater`] with the explicit ID list, so
//! a partial move surfaces as a conflict.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tally_core::persistence::{SubTicket, columns};
use tally_core::{
    CasStatusUpdater, Filter, Page, Store, StatusTransition, SubTicketStatus, Table,
};
use tracing::{debug, error, info};

use crate::clients::{TicketRequest, TicketService, TicketStatus};
use crate::error::Result;
use crate::worker::Activity;

const DEFAULT_REJECT_MESSAGE: &str = "rejected by reviewer";
const DEFAULT_REVOKE_MESSAGE: &str = "approval ticket revoked";

/// Drives sub-tickets through their approval tickets.
pub struct SubTicketWatcher {
    store: Arc<dyn Store>,
    cas: CasStatusUpdater,
    tickets: Arc<dyn TicketService>,
    batch_limit: i64,
}

impl SubTicketWatcher {
    /// Create a watcher loading at most `batch_limit` sub-tickets per phase.
    pub fn new(store: Arc<dyn Store>, tickets: Arc<dyn TicketService>, batch_limit: i64) -> Self {
        Self {
            cas: CasStatusUpdater::new(store.clone()),
            store,
            tickets,
            batch_limit,
        }
    }

    /// Open pending approvals and apply finished ones. Returns the number of
    /// sub-tickets moved.
    pub async fn reconcile(&self) -> Result<u64> {
        let opened = self.open_pending().await?;
        let resolved = self.poll_auditing().await?;
        if opened + resolved > 0 {
            info!(opened, resolved, "Sub-ticket pass moved rows");
        }
        Ok(opened + resolved)
    }

    async fn open_pending(&self) -> Result<u64> {
        let pending = self
            .store
            .list_sub_tickets(
                &Filter::new()
                    .eq(columns::STATUS, SubTicketStatus::Init.as_str())
                    .is_null(columns::ITSM_TICKET_SN),
                Page::first(self.batch_limit),
            )
            .await?;

        let mut by_ticket: BTreeMap<i64, Vec<SubTicket>> = BTreeMap::new();
        for sub in pending {
            by_ticket.entry(sub.ticket_id).or_default().push(sub);
        }

        let mut moved = 0;
        for (ticket_id, subs) in by_ticket {
            match self.open_ticket(ticket_id, &subs).await {
                Ok(count) => moved += count,
                Err(e) => error!(ticket_id, error = %e, "Failed to open approval ticket"),
            }
        }
        Ok(moved)
    }

    async fn open_ticket(&self, ticket_id: i64, subs: &[SubTicket]) -> Result<u64> {
        let ids: Vec<i64> = subs.iter().map(|s| s.id).collect();
        let transition = StatusTransition::new(
            ticket_id,
            SubTicketStatus::Init,
            SubTicketStatus::Auditing,
        )
        .with_ids(ids.iter().copied());
        transition.validate()?;

        let sn = self
            .tickets
            .create_ticket(&TicketRequest {
                ticket_id,
                sub_ticket_ids: ids.clone(),
                content: subs.iter().filter_map(|s| s.content.clone()).collect(),
            })
            .await?;

        // Recording the serial number and leaving `init` is one guarded write.
        let moved = self
            .cas
            .guarded_update(
                Table::SubTickets,
                &transition.filter().is_null(columns::ITSM_TICKET_SN),
                &transition.patch().set(columns::ITSM_TICKET_SN, sn.as_str()),
                Some(ids.len() as u64),
            )
            .await?;

        info!(ticket_id, sn = %sn, sub_tickets = moved, "Opened approval ticket");
        Ok(moved)
    }

    async fn poll_auditing(&self) -> Result<u64> {
        let auditing = self
            .store
            .list_sub_tickets(
                &Filter::new()
                    .eq(columns::STATUS, SubTicketStatus::Auditing.as_str())
                    .is_not_null(columns::ITSM_TICKET_SN),
                Page::first(self.batch_limit),
            )
            .await?;

        let mut by_approval: BTreeMap<(i64, String), Vec<i64>> = BTreeMap::new();
        for sub in auditing {
            if let Some(sn) = sub.itsm_ticket_sn {
                by_approval.entry((sub.ticket_id, sn)).or_default().push(sub.id);
            }
        }

        let mut moved = 0;
        for ((ticket_id, sn), ids) in by_approval {
            match self.resolve(ticket_id, &sn, ids).await {
                Ok(count) => moved += count,
                Err(e) => error!(ticket_id, sn = %sn, error = %e, "Failed to apply approval outcome"),
            }
        }
        Ok(moved)
    }

    async fn resolve(&self, ticket_id: i64, sn: &str, ids: Vec<i64>) -> Result<u64> {
        let status = self.tickets.get_ticket_status(sn).await?;
        let transition = match status {
            TicketStatus::Running => {
                debug!(ticket_id, sn, "Approval still running");
                return Ok(0);
            }
            TicketStatus::Approved => {
                StatusTransition::new(ticket_id, SubTicketStatus::Auditing, SubTicketStatus::Done)
            }
            TicketStatus::Rejected { comment } => StatusTransition::new(
                ticket_id,
                SubTicketStatus::Auditing,
                SubTicketStatus::Rejected,
            )
            .with_message(non_blank(comment).unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string())),
            TicketStatus::Revoked { reason } => StatusTransition::new(
                ticket_id,
                SubTicketStatus::Auditing,
                SubTicketStatus::Failed,
            )
            .with_message(non_blank(reason).unwrap_or_else(|| DEFAULT_REVOKE_MESSAGE.to_string())),
        };

        let moved = self.cas.transition(&transition.with_ids(ids)).await?;
        info!(ticket_id, sn, sub_tickets = moved, "Applied approval outcome");
        Ok(moved)
    }
}

fn non_blank(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

#[async_trait]
impl Activity for SubTicketWatcher {
    fn name(&self) -> &'static str {
        "sub_ticket"
    }

    async fn tick(&self) -> Result<()> {
        self.reconcile().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockTicketService;
    use sqlx::sqlite::SqlitePoolOptions;
    use tally_core::SqliteStore;
    use tally_core::persistence::NewSubTicket;

    async fn test_store() -> Arc<SqliteStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        tally_core::migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        Arc::new(SqliteStore::new(pool))
    }

    async fn seed(store: &SqliteStore, ticket_id: i64, count: usize) -> Vec<i64> {
        let subs: Vec<_> = (0..count)
            .map(|i| NewSubTicket {
                ticket_id,
                status: SubTicketStatus::Init,
                content: Some(format!("item {i}")),
            })
            .collect();
        store.insert_sub_tickets(&subs).await.unwrap()
    }

    async fn subs_of(store: &SqliteStore, ticket_id: i64) -> Vec<SubTicket> {
        store
            .list_sub_tickets(&Filter::new().eq(columns::TICKET_ID, ticket_id), Page::All)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_then_approve() {
        let store = test_store().await;
        let service = Arc::new(MockTicketService::new());
        let watcher = SubTicketWatcher::new(store.clone(), service.clone(), 100);
        let ids = seed(&store, 7, 2).await;

        assert_eq!(watcher.reconcile().await.unwrap(), 2);
        let subs = subs_of(&store, 7).await;
        assert!(subs.iter().all(|s| s.status == "auditing"));
        let sn = subs[0].itsm_ticket_sn.clone().unwrap();

        let request = service.request_of(&sn).await.unwrap();
        assert_eq!(request.sub_ticket_ids, ids);
        assert_eq!(request.content, vec!["item 0", "item 1"]);

        // Still running: nothing moves, no second ticket.
        assert_eq!(watcher.reconcile().await.unwrap(), 0);
        assert_eq!(service.ticket_count().await, 1);

        service.set_status(&sn, TicketStatus::Approved).await;
        assert_eq!(watcher.reconcile().await.unwrap(), 2);
        assert!(subs_of(&store, 7).await.iter().all(|s| s.status == "done"));
    }

    #[tokio::test]
    async fn test_rejected_and_revoked_carry_messages() {
        let store = test_store().await;
        let service = Arc::new(MockTicketService::new());
        let watcher = SubTicketWatcher::new(store.clone(), service.clone(), 100);
        seed(&store, 1, 1).await;
        seed(&store, 2, 1).await;

        watcher.reconcile().await.unwrap();
        let sn1 = subs_of(&store, 1).await[0].itsm_ticket_sn.clone().unwrap();
        let sn2 = subs_of(&store, 2).await[0].itsm_ticket_sn.clone().unwrap();

        service
            .set_status(
                &sn1,
                TicketStatus::Rejected {
                    comment: Some("over budget".to_string()),
                },
            )
            .await;
        service
            .set_status(&sn2, TicketStatus::Revoked { reason: None })
            .await;
        assert_eq!(watcher.reconcile().await.unwrap(), 2);

        let rejected = &subs_of(&store, 1).await[0];
        assert_eq!(rejected.status, "rejected");
        assert_eq!(rejected.message.as_deref(), Some("over budget"));

        let failed = &subs_of(&store, 2).await[0];
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.message.as_deref(), Some(DEFAULT_REVOKE_MESSAGE));
    }

    #[tokio::test]
    async fn test_unavailable_service_leaves_rows_untouched() {
        let store = test_store().await;
        let service = Arc::new(MockTicketService::new());
        service.set_unavailable(true);
        let watcher = SubTicketWatcher::new(store.clone(), service.clone(), 100);
        seed(&store, 3, 2).await;

        assert_eq!(watcher.reconcile().await.unwrap(), 0);
        let subs = subs_of(&store, 3).await;
        assert!(subs.iter().all(|s| s.status == "init" && s.itsm_ticket_sn.is_none()));

        service.set_unavailable(false);
        assert_eq!(watcher.reconcile().await.unwrap(), 2);
    }
}
