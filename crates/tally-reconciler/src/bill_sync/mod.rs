// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bill synchronization controller.
//!
//! Walks every active sync record one step per tick:
//!
//! ```text
//! New ──init──▶ SyncingBillItem ──all items synced──▶ SyncingAdjustment ──notify──▶ Synced
//!                 │        ▲                            │        ▲
//!                 └─ item ─┘                            └─ flow ─┘
//! ```
//!
//! Within `SyncingBillItem` only the first unfinished item of the checkpoint
//! moves, by one of: count its rows, delegate the batch at the cursor, or
//! poll the delegated flow. Record state changes are guarded on the state
//! read at the start of the step; a guard miss means another actor already
//! advanced the record and is not an error.

pub mod vendor;

pub use vendor::VendorProfile;

use std::sync::Arc;

use async_trait::async_trait;
use tally_core::persistence::columns;
use tally_core::persistence::{BillSummary, SyncRecord};
use tally_core::{
    CasStatusUpdater, Checkpoint, Filter, FlowDelegate, FlowError, FlowState, Page, Patch, Period,
    Store, SyncItem, SyncItemState, SyncRecordState, Table, TaskSpec, Vendor,
};
use tracing::{debug, error, info, warn};

use crate::clients::{BillingNotification, BillingNotifier};
use crate::error::Result;
use crate::worker::Activity;

/// Tuning of the bill sync controller.
#[derive(Debug, Clone, Copy)]
pub struct BillSyncConfig {
    /// Base bill rows per delegated flow.
    pub batch_size: i64,
    /// Records loaded per tick.
    pub records_per_tick: i64,
    /// Failed flows per unit of work before it is parked (0 = unbounded).
    pub flow_retry_limit: u32,
}

impl Default for BillSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            records_per_tick: 100,
            flow_retry_limit: 10,
        }
    }
}

/// Drives sync records to `Synced`.
pub struct BillSyncController {
    store: Arc<dyn Store>,
    cas: CasStatusUpdater,
    flows: Arc<dyn FlowDelegate>,
    notifier: Arc<dyn BillingNotifier>,
    config: BillSyncConfig,
}

/// Bill rows of one account pair.
fn item_scope(item: &SyncItem) -> Filter {
    Filter::new()
        .eq(columns::VENDOR, item.vendor.as_str())
        .eq(columns::PERIOD, item.period.to_string())
        .eq(columns::MAIN_ACCOUNT_ID, item.main_account_id.as_str())
        .eq(columns::SUB_ACCOUNT_ID, item.sub_account_id.as_str())
}

fn record_guard(record_id: &str, state: SyncRecordState) -> Filter {
    Filter::new()
        .eq(columns::ID, record_id)
        .eq(columns::STATE, state.as_str())
}

impl BillSyncController {
    /// Create a controller.
    pub fn new(
        store: Arc<dyn Store>,
        flows: Arc<dyn FlowDelegate>,
        notifier: Arc<dyn BillingNotifier>,
        config: BillSyncConfig,
    ) -> Self {
        Self {
            cas: CasStatusUpdater::new(store.clone()),
            store,
            flows,
            notifier,
            config,
        }
    }

    /// Advance every active record by one step. Returns how many stepped
    /// without error.
    pub async fn reconcile(&self) -> Result<usize> {
        let filter = Filter::new().is_in(
            columns::STATE,
            SyncRecordState::ACTIVE.iter().map(|s| s.as_str()),
        );
        let records = self
            .store
            .list_sync_records(&filter, Page::first(self.config.records_per_tick))
            .await?;

        if records.is_empty() {
            debug!("No active sync records");
            return Ok(0);
        }

        let mut stepped = 0;
        for record in &records {
            match self.step(record).await {
                Ok(()) => stepped += 1,
                Err(e) => error!(
                    record_id = %record.id,
                    vendor = %record.vendor,
                    period = %record.period,
                    state = %record.state,
                    error = %e,
                    "Failed to step sync record"
                ),
            }
        }

        debug!(records = records.len(), stepped, "Bill sync pass finished");
        Ok(stepped)
    }

    /// Advance one record by one step. Steps on a synced record are no-ops.
    pub async fn step(&self, record: &SyncRecord) -> Result<()> {
        let vendor = record.vendor()?;
        let period = record.period()?;

        match record.state()? {
            SyncRecordState::New => {
                self.init_sync_items(record).await?;
            }
            SyncRecordState::SyncingBillItem => self.sync_bill_items(record).await?,
            SyncRecordState::SyncingAdjustment => {
                self.sync_adjustment(record, vendor, period).await?
            }
            SyncRecordState::Synced => {}
        }
        Ok(())
    }

    /// Build a fresh checkpoint from the record's account pairs and store it,
    /// moving the record to `SyncingBillItem`.
    ///
    /// Returns `None` while the record has no bills yet. Running it twice
    /// yields the same checkpoint.
    pub async fn init_sync_items(&self, record: &SyncRecord) -> Result<Option<Checkpoint>> {
        let vendor = record.vendor()?;
        let period = record.period()?;
        let from = record.state()?;

        let accounts = self.store.list_bill_accounts(vendor, period).await?;
        if accounts.is_empty() {
            debug!(
                record_id = %record.id,
                vendor = %vendor,
                period = %period,
                "No bills for record yet"
            );
            return Ok(None);
        }

        let checkpoint = Checkpoint::new(
            accounts
                .into_iter()
                .map(|pair| {
                    SyncItem::new(
                        pair.main_account_id,
                        pair.sub_account_id,
                        vendor,
                        period,
                        self.config.batch_size,
                    )
                })
                .collect(),
        );

        let patch = Patch::new()
            .set(columns::DETAIL, checkpoint.encode()?)
            .set(columns::STATE, SyncRecordState::SyncingBillItem.as_str());
        if self.advance(record, from, patch).await? {
            info!(
                record_id = %record.id,
                vendor = %vendor,
                period = %period,
                items = checkpoint.items().len(),
                "Initialized sync items"
            );
        }
        Ok(Some(checkpoint))
    }

    async fn sync_bill_items(&self, record: &SyncRecord) -> Result<()> {
        let mut checkpoint = match record.checkpoint() {
            Ok(checkpoint) if !checkpoint.is_empty() => checkpoint,
            Ok(_) => {
                warn!(record_id = %record.id, "Empty checkpoint, re-initializing");
                self.init_sync_items(record).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "Checkpoint unreadable, re-initializing");
                self.init_sync_items(record).await?;
                return Ok(());
            }
        };

        let changed = match checkpoint.next_pending_mut() {
            Some(item) => self.step_item(&record.id, item).await?,
            None => false,
        };

        if checkpoint.all_synced() {
            let patch = Patch::new()
                .set(columns::DETAIL, checkpoint.encode()?)
                .set(columns::STATE, SyncRecordState::SyncingAdjustment.as_str());
            if self
                .advance(record, SyncRecordState::SyncingBillItem, patch)
                .await?
            {
                info!(record_id = %record.id, "All sync items synced, starting adjustment");
            }
        } else if changed {
            let patch = Patch::new().set(columns::DETAIL, checkpoint.encode()?);
            self.advance(record, SyncRecordState::SyncingBillItem, patch)
                .await?;
        }
        Ok(())
    }

    /// Move one item by one step. Returns whether the item changed.
    async fn step_item(&self, record_id: &str, item: &mut SyncItem) -> Result<bool> {
        match item.state {
            SyncItemState::New => {
                let total = self.store.count(Table::BillItems, &item_scope(item)).await?;
                item.set_total(total);
                debug!(record_id, item = %item.key(), total, "Counted item rows");
                Ok(true)
            }
            SyncItemState::Syncing => match item.flow_id.clone() {
                None => {
                    if item.has_nothing_to_sync() {
                        item.finish_empty();
                        debug!(record_id, item = %item.key(), "Item has no rows");
                        return Ok(true);
                    }
                    if self.budget_exhausted(i64::from(item.failed_attempts)) {
                        self.report_parked(record_id, &item.key(), i64::from(item.failed_attempts));
                        return Ok(false);
                    }
                    let flow_id = self
                        .flows
                        .create_flow(&TaskSpec::bill_item_batch(record_id, item))
                        .await?;
                    let (start, end) = item.batch_range();
                    debug!(record_id, item = %item.key(), flow_id = %flow_id, start, end, "Delegated batch");
                    item.attach_flow(flow_id);
                    Ok(true)
                }
                Some(flow_id) => {
                    let state = self.poll(&flow_id).await?;
                    if !state.is_terminal() {
                        debug!(record_id, item = %item.key(), flow_id = %flow_id, ?state, "Batch flow in progress");
                        return Ok(false);
                    }
                    if !state.needs_recreate() {
                        item.complete_batch();
                        if item.is_synced() {
                            info!(record_id, item = %item.key(), total = item.total, "Item synced");
                        }
                        return Ok(true);
                    }

                    item.fail_batch();
                    let (start, end) = item.batch_range();
                    warn!(
                        record_id,
                        item = %item.key(),
                        flow_id = %flow_id,
                        ?state,
                        start,
                        end,
                        attempts = item.failed_attempts,
                        "Batch flow failed, re-delegating"
                    );
                    if self.budget_exhausted(i64::from(item.failed_attempts)) {
                        self.report_parked(
                            record_id,
                            &item.key(),
                            i64::from(item.failed_attempts),
                        );
                        return Ok(true);
                    }
                    match self
                        .flows
                        .create_flow(&TaskSpec::bill_item_batch(record_id, item))
                        .await
                    {
                        Ok(new_flow) => item.attach_flow(new_flow),
                        Err(e) => warn!(
                            record_id,
                            item = %item.key(),
                            error = %e,
                            "Failed to re-delegate batch, retrying next tick"
                        ),
                    }
                    Ok(true)
                }
            },
            SyncItemState::Synced => Ok(false),
        }
    }

    async fn sync_adjustment(
        &self,
        record: &SyncRecord,
        vendor: Vendor,
        period: Period,
    ) -> Result<()> {
        let Some(flow_id) = record.adjustment_flow_id.as_deref() else {
            if self.budget_exhausted(record.adjustment_attempts) {
                self.report_parked(&record.id, "adjustment", record.adjustment_attempts);
                return Ok(());
            }
            let flow_id = self
                .flows
                .create_flow(&TaskSpec::bill_adjustment(&record.id, vendor, period))
                .await?;
            let guard = record_guard(&record.id, SyncRecordState::SyncingAdjustment)
                .is_null(columns::ADJUSTMENT_FLOW_ID);
            let patch = Patch::new().set(columns::ADJUSTMENT_FLOW_ID, flow_id.as_str());
            if self
                .cas
                .guarded_update(Table::SyncRecords, &guard, &patch, None)
                .await?
                == 0
            {
                info!(record_id = %record.id, "Adjustment already delegated by another actor");
            } else {
                debug!(record_id = %record.id, flow_id = %flow_id, "Delegated adjustment");
            }
            return Ok(());
        };

        let state = self.poll(flow_id).await?;
        if !state.is_terminal() {
            debug!(record_id = %record.id, flow_id, ?state, "Adjustment flow in progress");
            return Ok(());
        }
        if !state.needs_recreate() {
            return self.complete(record, vendor, period).await;
        }

        let attempts = record.adjustment_attempts + 1;
        warn!(
            record_id = %record.id,
            flow_id,
            ?state,
            attempts,
            "Adjustment flow failed, re-delegating"
        );

        let new_flow = if self.budget_exhausted(attempts) {
            self.report_parked(&record.id, "adjustment", attempts);
            None
        } else {
            match self
                .flows
                .create_flow(&TaskSpec::bill_adjustment(&record.id, vendor, period))
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        error = %e,
                        "Failed to re-delegate adjustment, retrying next tick"
                    );
                    None
                }
            }
        };

        let guard = record_guard(&record.id, SyncRecordState::SyncingAdjustment)
            .eq(columns::ADJUSTMENT_FLOW_ID, flow_id);
        let patch = Patch::new()
            .set(columns::ADJUSTMENT_FLOW_ID, new_flow)
            .set(columns::ADJUSTMENT_ATTEMPTS, attempts);
        self.cas
            .guarded_update(Table::SyncRecords, &guard, &patch, None)
            .await?;
        Ok(())
    }

    /// Aggregate, notify, then mark the record synced.
    ///
    /// A failed notification returns an error and leaves the record in
    /// `SyncingAdjustment` with its flow, so the next tick completes again.
    async fn complete(&self, record: &SyncRecord, vendor: Vendor, period: Period) -> Result<()> {
        let profile = VendorProfile::of(vendor);
        let summary = self.aggregate(record, vendor, period, &profile).await?;

        let notification = BillingNotification {
            period,
            account_type: profile.account_type.to_string(),
            total: summary.count,
            column: profile.cost_column,
            sum: summary.sum,
            currency: profile.currency.to_string(),
        };
        self.notifier.notify(&notification).await?;

        let patch = Patch::new()
            .set(columns::STATE, SyncRecordState::Synced.as_str())
            .set(columns::BILL_COUNT, summary.count)
            .set(columns::COST_SUM, summary.sum.to_string());
        if self
            .advance(record, SyncRecordState::SyncingAdjustment, patch)
            .await?
        {
            info!(
                record_id = %record.id,
                vendor = %vendor,
                period = %period,
                bill_count = summary.count,
                cost_sum = %summary.sum,
                "Sync record synced"
            );
        }
        Ok(())
    }

    async fn aggregate(
        &self,
        record: &SyncRecord,
        vendor: Vendor,
        period: Period,
        profile: &VendorProfile,
    ) -> Result<BillSummary> {
        match record.checkpoint() {
            Ok(checkpoint) if !checkpoint.is_empty() => {
                let mut summary = BillSummary::default();
                for item in checkpoint.items() {
                    summary += self
                        .store
                        .summarize_bills(&item_scope(item), profile.cost_column)
                        .await?;
                }
                Ok(summary)
            }
            other => {
                if let Err(e) = other {
                    warn!(
                        record_id = %record.id,
                        error = %e,
                        "Checkpoint unreadable, aggregating the whole period"
                    );
                }
                let scope = Filter::new()
                    .eq(columns::VENDOR, vendor.as_str())
                    .eq(columns::PERIOD, period.to_string());
                Ok(self
                    .store
                    .summarize_bills(&scope, profile.cost_column)
                    .await?)
            }
        }
    }

    async fn poll(&self, flow_id: &str) -> Result<FlowState> {
        match self.flows.get_flow(flow_id).await {
            Ok(state) => Ok(state),
            Err(FlowError::NotFound { .. }) => {
                warn!(flow_id, "Flow unknown to the flow service, treating as failed");
                Ok(FlowState::Failed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Guarded record update. Returns whether this actor moved the record.
    async fn advance(
        &self,
        record: &SyncRecord,
        from: SyncRecordState,
        patch: Patch,
    ) -> Result<bool> {
        let moved = self
            .cas
            .guarded_update(
                Table::SyncRecords,
                &record_guard(&record.id, from),
                &patch,
                None,
            )
            .await?;
        if moved == 0 {
            info!(record_id = %record.id, from = %from, "Sync record advanced by another actor");
        }
        Ok(moved > 0)
    }

    fn budget_exhausted(&self, attempts: i64) -> bool {
        self.config.flow_retry_limit > 0 && attempts >= i64::from(self.config.flow_retry_limit)
    }

    fn report_parked(&self, record_id: &str, unit: &str, attempts: i64) {
        error!(
            record_id,
            unit,
            attempts,
            limit = self.config.flow_retry_limit,
            "retry budget exhausted"
        );
    }
}

#[async_trait]
impl Activity for BillSyncController {
    fn name(&self) -> &'static str {
        "bill_sync"
    }

    async fn tick(&self) -> Result<()> {
        self.reconcile().await.map(|_| ())
    }
}
