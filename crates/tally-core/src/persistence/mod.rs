// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for tally-core.
//!
//! This module defines the store abstraction used by every controller and
//! its SQLite and PostgreSQL implementations. All writes are one of:
//! - additive (`insert ... on conflict do nothing`),
//! - conditional ([`Store::update_where`] with the expected current state in
//!   the filter), or
//! - confined to records the caller owns by leadership convention.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::checkpoint::Checkpoint;
use crate::error::CoreError;
use crate::filter::{Filter, Page, Patch};
use crate::types::{CostColumn, Period, SubTicketStatus, SyncRecordState, Vendor};

/// Tables reachable through the generic store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// `sync_records`
    SyncRecords,
    /// `bill_items`
    BillItems,
    /// `exchange_rates`
    ExchangeRates,
    /// `resource_plan_sub_tickets`
    SubTickets,
}

impl Table {
    /// SQL table name.
    pub fn name(&self) -> &'static str {
        match self {
            Table::SyncRecords => "sync_records",
            Table::BillItems => "bill_items",
            Table::ExchangeRates => "exchange_rates",
            Table::SubTickets => "resource_plan_sub_tickets",
        }
    }

    /// Whether rows carry an `updated_at` column maintained on update.
    pub(crate) fn tracks_updates(&self) -> bool {
        matches!(self, Table::SyncRecords | Table::SubTickets)
    }
}

/// Column names used in filters and patches.
pub mod columns {
    /// Primary key.
    pub const ID: &str = "id";
    /// Sync record / bill vendor.
    pub const VENDOR: &str = "vendor";
    /// Accounting period.
    pub const PERIOD: &str = "period";
    /// Sync record state.
    pub const STATE: &str = "state";
    /// Sync record checkpoint.
    pub const DETAIL: &str = "detail";
    /// Sync record adjustment flow.
    pub const ADJUSTMENT_FLOW_ID: &str = "adjustment_flow_id";
    /// Sync record adjustment retry counter.
    pub const ADJUSTMENT_ATTEMPTS: &str = "adjustment_attempts";
    /// Sync record aggregate row count.
    pub const BILL_COUNT: &str = "bill_count";
    /// Sync record aggregate monetary sum.
    pub const COST_SUM: &str = "cost_sum";
    /// Bill main account.
    pub const MAIN_ACCOUNT_ID: &str = "main_account_id";
    /// Bill sub account.
    pub const SUB_ACCOUNT_ID: &str = "sub_account_id";
    /// Exchange rate source currency.
    pub const FROM_CURRENCY: &str = "from_currency";
    /// Exchange rate target currency.
    pub const TO_CURRENCY: &str = "to_currency";
    /// Sub-ticket parent ticket.
    pub const TICKET_ID: &str = "ticket_id";
    /// Sub-ticket status.
    pub const STATUS: &str = "status";
    /// Sub-ticket status message.
    pub const MESSAGE: &str = "message";
    /// Sub-ticket external approval ticket serial number.
    pub const ITSM_TICKET_SN: &str = "itsm_ticket_sn";
}

// ============================================================================
// Record Types
// ============================================================================

/// Sync record row: one per {vendor, period}.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncRecord {
    /// Opaque identifier.
    pub id: String,
    /// Vendor tag.
    pub vendor: String,
    /// Accounting period (`YYYY-MM`).
    pub period: String,
    /// Record state.
    pub state: String,
    /// Checkpoint JSON.
    pub detail: Option<String>,
    /// Flow tracking the adjustment phase.
    pub adjustment_flow_id: Option<String>,
    /// Failed adjustment flows so far.
    pub adjustment_attempts: i64,
    /// Aggregate bill row count, written on completion.
    pub bill_count: i64,
    /// Aggregate monetary sum, written on completion.
    pub cost_sum: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last changed.
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    /// Parsed record state.
    pub fn state(&self) -> Result<SyncRecordState, CoreError> {
        self.state.parse()
    }

    /// Parsed vendor.
    pub fn vendor(&self) -> Result<Vendor, CoreError> {
        self.vendor.parse()
    }

    /// Parsed period.
    pub fn period(&self) -> Result<Period, CoreError> {
        self.period.parse()
    }

    /// Decoded checkpoint.
    pub fn checkpoint(&self) -> Result<Checkpoint, CoreError> {
        Checkpoint::decode(&self.id, self.detail.as_deref())
    }
}

/// Input for creating a sync record (done by ingestion).
#[derive(Debug, Clone)]
pub struct NewSyncRecord {
    /// Vendor of the bills.
    pub vendor: Vendor,
    /// Accounting period.
    pub period: Period,
}

/// Base bill row, as ingested.
#[derive(Debug, Clone)]
pub struct NewBillItem {
    /// Vendor of the bill.
    pub vendor: Vendor,
    /// Accounting period.
    pub period: Period,
    /// Payer account.
    pub main_account_id: String,
    /// Linked account.
    pub sub_account_id: String,
    /// Product code.
    pub product_code: String,
    /// List price.
    pub cost: Decimal,
    /// Charged amount.
    pub real_cost: Decimal,
    /// ISO currency code of both amounts.
    pub currency: String,
}

/// Account pair owning bills within a {vendor, period}.
#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct AccountPair {
    /// Payer account.
    pub main_account_id: String,
    /// Linked account.
    pub sub_account_id: String,
}

/// Count and sum of a cost column over a set of bill rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BillSummary {
    /// Matching rows.
    pub count: i64,
    /// Sum of the selected column.
    pub sum: Decimal,
}

impl std::ops::AddAssign for BillSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.count += rhs.count;
        self.sum += rhs.sum;
    }
}

/// Stored exchange rate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExchangeRate {
    /// Primary key.
    pub id: i64,
    /// Accounting period.
    pub period: String,
    /// Source currency.
    pub from_currency: String,
    /// Target currency.
    pub to_currency: String,
    /// Decimal rate as text.
    pub rate: String,
    /// When the row was inserted.
    pub created_at: DateTime<Utc>,
}

/// Input for inserting an exchange rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExchangeRate {
    /// Accounting period.
    pub period: Period,
    /// Source currency.
    pub from_currency: String,
    /// Target currency.
    pub to_currency: String,
    /// Rate from source to target.
    pub rate: Decimal,
}

/// Resource plan sub-ticket row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubTicket {
    /// Primary key.
    pub id: i64,
    /// Parent resource plan ticket.
    pub ticket_id: i64,
    /// Current status.
    pub status: String,
    /// Serial number of the approval ticket, once opened.
    pub itsm_ticket_sn: Option<String>,
    /// Status message (required for failure outcomes).
    pub message: Option<String>,
    /// Free-form request content forwarded to the approval ticket.
    pub content: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last changed.
    pub updated_at: DateTime<Utc>,
}

impl SubTicket {
    /// Parsed status.
    pub fn status(&self) -> Result<SubTicketStatus, CoreError> {
        self.status.parse()
    }
}

/// Input for creating a sub-ticket.
#[derive(Debug, Clone)]
pub struct NewSubTicket {
    /// Parent resource plan ticket.
    pub ticket_id: i64,
    /// Initial status.
    pub status: SubTicketStatus,
    /// Free-form request content.
    pub content: Option<String>,
}

// ============================================================================
// Store trait
// ============================================================================

/// Persistence interface used by the reconciliation controllers.
#[async_trait]
pub trait Store: Send + Sync {
    /// List sync records matching the filter, ordered by period then id.
    async fn list_sync_records(
        &self,
        filter: &Filter,
        page: Page,
    ) -> Result<Vec<SyncRecord>, CoreError>;

    /// Fetch one sync record.
    async fn get_sync_record(&self, id: &str) -> Result<Option<SyncRecord>, CoreError>;

    /// Create a sync record in state `new`. Returns its ID.
    async fn insert_sync_record(&self, record: &NewSyncRecord) -> Result<String, CoreError>;

    /// Insert base bill rows. Returns the number inserted.
    async fn insert_bill_items(&self, items: &[NewBillItem]) -> Result<u64, CoreError>;

    /// Distinct account pairs with bills in {vendor, period}, in stable order.
    async fn list_bill_accounts(
        &self,
        vendor: Vendor,
        period: Period,
    ) -> Result<Vec<AccountPair>, CoreError>;

    /// Count and sum a cost column over matching bill rows.
    async fn summarize_bills(
        &self,
        filter: &Filter,
        column: CostColumn,
    ) -> Result<BillSummary, CoreError>;

    /// List exchange rates matching the filter.
    async fn list_exchange_rates(&self, filter: &Filter) -> Result<Vec<ExchangeRate>, CoreError>;

    /// Insert exchange rates, skipping keys that already exist.
    ///
    /// Returns the number of rows actually inserted.
    async fn insert_exchange_rates(&self, rates: &[NewExchangeRate]) -> Result<u64, CoreError>;

    /// List sub-tickets matching the filter, ordered by id.
    async fn list_sub_tickets(
        &self,
        filter: &Filter,
        page: Page,
    ) -> Result<Vec<SubTicket>, CoreError>;

    /// Create sub-tickets. Returns their IDs in input order.
    async fn insert_sub_tickets(&self, tickets: &[NewSubTicket]) -> Result<Vec<i64>, CoreError>;

    /// Count rows of a table matching the filter.
    async fn count(&self, table: Table, filter: &Filter) -> Result<i64, CoreError>;

    /// Apply a patch to every row matching the filter in one statement.
    ///
    /// Returns the number of rows changed. This is the building block for
    /// compare-and-swap transitions: put the expected current value in the
    /// filter and the new value in the patch.
    async fn update_where(
        &self,
        table: Table,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64, CoreError>;

    /// Acquire or renew a leadership lease.
    ///
    /// Succeeds when the lease is free, expired, or already held by `holder`.
    async fn try_acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Release a lease held by `holder`. No-op if someone else holds it.
    async fn release_lease(&self, resource: &str, holder: &str) -> Result<(), CoreError>;

    /// Check database connectivity.
    async fn health_check(&self) -> Result<bool, CoreError>;
}

/// Bind [`crate::filter::Value`]s onto a sqlx query in order.
macro_rules! bind_values {
    ($query:expr, $values:expr) => {{
        let mut query = $query;
        for value in $values {
            query = match value {
                $crate::filter::Value::Text(s) => query.bind(s.clone()),
                $crate::filter::Value::Int(i) => query.bind(*i),
                $crate::filter::Value::Null => query.bind(Option::<String>::None),
            };
        }
        query
    }};
}

pub(crate) use bind_values;

pub(crate) fn parse_decimal(raw: &str, operation: &str) -> Result<Decimal, CoreError> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|e| CoreError::DatabaseError {
            operation: operation.to_string(),
            details: format!("invalid decimal '{}': {}", raw, e),
        })
}

/// Count and sum decimal text values fetched from a cost column.
pub(crate) fn sum_decimals(values: &[String]) -> Result<BillSummary, CoreError> {
    let mut summary = BillSummary::default();
    for raw in values {
        summary.count += 1;
        summary.sum += parse_decimal(raw, "summarize_bills")?;
    }
    Ok(summary)
}

/// Current time and lease expiry, both as unix milliseconds.
fn lease_window(ttl: Duration) -> Result<(i64, i64), CoreError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| CoreError::validation("ttl", format!("invalid lease ttl: {}", e)))?;
    let now = Utc::now();
    Ok((now.timestamp_millis(), (now + ttl).timestamp_millis()))
}
