// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.
//!
//! Monetary values are stored as decimal text and summed in Rust, so no
//! precision is lost to SQLite's floating point aggregates.

use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::CoreError;
use crate::filter::{Filter, Page, Patch, Placeholder};
use crate::types::{CostColumn, Period, Vendor};

use super::{
    AccountPair, BillSummary, ExchangeRate, NewBillItem, NewExchangeRate, NewSubTicket,
    NewSyncRecord, Store, SubTicket, SyncRecord, Table, bind_values, lease_window, sum_decimals,
};

const SYNC_RECORD_COLUMNS: &str = "id, vendor, period, state, detail, adjustment_flow_id, \
     adjustment_attempts, bill_count, cost_sum, created_at, updated_at";

const SUB_TICKET_COLUMNS: &str =
    "id, ticket_id, status, itsm_ticket_sn, message, content, created_at, updated_at";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn list_sync_records(
        &self,
        filter: &Filter,
        page: Page,
    ) -> Result<Vec<SyncRecord>, CoreError> {
        let rendered = filter.render_where(Placeholder::Question, 1);
        let sql = format!(
            "SELECT {} FROM sync_records{} ORDER BY period, id{}",
            SYNC_RECORD_COLUMNS,
            rendered.sql,
            page.render()
        );
        let query = sqlx::query_as::<_, SyncRecord>(&sql);
        let records = bind_values!(query, &rendered.values)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn get_sync_record(&self, id: &str) -> Result<Option<SyncRecord>, CoreError> {
        let sql = format!("SELECT {} FROM sync_records WHERE id = ?", SYNC_RECORD_COLUMNS);
        let record = sqlx::query_as::<_, SyncRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn insert_sync_record(&self, record: &NewSyncRecord) -> Result<String, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (id, vendor, period, state)
            VALUES (?, ?, ?, 'new')
            ON CONFLICT (vendor, period) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record.vendor.as_str())
        .bind(record.period.to_string())
        .execute(&self.pool)
        .await?;

        let id: String =
            sqlx::query_scalar("SELECT id FROM sync_records WHERE vendor = ? AND period = ?")
                .bind(record.vendor.as_str())
                .bind(record.period.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    async fn insert_bill_items(&self, items: &[NewBillItem]) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO bill_items
                    (vendor, period, main_account_id, sub_account_id, product_code,
                     cost, real_cost, currency)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.vendor.as_str())
            .bind(item.period.to_string())
            .bind(&item.main_account_id)
            .bind(&item.sub_account_id)
            .bind(&item.product_code)
            .bind(item.cost.to_string())
            .bind(item.real_cost.to_string())
            .bind(&item.currency)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_bill_accounts(
        &self,
        vendor: Vendor,
        period: Period,
    ) -> Result<Vec<AccountPair>, CoreError> {
        let accounts = sqlx::query_as::<_, AccountPair>(
            r#"
            SELECT DISTINCT main_account_id, sub_account_id
            FROM bill_items
            WHERE vendor = ? AND period = ?
            ORDER BY main_account_id, sub_account_id
            "#,
        )
        .bind(vendor.as_str())
        .bind(period.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    async fn summarize_bills(
        &self,
        filter: &Filter,
        column: CostColumn,
    ) -> Result<BillSummary, CoreError> {
        let rendered = filter.render_where(Placeholder::Question, 1);
        let sql = format!("SELECT {} FROM bill_items{}", column.as_str(), rendered.sql);
        let query = sqlx::query_scalar::<_, String>(&sql);
        let values = bind_values!(query, &rendered.values)
            .fetch_all(&self.pool)
            .await?;
        sum_decimals(&values)
    }

    async fn list_exchange_rates(&self, filter: &Filter) -> Result<Vec<ExchangeRate>, CoreError> {
        let rendered = filter.render_where(Placeholder::Question, 1);
        let sql = format!(
            "SELECT id, period, from_currency, to_currency, rate, created_at \
             FROM exchange_rates{} ORDER BY period, from_currency, to_currency",
            rendered.sql
        );
        let query = sqlx::query_as::<_, ExchangeRate>(&sql);
        let rates = bind_values!(query, &rendered.values)
            .fetch_all(&self.pool)
            .await?;
        Ok(rates)
    }

    async fn insert_exchange_rates(&self, rates: &[NewExchangeRate]) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for rate in rates {
            let result = sqlx::query(
                r#"
                INSERT INTO exchange_rates (period, from_currency, to_currency, rate)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (period, from_currency, to_currency) DO NOTHING
                "#,
            )
            .bind(rate.period.to_string())
            .bind(&rate.from_currency)
            .bind(&rate.to_currency)
            .bind(rate.rate.to_string())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_sub_tickets(
        &self,
        filter: &Filter,
        page: Page,
    ) -> Result<Vec<SubTicket>, CoreError> {
        let rendered = filter.render_where(Placeholder::Question, 1);
        let sql = format!(
            "SELECT {} FROM resource_plan_sub_tickets{} ORDER BY id{}",
            SUB_TICKET_COLUMNS,
            rendered.sql,
            page.render()
        );
        let query = sqlx::query_as::<_, SubTicket>(&sql);
        let tickets = bind_values!(query, &rendered.values)
            .fetch_all(&self.pool)
            .await?;
        Ok(tickets)
    }

    async fn insert_sub_tickets(&self, tickets: &[NewSubTicket]) -> Result<Vec<i64>, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO resource_plan_sub_tickets (ticket_id, status, content)
                VALUES (?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(ticket.ticket_id)
            .bind(ticket.status.as_str())
            .bind(&ticket.content)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn count(&self, table: Table, filter: &Filter) -> Result<i64, CoreError> {
        let rendered = filter.render_where(Placeholder::Question, 1);
        let sql = format!("SELECT COUNT(*) FROM {}{}", table.name(), rendered.sql);
        let query = sqlx::query_scalar::<_, i64>(&sql);
        let count = bind_values!(query, &rendered.values)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn update_where(
        &self,
        table: Table,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64, CoreError> {
        if patch.is_empty() {
            return Err(CoreError::validation("patch", "update without assignments"));
        }

        let set = patch.render_set(Placeholder::Question, 1);
        let rendered = filter.render_where(Placeholder::Question, set.values.len() + 1);
        let touch = if table.tracks_updates() {
            ", updated_at = CURRENT_TIMESTAMP"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE {}{}{}{}",
            table.name(),
            set.sql,
            touch,
            rendered.sql
        );

        let query = sqlx::query(&sql);
        let query = bind_values!(query, &set.values);
        let result = bind_values!(query, &rendered.values)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn try_acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let (now, expires_at) = lease_window(ttl)?;
        let result = sqlx::query(
            r#"
            INSERT INTO leader_leases (resource, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT (resource) DO UPDATE
            SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE leader_leases.holder = excluded.holder OR leader_leases.expires_at < ?
            "#,
        )
        .bind(resource)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, resource: &str, holder: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM leader_leases WHERE resource = ? AND holder = ?")
            .bind(resource)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
