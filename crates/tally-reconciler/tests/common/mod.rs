// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tally-reconciler integration tests.
//!
//! Provides TestContext wiring a store, the in-memory service mocks and the
//! controllers together.

#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use tally_core::persistence::{NewBillItem, NewSyncRecord, SyncRecord};
use tally_core::{MockFlowDelegate, Period, PostgresStore, SqliteStore, Store, Vendor};
use tally_reconciler::bill_sync::{BillSyncConfig, BillSyncController};
use tally_reconciler::clients::mock::{MockBillingNotifier, MockRateSource};
use tally_reconciler::exchange_rate::{ExchangeRateConfig, ExchangeRateController};

/// Fresh in-memory SQLite store with the schema applied.
pub async fn sqlite_store() -> Arc<SqliteStore> {
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

/// PostgreSQL store from `TEST_TALLY_DATABASE_URL`, if set.
pub async fn postgres_store() -> Option<Arc<PostgresStore>> {
    let url = std::env::var("TEST_TALLY_DATABASE_URL").ok()?;
    PostgresStore::connect(&url, 5).await.ok().map(Arc::new)
}

/// A period no other test run uses, to keep shared databases apart.
pub fn unique_period() -> Period {
    let year = 3000 + (uuid::Uuid::new_v4().as_u128() % 5000) as i32;
    Period::new(year, 1 + (uuid::Uuid::new_v4().as_u128() % 12) as u32)
        .expect("month is in range")
}

/// `count` bill rows for one account pair.
pub fn bill_rows(
    vendor: Vendor,
    period: Period,
    main: &str,
    sub: &str,
    count: usize,
    cost: &str,
    real_cost: &str,
) -> Vec<NewBillItem> {
    (0..count)
        .map(|i| NewBillItem {
            vendor,
            period,
            main_account_id: main.to_string(),
            sub_account_id: sub.to_string(),
            product_code: format!("product-{}", i % 7),
            cost: cost.parse::<Decimal>().expect("valid decimal"),
            real_cost: real_cost.parse::<Decimal>().expect("valid decimal"),
            currency: "USD".to_string(),
        })
        .collect()
}

/// Store, mocks and controllers for one test.
pub struct TestContext {
    pub store: Arc<dyn Store>,
    pub flows: Arc<MockFlowDelegate>,
    pub notifier: Arc<MockBillingNotifier>,
    pub rates: Arc<MockRateSource>,
    pub bill_sync: BillSyncController,
    pub exchange_rate: ExchangeRateController,
}

impl TestContext {
    /// Context over a fresh SQLite store.
    pub async fn sqlite(flows: MockFlowDelegate, config: BillSyncConfig) -> Self {
        Self::with_store(sqlite_store().await, flows, config)
    }

    /// Context over any store.
    pub fn with_store(
        store: Arc<dyn Store>,
        flows: MockFlowDelegate,
        config: BillSyncConfig,
    ) -> Self {
        let flows = Arc::new(flows);
        let notifier = Arc::new(MockBillingNotifier::new());
        let rates = Arc::new(MockRateSource::new());
        let bill_sync =
            BillSyncController::new(store.clone(), flows.clone(), notifier.clone(), config);
        let exchange_rate =
            ExchangeRateController::new(store.clone(), rates.clone(), ExchangeRateConfig::default());
        Self {
            store,
            flows,
            notifier,
            rates,
            bill_sync,
            exchange_rate,
        }
    }

    /// Create a sync record and its bills.
    pub async fn seed_record(
        &self,
        vendor: Vendor,
        period: Period,
        bills: &[NewBillItem],
    ) -> String {
        self.store
            .insert_bill_items(bills)
            .await
            .expect("Failed to insert bills");
        self.store
            .insert_sync_record(&NewSyncRecord { vendor, period })
            .await
            .expect("Failed to insert sync record")
    }

    /// Current state of a record.
    pub async fn record(&self, id: &str) -> SyncRecord {
        self.store
            .get_sync_record(id)
            .await
            .expect("Failed to load sync record")
            .expect("Sync record exists")
    }
}
