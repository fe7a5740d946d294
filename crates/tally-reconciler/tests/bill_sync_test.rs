// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for bill synchronization.
//!
//! Records are driven tick by tick through the controller against a real
//! store, the scripted flow delegate and the recording notifier.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use rust_decimal::Decimal;
use tally_core::persistence::{NewSyncRecord, columns};
use tally_core::{
    Filter, FlowState, MockFlowDelegate, Patch, Period, Store, SyncItemState, SyncRecordState,
    Table, TaskKind, TaskSpec, Vendor,
};
use tally_reconciler::ReconcilerRuntime;
use tally_reconciler::bill_sync::BillSyncConfig;
use tally_reconciler::clients::mock::{MockBillingNotifier, MockRateSource};
use tally_reconciler::config::LeaderMode;

const MAX_TICKS: usize = 100;

/// Helper macro to skip tests if the PostgreSQL test database is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_TALLY_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_TALLY_DATABASE_URL not set");
            return;
        }
    };
}

fn period() -> Period {
    Period::new(2024, 5).unwrap()
}

fn config(batch_size: i64) -> BillSyncConfig {
    BillSyncConfig {
        batch_size,
        ..Default::default()
    }
}

/// Tick until the record is synced, checking cursor invariants after every
/// tick. Returns the states the record went through.
async fn drive_to_synced(ctx: &TestContext, record_id: &str) -> Vec<SyncRecordState> {
    let mut states = vec![ctx.record(record_id).await.state().unwrap()];
    let mut cursors: HashMap<String, i64> = HashMap::new();

    for _ in 0..MAX_TICKS {
        ctx.bill_sync.reconcile().await.unwrap();
        let record = ctx.record(record_id).await;

        if let Ok(checkpoint) = record.checkpoint() {
            for item in checkpoint.items() {
                let previous = cursors.insert(item.key(), item.current_index).unwrap_or(0);
                let step = item.current_index - previous;
                assert!(
                    step == 0 || step == item.batch_size,
                    "cursor of {} moved from {} to {}",
                    item.key(),
                    previous,
                    item.current_index
                );
                assert!(item.current_index <= item.total);
            }
        }

        let state = record.state().unwrap();
        if states.last() != Some(&state) {
            states.push(state);
        }
        if state == SyncRecordState::Synced {
            return states;
        }
    }
    panic!("record {} did not reach synced in {} ticks", record_id, MAX_TICKS);
}

#[tokio::test]
async fn test_failed_batch_is_redelegated_and_record_completes() {
    let flows = MockFlowDelegate::new().fail_once_where(|task| {
        task.kind == TaskKind::BillItemBatch && task.payload_i64("start") == Some(100)
    });
    let ctx = TestContext::sqlite(flows, config(50)).await;

    let mut bills = bill_rows(Vendor::Aws, period(), "m1", "s1", 120, "0.50", "0.25");
    bills.extend(bill_rows(Vendor::Aws, period(), "m1", "s2", 120, "0.50", "0.25"));
    let record_id = ctx.seed_record(Vendor::Aws, period(), &bills).await;

    let states = drive_to_synced(&ctx, &record_id).await;
    assert_eq!(
        states,
        vec![
            SyncRecordState::New,
            SyncRecordState::SyncingBillItem,
            SyncRecordState::SyncingAdjustment,
            SyncRecordState::Synced,
        ]
    );

    let created = ctx.flows.created().await;
    let batches = |sub: &str| -> Vec<(i64, i64)> {
        created
            .iter()
            .filter(|t| t.kind == TaskKind::BillItemBatch)
            .filter(|t| t.payload_str("sub_account_id") == Some(sub))
            .map(|t| {
                (
                    t.payload_i64("start").unwrap(),
                    t.payload_i64("end").unwrap(),
                )
            })
            .collect()
    };
    // The failing range is delegated again; nothing before it is repeated.
    assert_eq!(batches("s1"), vec![(0, 50), (50, 100), (100, 120), (100, 120)]);
    assert_eq!(batches("s2"), vec![(0, 50), (50, 100), (100, 120)]);
    assert_eq!(
        created
            .iter()
            .filter(|t| t.kind == TaskKind::BillAdjustment)
            .count(),
        1
    );

    let record = ctx.record(&record_id).await;
    let checkpoint = record.checkpoint().unwrap();
    assert_eq!(checkpoint.items().len(), 2);
    for item in checkpoint.items() {
        assert_eq!(item.state, SyncItemState::Synced);
        // The cursor stays on the start of the last batch.
        assert_eq!(item.current_index, 100);
        assert!(item.flow_id.is_none());
    }
    assert_eq!(record.bill_count, 240);
    assert_eq!(
        record.cost_sum.as_deref().map(|s| s.parse::<Decimal>().unwrap()),
        Some(Decimal::new(60, 0))
    );

    let sent = ctx.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].period, period());
    assert_eq!(sent[0].account_type, "payer");
    assert_eq!(sent[0].total, 240);
    assert_eq!(sent[0].sum, Decimal::new(60, 0));
    assert_eq!(sent[0].currency, "USD");

    // Further ticks leave a synced record alone.
    ctx.bill_sync.reconcile().await.unwrap();
    assert_eq!(ctx.flows.created().await.len(), created.len());
    assert_eq!(ctx.notifier.sent().await.len(), 1);
}

#[tokio::test]
async fn test_at_most_one_flow_in_flight_per_item() {
    let flows = MockFlowDelegate::new().with_pending_polls(2);
    let ctx = TestContext::sqlite(flows, config(10)).await;
    let bills = bill_rows(Vendor::Gcp, period(), "ba-1", "proj-1", 25, "1.00", "1.00");
    let record_id = ctx.seed_record(Vendor::Gcp, period(), &bills).await;

    for _ in 0..MAX_TICKS {
        ctx.bill_sync.reconcile().await.unwrap();
        let record = ctx.record(&record_id).await;
        if record.state().unwrap() != SyncRecordState::SyncingBillItem {
            if record.state().unwrap() == SyncRecordState::New {
                continue;
            }
            break;
        }

        // Every created batch flow except the one in the checkpoint is done.
        let item = record.checkpoint().unwrap().items()[0].clone();
        let created = ctx.flows.created().await;
        let batch_flows = created
            .iter()
            .filter(|t| t.kind == TaskKind::BillItemBatch)
            .count() as i64;
        let finished = item.current_index / item.batch_size;
        assert!(batch_flows - finished <= 1);
        if item.flow_id.is_some() {
            assert_eq!(batch_flows - finished, 1);
        }
    }

    let batches: Vec<_> = ctx
        .flows
        .created()
        .await
        .iter()
        .filter(|t| t.kind == TaskKind::BillItemBatch)
        .map(|t| t.payload_i64("start").unwrap())
        .collect();
    assert_eq!(batches, vec![0, 10, 20]);
}

#[tokio::test]
async fn test_record_is_not_synced_before_adjustment_succeeds() {
    let ctx = TestContext::sqlite(MockFlowDelegate::new(), config(100)).await;
    let bills = bill_rows(Vendor::TencentCloud, period(), "owner-1", "sub-1", 3, "2.00", "1.00");
    let record_id = ctx.seed_record(Vendor::TencentCloud, period(), &bills).await;

    // Walk until the adjustment flow has been created.
    let mut adjustment = None;
    for _ in 0..MAX_TICKS {
        ctx.bill_sync.reconcile().await.unwrap();
        let record = ctx.record(&record_id).await;
        if let Some(flow_id) = record.adjustment_flow_id.clone() {
            assert_eq!(record.state().unwrap(), SyncRecordState::SyncingAdjustment);
            adjustment = Some(flow_id);
            break;
        }
    }
    let adjustment = adjustment.expect("adjustment flow was created");

    // Failure replaces the flow; the record stays in adjustment.
    ctx.flows.set_outcome(&adjustment, FlowState::Failed).await;
    ctx.bill_sync.reconcile().await.unwrap();
    let record = ctx.record(&record_id).await;
    assert_eq!(record.state().unwrap(), SyncRecordState::SyncingAdjustment);
    assert_eq!(record.adjustment_attempts, 1);
    let replacement = record.adjustment_flow_id.clone().unwrap();
    assert_ne!(replacement, adjustment);
    assert!(ctx.notifier.sent().await.is_empty());

    // Notification failure also blocks completion.
    ctx.notifier.set_failing(true);
    ctx.bill_sync.reconcile().await.unwrap();
    let record = ctx.record(&record_id).await;
    assert_eq!(record.state().unwrap(), SyncRecordState::SyncingAdjustment);

    ctx.notifier.set_failing(false);
    ctx.bill_sync.reconcile().await.unwrap();
    let record = ctx.record(&record_id).await;
    assert_eq!(record.state().unwrap(), SyncRecordState::Synced);
    assert_eq!(record.bill_count, 3);

    let sent = ctx.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].account_type, "owner");
    assert_eq!(sent[0].currency, "CNY");
    // Tencent Cloud sums the list cost column.
    assert_eq!(sent[0].sum, Decimal::new(6, 0));
}

fn batch_starts(created: &[TaskSpec]) -> Vec<i64> {
    created
        .iter()
        .filter(|t| t.kind == TaskKind::BillItemBatch)
        .filter_map(|t| t.payload_i64("start"))
        .collect()
}

#[tokio::test]
async fn test_failed_batch_whose_recreate_fails_is_retried_once() {
    let flows = MockFlowDelegate::new().fail_once_where(|task| task.payload_i64("start") == Some(10));
    let ctx = TestContext::sqlite(flows, config(10)).await;
    let bills = bill_rows(Vendor::Aws, period(), "m1", "s1", 25, "1.00", "1.00");
    let record_id = ctx.seed_record(Vendor::Aws, period(), &bills).await;

    // Walk until the failing batch has been delegated.
    for _ in 0..MAX_TICKS {
        ctx.bill_sync.reconcile().await.unwrap();
        if batch_starts(&ctx.flows.created().await) == vec![0, 10] {
            break;
        }
    }
    let item = ctx.record(&record_id).await.checkpoint().unwrap().items()[0].clone();
    assert!(item.flow_id.is_some());
    assert_eq!(item.current_index, 10);

    // The failed flow is detected but its replacement cannot be created.
    ctx.flows.set_rejecting_creates(true);
    ctx.bill_sync.reconcile().await.unwrap();

    let record = ctx.record(&record_id).await;
    assert_eq!(record.state().unwrap(), SyncRecordState::SyncingBillItem);
    let item = record.checkpoint().unwrap().items()[0].clone();
    assert_eq!(item.state, SyncItemState::Syncing);
    assert!(item.flow_id.is_none());
    assert_eq!(item.failed_attempts, 1);
    assert_eq!(item.current_index, 10);
    assert_eq!(batch_starts(&ctx.flows.created().await), vec![0, 10]);

    // Next tick delegates the same range exactly once.
    ctx.flows.set_rejecting_creates(false);
    ctx.bill_sync.reconcile().await.unwrap();

    let item = ctx.record(&record_id).await.checkpoint().unwrap().items()[0].clone();
    assert!(item.flow_id.is_some());
    assert_eq!(item.current_index, 10);
    assert_eq!(batch_starts(&ctx.flows.created().await), vec![0, 10, 10]);

    drive_to_synced(&ctx, &record_id).await;
    assert_eq!(batch_starts(&ctx.flows.created().await), vec![0, 10, 10, 20]);
}

#[tokio::test]
async fn test_failed_adjustment_whose_recreate_fails_is_retried_once() {
    let flows = MockFlowDelegate::new().fail_once_where(|task| task.kind == TaskKind::BillAdjustment);
    let ctx = TestContext::sqlite(flows, config(100)).await;
    let bills = bill_rows(Vendor::Gcp, period(), "ba-1", "proj-1", 4, "1.00", "1.00");
    let record_id = ctx.seed_record(Vendor::Gcp, period(), &bills).await;
    let adjustments = |created: &[TaskSpec]| {
        created
            .iter()
            .filter(|t| t.kind == TaskKind::BillAdjustment)
            .count()
    };

    for _ in 0..MAX_TICKS {
        ctx.bill_sync.reconcile().await.unwrap();
        if ctx.record(&record_id).await.adjustment_flow_id.is_some() {
            break;
        }
    }
    assert_eq!(adjustments(&ctx.flows.created().await), 1);

    ctx.flows.set_rejecting_creates(true);
    ctx.bill_sync.reconcile().await.unwrap();

    let record = ctx.record(&record_id).await;
    assert_eq!(record.state().unwrap(), SyncRecordState::SyncingAdjustment);
    assert!(record.adjustment_flow_id.is_none());
    assert_eq!(record.adjustment_attempts, 1);
    assert_eq!(adjustments(&ctx.flows.created().await), 1);

    ctx.flows.set_rejecting_creates(false);
    ctx.bill_sync.reconcile().await.unwrap();

    let record = ctx.record(&record_id).await;
    assert!(record.adjustment_flow_id.is_some());
    assert_eq!(record.adjustment_attempts, 1);
    assert_eq!(adjustments(&ctx.flows.created().await), 2);

    ctx.bill_sync.reconcile().await.unwrap();
    assert_eq!(
        ctx.record(&record_id).await.state().unwrap(),
        SyncRecordState::Synced
    );
    assert_eq!(ctx.notifier.sent().await.len(), 1);
}

#[tokio::test]
async fn test_records_progress_independently() {
    let ctx = TestContext::sqlite(MockFlowDelegate::new(), config(100)).await;
    let may = period();
    let june = Period::new(2024, 6).unwrap();

    let broken = ctx
        .seed_record(
            Vendor::Aws,
            may,
            &bill_rows(Vendor::Aws, may, "m1", "s1", 5, "1.00", "1.00"),
        )
        .await;
    let healthy = ctx
        .seed_record(
            Vendor::Azure,
            june,
            &bill_rows(Vendor::Azure, june, "sub-a", "rg-a", 5, "1.00", "1.00"),
        )
        .await;

    // Once the first record is past init, corrupt its vendor tag.
    ctx.bill_sync.reconcile().await.unwrap();
    ctx.store
        .update_where(
            Table::SyncRecords,
            &Filter::new().eq(columns::ID, broken.as_str()),
            &Patch::new().set(columns::VENDOR, "oracle"),
        )
        .await
        .unwrap();

    let states = drive_to_synced(&ctx, &healthy).await;
    assert_eq!(states.last(), Some(&SyncRecordState::Synced));
    assert_eq!(
        ctx.record(&broken).await.state().unwrap(),
        SyncRecordState::SyncingBillItem
    );
}

#[tokio::test]
async fn test_runtime_drives_record_to_synced() {
    let store = sqlite_store().await;
    let flows = Arc::new(MockFlowDelegate::new());
    let notifier = Arc::new(MockBillingNotifier::new());

    store
        .insert_bill_items(&bill_rows(Vendor::HuaweiCloud, period(), "c1", "s1", 12, "1.00", "0.50"))
        .await
        .unwrap();
    let record_id = store
        .insert_sync_record(&NewSyncRecord {
            vendor: Vendor::HuaweiCloud,
            period: period(),
        })
        .await
        .unwrap();

    let runtime = ReconcilerRuntime::builder()
        .store(store.clone())
        .flow_delegate(flows.clone())
        .rate_source(Arc::new(MockRateSource::new()))
        .notifier(notifier.clone())
        .leader_mode(LeaderMode::Always)
        .grace_period(Duration::ZERO)
        .bill_sync_interval(Duration::from_millis(20))
        .bill_sync_config(config(5))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_leader());

    let synced = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record = store.get_sync_record(&record_id).await.unwrap().unwrap();
            if record.state().unwrap() == SyncRecordState::Synced {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("record synced within timeout");

    runtime.shutdown().await.unwrap();

    assert_eq!(synced.bill_count, 12);
    assert_eq!(notifier.sent().await.len(), 1);
    assert_eq!(notifier.sent().await[0].sum, Decimal::new(6, 0));
}

#[tokio::test]
async fn test_postgres_failed_batch_is_redelegated() {
    skip_if_no_db!();

    let Some(store) = postgres_store().await else {
        panic!("TEST_TALLY_DATABASE_URL is set but the database is unreachable");
    };
    let flows = MockFlowDelegate::new().fail_once_where(|task| task.payload_i64("start") == Some(4));
    let ctx = TestContext::with_store(store, flows, config(4));
    let period = unique_period();

    let bills = bill_rows(Vendor::Aws, period, "m1", "s1", 10, "0.50", "0.25");
    let record_id = ctx.seed_record(Vendor::Aws, period, &bills).await;

    drive_to_synced(&ctx, &record_id).await;

    let starts: Vec<_> = ctx
        .flows
        .created()
        .await
        .iter()
        .filter_map(|t| t.payload_i64("start"))
        .collect();
    assert_eq!(starts, vec![0, 4, 4, 8]);

    let record = ctx.record(&record_id).await;
    assert_eq!(record.bill_count, 10);
    assert_eq!(ctx.notifier.sent().await[0].sum, Decimal::new(250, 2));
}
