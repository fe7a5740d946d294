// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract with the external flow-execution service.
//!
//! The controller never executes bill processing itself: it hands a bounded
//! unit of work to the service, keeps the returned flow ID in its checkpoint,
//! and polls the flow on later ticks.

pub mod mock;

pub use mock::MockFlowDelegate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::checkpoint::SyncItem;
use crate::types::{Period, Vendor};

/// State of a delegated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Accepted, not started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failed,
    /// Stopped before finishing.
    Cancelled,
}

impl FlowState {
    /// Whether the flow will not change state anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Failed and cancelled flows are both recreated for the same unit.
    pub fn needs_recreate(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// Kind of delegated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Process one index range of base bill rows for an account pair.
    BillItemBatch,
    /// Apply adjustments over a whole {vendor, period}.
    BillAdjustment,
}

/// A unit of work submitted to the flow service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// What the flow does.
    pub kind: TaskKind,
    /// Task parameters.
    pub payload: Value,
}

impl TaskSpec {
    /// Batch `[current_index, current_index + batch_size)` of an item.
    pub fn bill_item_batch(record_id: &str, item: &SyncItem) -> Self {
        let (start, end) = item.batch_range();
        Self {
            kind: TaskKind::BillItemBatch,
            payload: json!({
                "record_id": record_id,
                "vendor": item.vendor,
                "period": item.period,
                "main_account_id": item.main_account_id,
                "sub_account_id": item.sub_account_id,
                "start": start,
                "end": end,
            }),
        }
    }

    /// Adjustment pass over a whole sync record.
    pub fn bill_adjustment(record_id: &str, vendor: Vendor, period: Period) -> Self {
        Self {
            kind: TaskKind::BillAdjustment,
            payload: json!({
                "record_id": record_id,
                "vendor": vendor,
                "period": period,
            }),
        }
    }

    /// Integer payload field, if present.
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }

    /// String payload field, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Errors from the flow service.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Transport or server failure.
    #[error("flow service request failed: {0}")]
    Request(String),

    /// The service does not know the flow.
    #[error("flow '{flow_id}' not found")]
    NotFound {
        /// The unknown flow ID.
        flow_id: String,
    },

    /// The service answered with something unparseable.
    #[error("invalid flow service response: {0}")]
    InvalidResponse(String),
}

/// Client over the asynchronous flow-execution service.
#[async_trait]
pub trait FlowDelegate: Send + Sync {
    /// Submit a unit of work. Returns the new flow's ID.
    async fn create_flow(&self, task: &TaskSpec) -> Result<String, FlowError>;

    /// Current state of a flow.
    async fn get_flow(&self, flow_id: &str) -> Result<FlowState, FlowError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_state_classification() {
        assert!(!FlowState::Pending.is_terminal());
        assert!(!FlowState::Running.is_terminal());
        assert!(FlowState::Success.is_terminal());
        assert!(FlowState::Cancelled.is_terminal());

        assert!(FlowState::Failed.needs_recreate());
        assert!(FlowState::Cancelled.needs_recreate());
        assert!(!FlowState::Success.needs_recreate());
    }

    #[test]
    fn test_batch_task_payload() {
        let period = Period::new(2024, 5).unwrap();
        let mut item = SyncItem::new("m1", "s1", Vendor::Aws, period, 50);
        item.set_total(120);
        item.complete_batch();

        let task = TaskSpec::bill_item_batch("r-1", &item);
        assert_eq!(task.kind, TaskKind::BillItemBatch);
        assert_eq!(task.payload_i64("start"), Some(50));
        assert_eq!(task.payload_i64("end"), Some(100));
        assert_eq!(task.payload_str("period"), Some("2024-05"));
        assert_eq!(task.payload_str("vendor"), Some("aws"));

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "bill_item_batch");
    }

    #[test]
    fn test_flow_state_serde() {
        let state: FlowState = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(state, FlowState::Cancelled);
    }
}
