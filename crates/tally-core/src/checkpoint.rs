// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint: per-record progress of sub-items.
//!
//! A checkpoint is the only cross-restart resumability mechanism for a sync
//! record. It is stored as JSON in the record's `detail` column and rewritten
//! as a whole on every tick that changes it.
//!
//! # Wire format
//!
//! ```json
//! {"version": 1, "items": [{"main_account_id": "...", "state": "syncing", ...}]}
//! ```
//!
//! Older controllers wrote a bare JSON array of items; [`Checkpoint::decode`]
//! accepts both shapes. Unknown fields are ignored so newer writers stay
//! readable by older readers.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Period, Vendor};

/// Current envelope version written by [`Checkpoint::encode`].
pub const CHECKPOINT_VERSION: u32 = 1;

/// State of a single sync item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemState {
    /// Total not computed yet.
    #[default]
    New,
    /// Total known; batches are being delegated.
    Syncing,
    /// Last batch succeeded.
    Synced,
}

/// One unit of reconciliation within a sync record: a single account pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Payer / main account.
    pub main_account_id: String,
    /// Linked / sub account.
    pub sub_account_id: String,
    /// Vendor of the bills.
    pub vendor: Vendor,
    /// Accounting period.
    pub period: Period,
    /// Number of base bill rows in scope; 0 until the item leaves `New`.
    #[serde(default)]
    pub total: i64,
    /// Start of the next batch to delegate.
    #[serde(default)]
    pub current_index: i64,
    /// Stride of the cursor.
    pub batch_size: i64,
    /// In-flight flow, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Progress state.
    #[serde(default)]
    pub state: SyncItemState,
    /// Consecutive failed flows for the current batch.
    #[serde(default)]
    pub failed_attempts: u32,
}

impl SyncItem {
    /// Create a fresh item at cursor zero.
    pub fn new(
        main_account_id: impl Into<String>,
        sub_account_id: impl Into<String>,
        vendor: Vendor,
        period: Period,
        batch_size: i64,
    ) -> Self {
        Self {
            main_account_id: main_account_id.into(),
            sub_account_id: sub_account_id.into(),
            vendor,
            period,
            total: 0,
            current_index: 0,
            batch_size,
            flow_id: None,
            state: SyncItemState::New,
            failed_attempts: 0,
        }
    }

    /// Human-readable identity used in logs.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.vendor, self.period, self.main_account_id, self.sub_account_id
        )
    }

    /// Whether the item reached its terminal state.
    pub fn is_synced(&self) -> bool {
        self.state == SyncItemState::Synced
    }

    /// Record the base row count and start syncing.
    pub fn set_total(&mut self, total: i64) {
        self.total = total.max(0);
        self.state = SyncItemState::Syncing;
    }

    /// The `[start, end)` range of the batch at the cursor, clamped to the
    /// item total.
    pub fn batch_range(&self) -> (i64, i64) {
        let end = (self.current_index + self.batch_size).min(self.total);
        (self.current_index, end.max(self.current_index))
    }

    /// Whether the batch at the cursor is the last one.
    pub fn is_last_batch(&self) -> bool {
        self.current_index + self.batch_size >= self.total
    }

    /// Whether there is nothing left to delegate (only an empty scope).
    pub fn has_nothing_to_sync(&self) -> bool {
        self.current_index >= self.total
    }

    /// Remember the flow delegated for the batch at the cursor.
    pub fn attach_flow(&mut self, flow_id: impl Into<String>) {
        self.flow_id = Some(flow_id.into());
    }

    /// The flow for the batch at the cursor succeeded.
    ///
    /// Either finishes the item or advances the cursor by exactly one batch.
    pub fn complete_batch(&mut self) {
        self.flow_id = None;
        self.failed_attempts = 0;
        if self.is_last_batch() {
            self.state = SyncItemState::Synced;
        } else {
            self.current_index += self.batch_size;
        }
    }

    /// The flow for the batch at the cursor failed; the range is retried.
    pub fn fail_batch(&mut self) {
        self.flow_id = None;
        self.failed_attempts = self.failed_attempts.saturating_add(1);
    }

    /// Mark an item with an empty scope as finished.
    pub fn finish_empty(&mut self) {
        self.flow_id = None;
        self.state = SyncItemState::Synced;
    }
}

/// Ordered list of sync items stored on a sync record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    items: Vec<SyncItem>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    items: &'a [SyncItem],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Stored {
    Envelope {
        #[allow(dead_code)]
        #[serde(default)]
        version: u32,
        items: Vec<SyncItem>,
    },
    Legacy(Vec<SyncItem>),
}

impl Checkpoint {
    /// Create a checkpoint from items in processing order.
    pub fn new(items: Vec<SyncItem>) -> Self {
        Self { items }
    }

    /// Items in processing order.
    pub fn items(&self) -> &[SyncItem] {
        &self.items
    }

    /// Whether the checkpoint holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether every item is synced. An empty checkpoint is not complete.
    pub fn all_synced(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(SyncItem::is_synced)
    }

    /// The first item that still has work, in checkpoint order.
    pub fn next_pending_mut(&mut self) -> Option<&mut SyncItem> {
        self.items.iter_mut().find(|item| !item.is_synced())
    }

    /// Serialize to the stored JSON form.
    pub fn encode(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(&EnvelopeRef {
            version: CHECKPOINT_VERSION,
            items: &self.items,
        })?)
    }

    /// Decode a stored checkpoint.
    ///
    /// `None` and blank input decode to an empty checkpoint.
    pub fn decode(record_id: &str, raw: Option<&str>) -> Result<Self, CoreError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::default());
        };

        let stored: Stored =
            serde_json::from_str(raw).map_err(|e| CoreError::CheckpointDecodeFailed {
                record_id: record_id.to_string(),
                reason: e.to_string(),
            })?;

        let items = match stored {
            Stored::Envelope { items, .. } => items,
            Stored::Legacy(items) => items,
        };
        Ok(Self { items })
    }
}
