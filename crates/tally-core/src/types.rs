// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain value types shared by the store and the controllers.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ============================================================================
// Accounting period
// ============================================================================

/// Accounting period, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Create a period, validating the month.
    pub fn new(year: i32, month: u32) -> Result<Self, CoreError> {
        if !(1..=12).contains(&month) {
            return Err(CoreError::validation(
                "period",
                format!("month {} out of range", month),
            ));
        }
        Ok(Self { year, month })
    }

    /// The period a calendar date falls into.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The period immediately before this one.
    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// The `count` periods before this one, most recent first.
    ///
    /// The period itself is not included.
    pub fn preceding(self, count: usize) -> Vec<Self> {
        let mut periods = Vec::with_capacity(count);
        let mut current = self;
        for _ in 0..count {
            current = current.previous();
            periods.push(current);
        }
        periods
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::validation("period", format!("'{}' is not YYYY-MM", s));
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for Period {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

// ============================================================================
// Vendors
// ============================================================================

/// Cloud vendor a bill originates from. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    /// Amazon Web Services.
    Aws,
    /// Tencent Cloud.
    TencentCloud,
    /// Huawei Cloud.
    HuaweiCloud,
    /// Google Cloud Platform.
    Gcp,
    /// Microsoft Azure.
    Azure,
}

impl Vendor {
    /// All known vendors.
    pub const ALL: [Vendor; 5] = [
        Vendor::Aws,
        Vendor::TencentCloud,
        Vendor::HuaweiCloud,
        Vendor::Gcp,
        Vendor::Azure,
    ];

    /// Stored tag of the vendor.
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Aws => "aws",
            Vendor::TencentCloud => "tencent_cloud",
            Vendor::HuaweiCloud => "huawei_cloud",
            Vendor::Gcp => "gcp",
            Vendor::Azure => "azure",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Vendor::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| CoreError::UnknownVendor {
                vendor: s.to_string(),
            })
    }
}

/// Monetary column of `bill_items` a vendor reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostColumn {
    /// List price before discounts.
    Cost,
    /// Amount actually charged.
    RealCost,
}

impl CostColumn {
    /// Column name in `bill_items`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CostColumn::Cost => "cost",
            CostColumn::RealCost => "real_cost",
        }
    }
}

// ============================================================================
// Sync record state
// ============================================================================

/// Top-level state of a sync record.
///
/// ```text
/// New ──▶ SyncingBillItem ──▶ SyncingAdjustment ──▶ Synced
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRecordState {
    /// Created by ingestion, no checkpoint yet.
    New,
    /// Sub-items are being delegated and polled.
    SyncingBillItem,
    /// All items synced, adjustment flow in progress.
    SyncingAdjustment,
    /// Terminal.
    Synced,
}

impl SyncRecordState {
    /// Non-terminal states a controller should pick up.
    pub const ACTIVE: [SyncRecordState; 3] = [
        SyncRecordState::New,
        SyncRecordState::SyncingBillItem,
        SyncRecordState::SyncingAdjustment,
    ];

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::SyncingBillItem => "syncing_bill_item",
            Self::SyncingAdjustment => "syncing_adjustment",
            Self::Synced => "synced",
        }
    }
}

impl fmt::Display for SyncRecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncRecordState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "syncing_bill_item" => Ok(Self::SyncingBillItem),
            "syncing_adjustment" => Ok(Self::SyncingAdjustment),
            "synced" => Ok(Self::Synced),
            other => Err(CoreError::validation(
                "state",
                format!("unknown sync record state '{}'", other),
            )),
        }
    }
}

// ============================================================================
// Sub-ticket status
// ============================================================================

/// Status of a resource plan sub-ticket.
///
/// ```text
///   init ──▶ auditing ──▶ done
///    │        │  ▲   ╲
///    │        ▼  │    ╲──▶ rejected / failed
///    │      revising ──▶ rejected
///    └──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTicketStatus {
    /// Created, approval ticket not opened yet.
    Init,
    /// Waiting on the approval ticket.
    Auditing,
    /// Sent back to the applicant for changes.
    Revising,
    /// Approved.
    Done,
    /// Rejected by a reviewer.
    Rejected,
    /// Approval flow broke down.
    Failed,
}

impl SubTicketStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Auditing => "auditing",
            Self::Revising => "revising",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    /// Failure outcomes must carry a message.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Rejected | Self::Failed)
    }

    /// Terminal statuses never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Rejected | Self::Failed)
    }

    /// Whether `self -> target` is an allowed transition.
    pub fn can_transition_to(&self, target: SubTicketStatus) -> bool {
        use SubTicketStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, target),
            (Init, Auditing)
                | (Init, Failed)
                | (Auditing, Revising)
                | (Auditing, Done)
                | (Auditing, Rejected)
                | (Auditing, Failed)
                | (Revising, Auditing)
                | (Revising, Rejected)
        )
    }
}

impl fmt::Display for SubTicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubTicketStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "auditing" => Ok(Self::Auditing),
            "revising" => Ok(Self::Revising),
            "done" => Ok(Self::Done),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::validation(
                "status",
                format!("unknown sub-ticket status '{}'", other),
            )),
        }
    }
}
