// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-vendor notification settings.

use tally_core::{CostColumn, Vendor};

/// How a vendor's completed bills are summarized and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorProfile {
    /// Account type tag sent with the completion notification.
    pub account_type: &'static str,
    /// Monetary column that is summed.
    pub cost_column: CostColumn,
    /// Currency the vendor bills in.
    pub currency: &'static str,
}

impl VendorProfile {
    /// Profile of a vendor.
    pub fn of(vendor: Vendor) -> Self {
        match vendor {
            Vendor::Aws => Self {
                account_type: "payer",
                cost_column: CostColumn::RealCost,
                currency: "USD",
            },
            Vendor::TencentCloud => Self {
                account_type: "owner",
                cost_column: CostColumn::Cost,
                currency: "CNY",
            },
            Vendor::HuaweiCloud => Self {
                account_type: "customer",
                cost_column: CostColumn::RealCost,
                currency: "CNY",
            },
            Vendor::Gcp => Self {
                account_type: "billing_account",
                cost_column: CostColumn::Cost,
                currency: "USD",
            },
            Vendor::Azure => Self {
                account_type: "subscription",
                cost_column: CostColumn::Cost,
                currency: "USD",
            },
        }
    }
}
