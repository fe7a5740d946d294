// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External service clients.
//!
//! The controllers only see the traits in this module. [`http`] provides the
//! JSON-over-HTTP implementations used in production and [`mock`] in-memory
//! ones for tests and local runs.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_core::{CostColumn, Period};

/// Errors from external service clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure (connect, timeout, TLS).
    #[error("request failed: {0}")]
    Request(String),

    /// The service answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The response could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else {
            ClientError::Request(err.to_string())
        }
    }
}

/// One upstream exchange rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRate {
    /// Source currency.
    pub from_currency: String,
    /// Target currency.
    pub to_currency: String,
    /// Rate from source to target.
    pub rate: Decimal,
}

/// Authoritative source of period exchange rates.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// All rates into `to` for a period, optionally from a single source
    /// currency. Implementations follow upstream pagination.
    async fn list_period_rates(
        &self,
        from: Option<&str>,
        to: &str,
        period: Period,
    ) -> Result<Vec<PeriodRate>, ClientError>;
}

/// Completion notification for a synced {vendor, period}.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingNotification {
    /// Accounting period.
    pub period: Period,
    /// Vendor-specific account type tag.
    pub account_type: String,
    /// Number of bill rows covered.
    pub total: i64,
    /// Monetary column that was summed.
    pub column: CostColumn,
    /// Sum of that column.
    pub sum: Decimal,
    /// Currency of the sum.
    pub currency: String,
}

/// Cloud billing notification system.
#[async_trait]
pub trait BillingNotifier: Send + Sync {
    /// Deliver a completion notification. Receivers must be idempotent per
    /// {period, account type}; delivery is at-least-once.
    async fn notify(&self, notification: &BillingNotification) -> Result<(), ClientError>;
}

/// Request to open an approval ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRequest {
    /// Parent resource plan ticket.
    pub ticket_id: i64,
    /// Sub-tickets covered by the approval.
    pub sub_ticket_ids: Vec<i64>,
    /// Request content of the sub-tickets, in order.
    pub content: Vec<String>,
}

/// Status of an approval ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TicketStatus {
    /// Still under review.
    Running,
    /// Approved.
    Approved,
    /// Rejected by a reviewer.
    Rejected {
        /// Reviewer comment.
        #[serde(default)]
        comment: Option<String>,
    },
    /// Withdrawn or broken down.
    Revoked {
        /// Reason given by the ticketing system.
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Approval ticketing service.
#[async_trait]
pub trait TicketService: Send + Sync {
    /// Open an approval ticket. Returns its serial number.
    async fn create_ticket(&self, request: &TicketRequest) -> Result<String, ClientError>;

    /// Current status of an approval ticket.
    async fn get_ticket_status(&self, sn: &str) -> Result<TicketStatus, ClientError>;
}
