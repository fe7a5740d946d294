// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory service clients for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use tally_core::Period;

use super::{
    BillingNotification, BillingNotifier, ClientError, PeriodRate, RateSource, TicketRequest,
    TicketService, TicketStatus,
};

fn unavailable(service: &str) -> ClientError {
    ClientError::Request(format!("{service} unavailable"))
}

// ============================================================================
// Rate source
// ============================================================================

/// Rate source serving a fixed table of rates per period.
#[derive(Default)]
pub struct MockRateSource {
    rates: Mutex<HashMap<Period, Vec<PeriodRate>>>,
    failing_targets: Mutex<Vec<String>>,
    calls: AtomicU64,
}

impl MockRateSource {
    /// An empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a rate for a period.
    pub async fn add_rate(&self, period: Period, from: &str, to: &str, rate: &str) {
        let rate = PeriodRate {
            from_currency: from.to_string(),
            to_currency: to.to_string(),
            rate: rate.parse().unwrap_or_default(),
        };
        self.rates.lock().await.entry(period).or_default().push(rate);
    }

    /// Make every request for target `to` fail.
    pub async fn fail_target(&self, to: &str) {
        self.failing_targets.lock().await.push(to.to_string());
    }

    /// Requests served so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateSource for MockRateSource {
    async fn list_period_rates(
        &self,
        from: Option<&str>,
        to: &str,
        period: Period,
    ) -> Result<Vec<PeriodRate>, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_targets.lock().await.iter().any(|t| t == to) {
            return Err(unavailable("rate source"));
        }

        Ok(self
            .rates
            .lock()
            .await
            .get(&period)
            .map(|rates| {
                rates
                    .iter()
                    .filter(|r| r.to_currency == to)
                    .filter(|r| from.is_none_or(|from| r.from_currency == from))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// Billing notification
// ============================================================================

/// Notifier recording every delivered notification.
#[derive(Default)]
pub struct MockBillingNotifier {
    sent: Mutex<Vec<BillingNotification>>,
    failing: AtomicBool,
}

impl MockBillingNotifier {
    /// A notifier that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries fail (or recover).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notifications delivered so far.
    pub async fn sent(&self) -> Vec<BillingNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl BillingNotifier for MockBillingNotifier {
    async fn notify(&self, notification: &BillingNotification) -> Result<(), ClientError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("notification service"));
        }
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

// ============================================================================
// Ticketing
// ============================================================================

/// Ticketing service with manually driven ticket statuses.
#[derive(Default)]
pub struct MockTicketService {
    tickets: Mutex<HashMap<String, (TicketRequest, TicketStatus)>>,
    next_sn: AtomicU64,
    unavailable: AtomicBool,
}

impl MockTicketService {
    /// A service where new tickets start `Running`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Set the status reported for a ticket.
    pub async fn set_status(&self, sn: &str, status: TicketStatus) {
        if let Some(ticket) = self.tickets.lock().await.get_mut(sn) {
            ticket.1 = status;
        }
    }

    /// Request a ticket was opened with.
    pub async fn request_of(&self, sn: &str) -> Option<TicketRequest> {
        self.tickets.lock().await.get(sn).map(|t| t.0.clone())
    }

    /// Number of tickets opened.
    pub async fn ticket_count(&self) -> usize {
        self.tickets.lock().await.len()
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("ticket service"));
        }
        Ok(())
    }
}

#[async_trait]
impl TicketService for MockTicketService {
    async fn create_ticket(&self, request: &TicketRequest) -> Result<String, ClientError> {
        self.check_available()?;
        let sn = format!("SN-{}", self.next_sn.fetch_add(1, Ordering::SeqCst) + 1);
        self.tickets
            .lock()
            .await
            .insert(sn.clone(), (request.clone(), TicketStatus::Running));
        Ok(sn)
    }

    async fn get_ticket_status(&self, sn: &str) -> Result<TicketStatus, ClientError> {
        self.check_available()?;
        self.tickets
            .lock()
            .await
            .get(sn)
            .map(|t| t.1.clone())
            .ok_or_else(|| ClientError::Status {
                status: 404,
                body: format!("ticket {sn} not found"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::CostColumn;

    #[tokio::test]
    async fn test_rate_source_filters_by_target_and_source() {
        let source = MockRateSource::new();
        let period = Period::new(2024, 4).unwrap();
        source.add_rate(period, "USD", "CNY", "7.1").await;
        source.add_rate(period, "EUR", "CNY", "7.8").await;
        source.add_rate(period, "CNY", "USD", "0.14").await;

        let all = source.list_period_rates(None, "CNY", period).await.unwrap();
        assert_eq!(all.len(), 2);

        let usd = source
            .list_period_rates(Some("USD"), "CNY", period)
            .await
            .unwrap();
        assert_eq!(usd.len(), 1);

        source.fail_target("USD").await;
        assert!(source.list_period_rates(None, "USD", period).await.is_err());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_notifier_records_and_fails() {
        let notifier = MockBillingNotifier::new();
        let notification = BillingNotification {
            period: Period::new(2024, 4).unwrap(),
            account_type: "payer".to_string(),
            total: 3,
            column: CostColumn::Cost,
            sum: "1.5".parse().unwrap(),
            currency: "USD".to_string(),
        };

        notifier.set_failing(true);
        assert!(notifier.notify(&notification).await.is_err());
        assert!(notifier.sent().await.is_empty());

        notifier.set_failing(false);
        notifier.notify(&notification).await.unwrap();
        assert_eq!(notifier.sent().await, vec![notification]);
    }

    #[tokio::test]
    async fn test_ticket_service_lifecycle() {
        let service = MockTicketService::new();
        let sn = service
            .create_ticket(&TicketRequest {
                ticket_id: 1,
                sub_ticket_ids: vec![10],
                content: vec!["2 vCPU".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(sn, "SN-1");
        assert_eq!(
            service.get_ticket_status(&sn).await.unwrap(),
            TicketStatus::Running
        );

        service.set_status(&sn, TicketStatus::Approved).await;
        assert_eq!(
            service.get_ticket_status(&sn).await.unwrap(),
            TicketStatus::Approved
        );
        assert!(service.get_ticket_status("SN-404").await.is_err());
    }
}
