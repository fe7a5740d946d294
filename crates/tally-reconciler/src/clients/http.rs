// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-over-HTTP clients for the external services.
//!
//! | Service | Endpoint |
//! |---------|----------|
//! | Flow execution | `POST /flows`, `GET /flows/{id}` |
//! | Rate source | `GET /rates?period=&to=[&from=]&page=` |
//! | Billing notification | `POST /notifications` |
//! | Ticketing | `POST /tickets`, `GET /tickets/{sn}` |
//!
//! Every request carries the client-wide timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use tally_core::{FlowDelegate, FlowError, FlowState, Period, TaskSpec};

use super::{
    BillingNotification, BillingNotifier, ClientError, PeriodRate, RateSource, TicketRequest,
    TicketService, TicketStatus,
};

/// Build the shared HTTP client.
pub fn build_client(timeout: Duration) -> Result<Client, ClientError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ClientError::Request(format!("failed to build HTTP client: {e}")))
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/// Turn a non-success response into a [`ClientError::Status`].
async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

// ============================================================================
// Flow service
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreatedFlow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FlowStatus {
    state: FlowState,
}

/// [`FlowDelegate`] backed by the flow service HTTP API.
#[derive(Clone)]
pub struct HttpFlowDelegate {
    client: Client,
    base_url: String,
}

impl HttpFlowDelegate {
    /// Create a delegate for the service at `base_url`.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

fn flow_request_error(err: reqwest::Error) -> FlowError {
    if err.is_decode() {
        FlowError::InvalidResponse(err.to_string())
    } else {
        FlowError::Request(err.to_string())
    }
}

#[async_trait]
impl FlowDelegate for HttpFlowDelegate {
    async fn create_flow(&self, task: &TaskSpec) -> Result<String, FlowError> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "flows"))
            .json(task)
            .send()
            .await
            .map_err(flow_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FlowError::Request(format!("status {status}: {body}")));
        }

        let created: CreatedFlow = response.json().await.map_err(flow_request_error)?;
        if created.id.is_empty() {
            return Err(FlowError::InvalidResponse("empty flow id".to_string()));
        }
        debug!(flow_id = %created.id, kind = ?task.kind, "Created flow");
        Ok(created.id)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<FlowState, FlowError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, &format!("flows/{flow_id}")))
            .send()
            .await
            .map_err(flow_request_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(FlowError::NotFound {
                flow_id: flow_id.to_string(),
            }),
            status if status.is_success() => {
                let flow: FlowStatus = response.json().await.map_err(flow_request_error)?;
                Ok(flow.state)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(FlowError::Request(format!("status {status}: {body}")))
            }
        }
    }
}

// ============================================================================
// Rate source
// ============================================================================

#[derive(Debug, Deserialize)]
struct RatePage {
    items: Vec<PeriodRate>,
    #[serde(default)]
    next_page: Option<u32>,
}

/// [`RateSource`] backed by the financial data HTTP API.
#[derive(Clone)]
pub struct HttpRateSource {
    client: Client,
    base_url: String,
}

impl HttpRateSource {
    /// Create a client for the service at `base_url`.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn list_period_rates(
        &self,
        from: Option<&str>,
        to: &str,
        period: Period,
    ) -> Result<Vec<PeriodRate>, ClientError> {
        let url = endpoint(&self.base_url, "rates");
        let period = period.to_string();
        let mut rates = Vec::new();
        let mut page = 1u32;

        loop {
            let mut query = vec![
                ("period", period.clone()),
                ("to", to.to_string()),
                ("page", page.to_string()),
            ];
            if let Some(from) = from {
                query.push(("from", from.to_string()));
            }

            let response = self.client.get(&url).query(&query).send().await?;
            let body: RatePage = check_status(response).await?.json().await?;
            rates.extend(body.items);

            match body.next_page {
                Some(next) if next > page => page = next,
                Some(next) => {
                    return Err(ClientError::InvalidResponse(format!(
                        "pagination did not advance (page {page}, next {next})"
                    )));
                }
                None => break,
            }
        }

        debug!(period = %period, to, count = rates.len(), "Fetched upstream rates");
        Ok(rates)
    }
}

// ============================================================================
// Billing notification
// ============================================================================

/// [`BillingNotifier`] backed by the notification HTTP API.
#[derive(Clone)]
pub struct HttpBillingNotifier {
    client: Client,
    base_url: String,
}

impl HttpBillingNotifier {
    /// Create a client for the service at `base_url`.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BillingNotifier for HttpBillingNotifier {
    async fn notify(&self, notification: &BillingNotification) -> Result<(), ClientError> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "notifications"))
            .json(notification)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

// ============================================================================
// Ticketing
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreatedTicket {
    sn: String,
}

/// [`TicketService`] backed by the ticketing HTTP API.
#[derive(Clone)]
pub struct HttpTicketService {
    client: Client,
    base_url: String,
}

impl HttpTicketService {
    /// Create a client for the service at `base_url`.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TicketService for HttpTicketService {
    async fn create_ticket(&self, request: &TicketRequest) -> Result<String, ClientError> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "tickets"))
            .json(request)
            .send()
            .await?;
        let created: CreatedTicket = check_status(response).await?.json().await?;
        if created.sn.is_empty() {
            return Err(ClientError::InvalidResponse("empty ticket sn".to_string()));
        }
        Ok(created.sn)
    }

    async fn get_ticket_status(&self, sn: &str) -> Result<TicketStatus, ClientError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, &format!("tickets/{sn}")))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use tally_core::{CostColumn, TaskKind};
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        build_client(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_flow() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/flows"))
            .and(body_partial_json(json!({ "kind": "bill_adjustment" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "flow-42" })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/flows/flow-42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": "flow-42", "state": "running" })),
            )
            .mount(&mock_server)
            .await;

        let delegate = HttpFlowDelegate::new(client(), format!("{}/", mock_server.uri()));
        let task = TaskSpec {
            kind: TaskKind::BillAdjustment,
            payload: json!({ "record_id": "r-1" }),
        };

        let id = delegate.create_flow(&task).await.unwrap();
        assert_eq!(id, "flow-42");
        assert_eq!(delegate.get_flow(&id).await.unwrap(), FlowState::Running);
    }

    #[tokio::test]
    async fn test_get_flow_not_found_and_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flows/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/flows/broken"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let delegate = HttpFlowDelegate::new(client(), mock_server.uri());

        assert!(matches!(
            delegate.get_flow("gone").await,
            Err(FlowError::NotFound { .. })
        ));
        match delegate.get_flow("broken").await {
            Err(FlowError::Request(msg)) => assert!(msg.contains("maintenance")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_flow_invalid_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flows/odd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": "exploded" })))
            .mount(&mock_server)
            .await;

        let delegate = HttpFlowDelegate::new(client(), mock_server.uri());
        assert!(matches!(
            delegate.get_flow("odd").await,
            Err(FlowError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_source_follows_pages() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rates"))
            .and(query_param("period", "2024-04"))
            .and(query_param("to", "CNY"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{ "from_currency": "USD", "to_currency": "CNY", "rate": "7.1" }],
                "next_page": 2
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rates"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{ "from_currency": "EUR", "to_currency": "CNY", "rate": 7.8 }],
                "next_page": null
            })))
            .mount(&mock_server)
            .await;

        let source = HttpRateSource::new(client(), mock_server.uri());
        let rates = source
            .list_period_rates(None, "CNY", Period::new(2024, 4).unwrap())
            .await
            .unwrap();

        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].from_currency, "USD");
        assert_eq!(rates[0].rate, "7.1".parse::<Decimal>().unwrap());
        assert_eq!(rates[1].rate, "7.8".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn test_rate_source_passes_source_filter() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rates"))
            .and(query_param("from", "USD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let source = HttpRateSource::new(client(), mock_server.uri());
        let rates = source
            .list_period_rates(Some("USD"), "CNY", Period::new(2024, 4).unwrap())
            .await
            .unwrap();
        assert!(rates.is_empty());
    }

    #[tokio::test]
    async fn test_rate_source_error_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&mock_server)
            .await;

        let source = HttpRateSource::new(client(), mock_server.uri());
        let err = source
            .list_period_rates(None, "USD", Period::new(2024, 4).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_notifier_posts_notification() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/notifications"))
            .and(body_partial_json(json!({
                "period": "2024-05",
                "account_type": "payer",
                "total": 120,
                "column": "real_cost",
                "sum": "99.5"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let notifier = HttpBillingNotifier::new(client(), mock_server.uri());
        notifier
            .notify(&BillingNotification {
                period: Period::new(2024, 5).unwrap(),
                account_type: "payer".to_string(),
                total: 120,
                column: CostColumn::RealCost,
                sum: "99.5".parse().unwrap(),
                currency: "USD".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ticket_service() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/tickets"))
            .and(body_partial_json(json!({ "ticket_id": 7, "sub_ticket_ids": [1, 2] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sn": "ITSM-001" })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/tickets/ITSM-001"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "status": "rejected", "comment": "no budget" })),
            )
            .mount(&mock_server)
            .await;

        let service = HttpTicketService::new(client(), mock_server.uri());
        let sn = service
            .create_ticket(&TicketRequest {
                ticket_id: 7,
                sub_ticket_ids: vec![1, 2],
                content: vec![],
            })
            .await
            .unwrap();
        assert_eq!(sn, "ITSM-001");

        let status = service.get_ticket_status(&sn).await.unwrap();
        assert_eq!(
            status,
            TicketStatus::Rejected {
                comment: Some("no budget".to_string())
            }
        );
    }
}
