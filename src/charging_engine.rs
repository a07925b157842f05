use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::config;

/// key: charging-engine -> external charge module client
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine understood the request and refused it. Not retryable; the
    /// affected unit of work is marked errored instead.
    #[error("charging engine rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    /// The engine could not be reached or timed out. Retryable through the
    /// normal job retry policy.
    #[error("charging engine unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid charging engine url: {0}")]
    Endpoint(#[from] url::ParseError),
    /// The bill run exists but its aggregates are still being generated.
    #[error("bill run {0} is still generating")]
    Pending(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBillRunRequest {
    pub region: String,
    pub batch_type: String,
    pub financial_year_ending: i32,
    pub is_summer: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillRunHandle {
    pub bill_run_id: String,
    pub bill_run_number: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChargeRequest {
    pub transaction_id: Uuid,
    pub licence_ref: String,
    pub invoice_account_number: String,
    pub financial_year_ending: i32,
    pub charge_period_start: NaiveDate,
    pub charge_period_end: NaiveDate,
    pub is_credit: bool,
    pub season: String,
    pub volume: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeConfirmation {
    pub charge_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillRunSummary {
    pub invoice_count: i32,
    pub credit_note_count: i32,
    pub invoice_value: Decimal,
    pub credit_note_value: Decimal,
    pub net_total: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceReference {
    pub invoice_account_number: String,
    pub financial_year_ending: i32,
    pub invoice_number: String,
}

/// The engine operations the pipeline depends on. Kept behind a trait so
/// tests run against [`StubChargingEngine`] instead of a live charge module.
#[async_trait]
pub trait ChargingEngine: Send + Sync {
    async fn create_bill_run(
        &self,
        request: &CreateBillRunRequest,
    ) -> Result<BillRunHandle, EngineError>;

    async fn create_charge(
        &self,
        bill_run_id: &str,
        request: &CreateChargeRequest,
    ) -> Result<ChargeConfirmation, EngineError>;

    async fn bill_run_summary(&self, bill_run_id: &str) -> Result<BillRunSummary, EngineError>;

    /// Finalizes the bill run on the engine side. Invoice references only
    /// exist after this call.
    async fn send_bill_run(&self, bill_run_id: &str) -> Result<(), EngineError>;

    async fn invoice_references(
        &self,
        bill_run_id: &str,
    ) -> Result<Vec<InvoiceReference>, EngineError>;
}

/// HTTP client for the charge module's bill-run API.
#[derive(Clone)]
pub struct ChargeModuleClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ChargeModuleClient {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let mut base = Url::parse(endpoint)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base, token })
    }

    pub fn from_env() -> Result<Self, EngineError> {
        Self::new(
            &config::CHARGE_MODULE_ENDPOINT,
            config::CHARGE_MODULE_TOKEN.clone(),
            Duration::from_secs(*config::CHARGE_MODULE_TIMEOUT_SECS),
        )
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(EngineError::Rejected {
            status: status.as_u16(),
            detail,
        })
    }
}

#[async_trait]
impl ChargingEngine for ChargeModuleClient {
    async fn create_bill_run(
        &self,
        request: &CreateBillRunRequest,
    ) -> Result<BillRunHandle, EngineError> {
        let url = self.base.join("v1/bill-runs")?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn create_charge(
        &self,
        bill_run_id: &str,
        request: &CreateChargeRequest,
    ) -> Result<ChargeConfirmation, EngineError> {
        let url = self.base.join(&format!("v1/bill-runs/{bill_run_id}/charges"))?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn bill_run_summary(&self, bill_run_id: &str) -> Result<BillRunSummary, EngineError> {
        let url = self.base.join(&format!("v1/bill-runs/{bill_run_id}/summary"))?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Err(EngineError::Pending(bill_run_id.to_string()));
        }
        Self::decode(response).await
    }

    async fn send_bill_run(&self, bill_run_id: &str) -> Result<(), EngineError> {
        let url = self.base.join(&format!("v1/bill-runs/{bill_run_id}/send"))?;
        let response = self.request(reqwest::Method::POST, url).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(EngineError::Rejected {
            status: status.as_u16(),
            detail,
        })
    }

    async fn invoice_references(
        &self,
        bill_run_id: &str,
    ) -> Result<Vec<InvoiceReference>, EngineError> {
        let url = self
            .base
            .join(&format!("v1/bill-runs/{bill_run_id}/invoice-references"))?;
        let response = self.request(reqwest::Method::GET, url).send().await?;
        Self::decode(response).await
    }
}

/// In-memory engine used by the pipeline integration tests. Bills and
/// charges are acknowledged immediately; the summary is an aggregate of the
/// charges the stub has seen, pricing one unit of volume at one currency
/// unit so totals are easy to assert against.
#[derive(Default)]
pub struct StubChargingEngine {
    state: Mutex<StubState>,
}

#[derive(Default)]
struct StubState {
    bill_runs: i64,
    charges: Vec<CreateChargeRequest>,
}

#[async_trait]
impl ChargingEngine for StubChargingEngine {
    async fn create_bill_run(
        &self,
        _request: &CreateBillRunRequest,
    ) -> Result<BillRunHandle, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.bill_runs += 1;
        Ok(BillRunHandle {
            bill_run_id: format!("stub-bill-run-{}", state.bill_runs),
            bill_run_number: 10000 + state.bill_runs,
        })
    }

    async fn create_charge(
        &self,
        _bill_run_id: &str,
        request: &CreateChargeRequest,
    ) -> Result<ChargeConfirmation, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.charges.push(request.clone());
        Ok(ChargeConfirmation {
            charge_id: format!("stub-charge-{}", request.transaction_id),
        })
    }

    async fn bill_run_summary(&self, _bill_run_id: &str) -> Result<BillRunSummary, EngineError> {
        let state = self.state.lock().unwrap();
        let mut summary = BillRunSummary::default();
        for charge in &state.charges {
            if charge.is_credit {
                summary.credit_note_count += 1;
                summary.credit_note_value += charge.volume;
            } else {
                summary.invoice_count += 1;
                summary.invoice_value += charge.volume;
            }
        }
        summary.net_total = summary.invoice_value - summary.credit_note_value;
        Ok(summary)
    }

    async fn send_bill_run(&self, _bill_run_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn invoice_references(
        &self,
        _bill_run_id: &str,
    ) -> Result<Vec<InvoiceReference>, EngineError> {
        let state = self.state.lock().unwrap();
        let mut seen: Vec<(String, i32)> = Vec::new();
        for charge in &state.charges {
            let key = (
                charge.invoice_account_number.clone(),
                charge.financial_year_ending,
            );
            if !seen.contains(&key) {
                seen.push(key);
            }
        }
        Ok(seen
            .into_iter()
            .enumerate()
            .map(|(i, (account, year))| InvoiceReference {
                invoice_account_number: account,
                financial_year_ending: year,
                invoice_number: format!("SINV{:06}", i + 1),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn bill_run_request() -> CreateBillRunRequest {
        CreateBillRunRequest {
            region: "anglian".into(),
            batch_type: "supplementary".into(),
            financial_year_ending: 2026,
            is_summer: false,
        }
    }

    #[tokio::test]
    async fn create_bill_run_sends_bearer_and_decodes_handle() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/bill-runs")
                .header("authorization", "Bearer sekrit");
            then.status(201)
                .json_body(json!({"billRunId": "BR-1", "billRunNumber": 10042}));
        });

        let client = ChargeModuleClient::new(
            &server.base_url(),
            Some("sekrit".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let handle = client.create_bill_run(&bill_run_request()).await.unwrap();

        mock.assert();
        assert_eq!(handle.bill_run_id, "BR-1");
        assert_eq!(handle.bill_run_number, 10042);
    }

    #[tokio::test]
    async fn engine_refusal_surfaces_as_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/bill-runs");
            then.status(422).body("unknown region");
        });

        let client =
            ChargeModuleClient::new(&server.base_url(), None, Duration::from_secs(5)).unwrap();
        let err = client
            .create_bill_run(&bill_run_request())
            .await
            .unwrap_err();

        match err {
            EngineError::Rejected { status, detail } => {
                assert_eq!(status, 422);
                assert_eq!(detail, "unknown region");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn generating_summary_surfaces_as_pending() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/bill-runs/BR-9/summary");
            then.status(202);
        });

        let client =
            ChargeModuleClient::new(&server.base_url(), None, Duration::from_secs(5)).unwrap();
        let err = client.bill_run_summary("BR-9").await.unwrap_err();
        assert!(matches!(err, EngineError::Pending(id) if id == "BR-9"));
    }

    #[tokio::test]
    async fn stub_summary_aggregates_charges_and_credits() {
        let stub = StubChargingEngine::default();
        let run = stub.create_bill_run(&bill_run_request()).await.unwrap();

        let mut charge = CreateChargeRequest {
            transaction_id: Uuid::new_v4(),
            licence_ref: "01/234".into(),
            invoice_account_number: "A10000000A".into(),
            financial_year_ending: 2026,
            charge_period_start: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            charge_period_end: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            is_credit: false,
            season: "winter_all_year".into(),
            volume: Decimal::new(100, 0),
            description: "abstraction charge".into(),
        };
        stub.create_charge(&run.bill_run_id, &charge).await.unwrap();
        charge.transaction_id = Uuid::new_v4();
        charge.is_credit = true;
        charge.volume = Decimal::new(40, 0);
        stub.create_charge(&run.bill_run_id, &charge).await.unwrap();

        let summary = stub.bill_run_summary(&run.bill_run_id).await.unwrap();
        assert_eq!(summary.invoice_count, 1);
        assert_eq!(summary.credit_note_count, 1);
        assert_eq!(summary.net_total, Decimal::new(60, 0));

        let references = stub.invoice_references(&run.bill_run_id).await.unwrap();
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].invoice_number, "SINV000001");
    }
}
