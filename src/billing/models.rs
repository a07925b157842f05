use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-models -> batches,charge-version-years,volumes,transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Annual,
    Supplementary,
    TwoPartTariff,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Annual => "annual",
            BatchType::Supplementary => "supplementary",
            BatchType::TwoPartTariff => "two_part_tariff",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "annual" => Some(BatchType::Annual),
            "supplementary" => Some(BatchType::Supplementary),
            "two_part_tariff" => Some(BatchType::TwoPartTariff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Review,
    Empty,
    Ready,
    Sent,
    Error,
    Cancel,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Review => "review",
            BatchStatus::Empty => "empty",
            BatchStatus::Ready => "ready",
            BatchStatus::Sent => "sent",
            BatchStatus::Error => "error",
            BatchStatus::Cancel => "cancel",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(BatchStatus::Processing),
            "review" => Some(BatchStatus::Review),
            "empty" => Some(BatchStatus::Empty),
            "ready" => Some(BatchStatus::Ready),
            "sent" => Some(BatchStatus::Sent),
            "error" => Some(BatchStatus::Error),
            "cancel" => Some(BatchStatus::Cancel),
            _ => None,
        }
    }

    /// The legal state-machine edges. Every status write goes through a
    /// conditional UPDATE whose WHERE clause encodes the `from` side, so a
    /// lost race simply updates zero rows.
    pub fn can_transition(self, next: BatchStatus) -> bool {
        if next == BatchStatus::Error {
            return self != BatchStatus::Error;
        }
        matches!(
            (self, next),
            (BatchStatus::Processing, BatchStatus::Review)
                | (BatchStatus::Processing, BatchStatus::Empty)
                | (BatchStatus::Processing, BatchStatus::Ready)
                | (BatchStatus::Processing, BatchStatus::Cancel)
                | (BatchStatus::Review, BatchStatus::Processing)
                | (BatchStatus::Review, BatchStatus::Cancel)
                | (BatchStatus::Ready, BatchStatus::Sent)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Sent | BatchStatus::Error | BatchStatus::Cancel
        )
    }
}

/// Stage-specific error codes persisted on `billing_batches.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchErrorCode {
    FailedToPopulateChargeVersions = 10,
    FailedToProcessChargeVersionYears = 20,
    FailedToPrepareTransactions = 30,
    FailedToCreateCharge = 40,
    FailedToCreateBillRun = 50,
    FailedToUpdateInvoiceReferences = 60,
    FailedToGetEngineTotals = 70,
}

impl BatchErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeVersionYearStatus {
    Processing,
    Ready,
    Error,
}

impl ChargeVersionYearStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeVersionYearStatus::Processing => "processing",
            ChargeVersionYearStatus::Ready => "ready",
            ChargeVersionYearStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Candidate,
    ChargeCreated,
    Error,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Candidate => "candidate",
            TransactionStatus::ChargeCreated => "charge_created",
            TransactionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Summer,
    WinterAllYear,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Summer => "summer",
            Season::WinterAllYear => "winter_all_year",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "summer" => Some(Season::Summer),
            "winter_all_year" => Some(Season::WinterAllYear),
            _ => None,
        }
    }

    pub fn is_summer(self) -> bool {
        self == Season::Summer
    }
}

/// A financial year named by the calendar year it ends in: `FinancialYear(2026)`
/// runs 1 April 2025 – 31 March 2026.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FinancialYear(pub i32);

impl FinancialYear {
    pub fn ending(self) -> i32 {
        self.0
    }

    pub fn start(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.0 - 1, 4, 1).unwrap()
    }

    pub fn end(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.0, 3, 31).unwrap()
    }

    pub fn containing(date: NaiveDate) -> FinancialYear {
        if date.month() >= 4 {
            FinancialYear(date.year() + 1)
        } else {
            FinancialYear(date.year())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: Uuid,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub region: String,
    pub from_financial_year_ending: i32,
    pub to_financial_year_ending: i32,
    pub is_summer: bool,
    pub error_code: Option<i32>,
    pub external_bill_run_id: Option<String>,
    pub bill_run_number: Option<i64>,
    pub invoice_count: Option<i32>,
    pub credit_note_count: Option<i32>,
    pub invoice_value: Option<Decimal>,
    pub credit_note_value: Option<Decimal>,
    pub net_total: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn financial_years(&self) -> impl Iterator<Item = FinancialYear> {
        (self.from_financial_year_ending..=self.to_financial_year_ending).map(FinancialYear)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == BatchStatus::Cancel
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChargeVersionYear {
    pub id: Uuid,
    pub billing_batch_id: Uuid,
    pub charge_version_id: Uuid,
    pub financial_year_ending: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub billing_batch_id: Uuid,
    pub invoice_account_id: Uuid,
    pub invoice_account_number: String,
    pub financial_year_ending: i32,
    pub address: serde_json::Value,
    pub invoice_number: Option<String>,
    pub net_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InvoiceLicence {
    pub id: Uuid,
    pub billing_invoice_id: Uuid,
    pub licence_id: Uuid,
    pub licence_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub billing_batch_id: Uuid,
    pub billing_invoice_licence_id: Uuid,
    pub charge_element_id: Uuid,
    pub status: String,
    pub is_credit: bool,
    pub charge_period_start: NaiveDate,
    pub charge_period_end: NaiveDate,
    pub description: String,
    pub season: String,
    pub volume: Decimal,
    pub transaction_key: String,
    pub external_charge_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BillingVolume {
    pub id: Uuid,
    pub charge_element_id: Uuid,
    pub financial_year_ending: i32,
    pub is_summer: bool,
    pub calculated_volume: Option<Decimal>,
    pub two_part_tariff_status: Option<i32>,
    pub two_part_tariff_error: bool,
    pub is_approved: bool,
    pub billing_batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Charge version as loaded from the read-side reference tables.
#[derive(Debug, Clone)]
pub struct ChargeVersion {
    pub id: Uuid,
    pub licence_id: Uuid,
    pub licence_ref: String,
    pub region: String,
    pub scheme: String,
    pub invoice_account_id: Uuid,
    pub invoice_account_number: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status: String,
}

/// Day/month bounds of an in-year abstraction window; the year wraps when
/// the end falls before the start (e.g. 1 Nov – 31 Mar).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbstractionPeriod {
    pub start_day: u32,
    pub start_month: u32,
    pub end_day: u32,
    pub end_month: u32,
}

#[derive(Debug, Clone)]
pub struct ChargeElement {
    pub id: Uuid,
    pub charge_version_id: Uuid,
    pub purpose_use: String,
    pub abstraction_period: AbstractionPeriod,
    pub season: Option<Season>,
    pub loss: String,
    pub authorised_annual_quantity: Decimal,
    pub billable_annual_quantity: Option<Decimal>,
    pub is_two_part_tariff: bool,
}

impl ChargeElement {
    /// The quantity a transaction bills from when no matched volume applies.
    pub fn billable_quantity(&self) -> Decimal {
        self.billable_annual_quantity
            .unwrap_or(self.authorised_annual_quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnLine {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub quantity: Decimal,
}

/// A submitted (or still due) abstraction return for one licence.
#[derive(Debug, Clone)]
pub struct ReturnSubmission {
    pub id: Uuid,
    pub licence_ref: String,
    pub status: String,
    pub is_summer: bool,
    pub is_two_part_tariff: bool,
    pub under_query: bool,
    pub purpose_uses: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub received_date: Option<NaiveDate>,
    pub lines: Vec<ReturnLine>,
}

impl ReturnSubmission {
    pub fn is_due(&self) -> bool {
        self.status == "due"
    }

    pub fn is_void(&self) -> bool {
        self.status == "void"
    }
}

#[derive(Debug, Clone)]
pub struct InvoiceAccount {
    pub id: Uuid,
    pub account_number: String,
    pub company_name: String,
    pub address: serde_json::Value,
}

/// Deterministic composite identity for "the same billable fact" across
/// batches. `is_credit` is excluded on purpose: a credit and the charge it
/// negates must share a key so reconciliation can pair them.
pub fn transaction_key(
    licence_ref: &str,
    invoice_account_number: &str,
    charge_element_id: Uuid,
    charge_period_start: NaiveDate,
    charge_period_end: NaiveDate,
    season: &str,
    volume: Decimal,
) -> String {
    let canonical = format!(
        "{licence_ref}|{invoice_account_number}|{charge_element_id}|{charge_period_start}|{charge_period_end}|{season}|{}",
        volume.normalize()
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
