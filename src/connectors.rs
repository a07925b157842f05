use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::billing::models::{FinancialYear, InvoiceAccount, ReturnLine, ReturnSubmission};
use crate::error::{AppError, AppResult};

/// key: connector-returns -> read-only abstraction returns per licence
#[async_trait]
pub trait ReturnsData: Send + Sync {
    /// All returns whose period touches the financial year, regardless of
    /// status; matching decides what each status means.
    async fn returns_for_licence(
        &self,
        licence_ref: &str,
        financial_year: FinancialYear,
    ) -> AppResult<Vec<ReturnSubmission>>;
}

/// key: connector-accounts -> invoice account reference lookups
#[async_trait]
pub trait AccountsData: Send + Sync {
    async fn invoice_account(&self, id: Uuid) -> AppResult<InvoiceAccount>;
}

/// Returns collaborator backed by the replicated `water_returns` table.
#[derive(Clone)]
pub struct PgReturnsData {
    pool: PgPool,
}

impl PgReturnsData {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReturnsData for PgReturnsData {
    async fn returns_for_licence(
        &self,
        licence_ref: &str,
        financial_year: FinancialYear,
    ) -> AppResult<Vec<ReturnSubmission>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM water_returns
            WHERE licence_ref = $1
              AND start_date <= $2
              AND end_date >= $3
            ORDER BY start_date
            "#,
        )
        .bind(licence_ref)
        .bind(financial_year.end())
        .bind(financial_year.start())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(return_from_row).collect()
    }
}

/// Account collaborator backed by the replicated `invoice_accounts` table.
#[derive(Clone)]
pub struct PgAccountsData {
    pool: PgPool,
}

impl PgAccountsData {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountsData for PgAccountsData {
    async fn invoice_account(&self, id: Uuid) -> AppResult<InvoiceAccount> {
        let row = sqlx::query("SELECT * FROM invoice_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(AppError::NotFound);
        };
        Ok(InvoiceAccount {
            id: row.get("id"),
            account_number: row.get("account_number"),
            company_name: row.get("company_name"),
            address: row.get("address"),
        })
    }
}

fn return_from_row(row: &PgRow) -> AppResult<ReturnSubmission> {
    let purpose_uses: serde_json::Value = row.get("purpose_uses");
    let purpose_uses: Vec<String> = serde_json::from_value(purpose_uses)
        .map_err(|err| AppError::Message(format!("malformed purpose_uses payload: {err}")))?;
    let lines: serde_json::Value = row.get("lines");
    let lines: Vec<ReturnLine> = serde_json::from_value(lines)
        .map_err(|err| AppError::Message(format!("malformed return lines payload: {err}")))?;

    Ok(ReturnSubmission {
        id: row.get("id"),
        licence_ref: row.get("licence_ref"),
        status: row.get("status"),
        is_summer: row.get("is_summer"),
        is_two_part_tariff: row.get("is_two_part_tariff"),
        under_query: row.get("under_query"),
        purpose_uses,
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        due_date: row.get("due_date"),
        received_date: row.get("received_date"),
        lines,
    })
}
