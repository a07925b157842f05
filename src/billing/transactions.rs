use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::{Invoice, InvoiceAccount, InvoiceLicence, Season, Transaction};

/// key: billing-transactions -> invoice hierarchy and candidate transactions
#[derive(Clone)]
pub struct TransactionService {
    pool: PgPool,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub billing_batch_id: Uuid,
    pub billing_invoice_licence_id: Uuid,
    pub charge_element_id: Uuid,
    pub is_credit: bool,
    pub charge_period_start: NaiveDate,
    pub charge_period_end: NaiveDate,
    pub description: String,
    pub season: Season,
    pub volume: Decimal,
    pub transaction_key: String,
}

#[derive(Debug, Clone)]
pub struct ChargingContext {
    pub licence_ref: String,
    pub invoice_account_number: String,
    pub financial_year_ending: i32,
}

/// Aggregate view of a batch's transactions, used to decide when the last
/// charge has been pushed to the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionCounts {
    pub candidate: i64,
    pub charge_created: i64,
    pub error: i64,
}

impl TransactionCounts {
    pub fn total(&self) -> i64 {
        self.candidate + self.charge_created + self.error
    }

    pub fn settled(&self) -> bool {
        self.candidate == 0
    }
}

impl TransactionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One invoice per account per financial year of the batch. Re-preparing
    /// an invoice refreshes the billing address snapshot.
    pub async fn upsert_invoice(
        &self,
        batch_id: Uuid,
        account: &InvoiceAccount,
        financial_year_ending: i32,
    ) -> AppResult<Invoice> {
        let row = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO billing_invoices (
                id,
                billing_batch_id,
                invoice_account_id,
                invoice_account_number,
                financial_year_ending,
                address
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (billing_batch_id, invoice_account_id, financial_year_ending)
            DO UPDATE SET address = EXCLUDED.address
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(batch_id)
        .bind(account.id)
        .bind(&account.account_number)
        .bind(financial_year_ending)
        .bind(&account.address)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_invoice_licence(
        &self,
        invoice_id: Uuid,
        licence_id: Uuid,
        licence_ref: &str,
    ) -> AppResult<InvoiceLicence> {
        let row = sqlx::query_as::<_, InvoiceLicence>(
            r#"
            INSERT INTO billing_invoice_licences (id, billing_invoice_id, licence_id, licence_ref)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (billing_invoice_id, licence_id)
            DO UPDATE SET licence_ref = EXCLUDED.licence_ref
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice_id)
        .bind(licence_id)
        .bind(licence_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert(&self, new: NewTransaction) -> AppResult<Transaction> {
        let row = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO billing_transactions (
                id,
                billing_batch_id,
                billing_invoice_licence_id,
                charge_element_id,
                status,
                is_credit,
                charge_period_start,
                charge_period_end,
                description,
                season,
                volume,
                transaction_key
            ) VALUES ($1, $2, $3, $4, 'candidate', $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.billing_batch_id)
        .bind(new.billing_invoice_licence_id)
        .bind(new.charge_element_id)
        .bind(new.is_credit)
        .bind(new.charge_period_start)
        .bind(new.charge_period_end)
        .bind(&new.description)
        .bind(new.season.as_str())
        .bind(new.volume)
        .bind(&new.transaction_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Transaction> {
        sqlx::query_as::<_, Transaction>("SELECT * FROM billing_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// The licence and invoice context a transaction is charged under,
    /// resolved through its invoice-licence parent.
    pub async fn charging_context(&self, transaction_id: Uuid) -> AppResult<ChargingContext> {
        let row = sqlx::query(
            r#"
            SELECT il.licence_ref, i.invoice_account_number, i.financial_year_ending
            FROM billing_transactions t
            JOIN billing_invoice_licences il ON il.id = t.billing_invoice_licence_id
            JOIN billing_invoices i ON i.id = il.billing_invoice_id
            WHERE t.id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(AppError::NotFound);
        };
        Ok(ChargingContext {
            licence_ref: row.get("licence_ref"),
            invoice_account_number: row.get("invoice_account_number"),
            financial_year_ending: row.get("financial_year_ending"),
        })
    }

    /// Clears this batch's candidates for a set of elements within one
    /// charge period window. Re-processing a charge version year starts from
    /// a clean slate instead of doubling its candidates.
    pub async fn delete_candidates_for_scope(
        &self,
        batch_id: Uuid,
        element_ids: &[Uuid],
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM billing_transactions
            WHERE billing_batch_id = $1
              AND status = 'candidate'
              AND charge_element_id = ANY($2)
              AND charge_period_start >= $3
              AND charge_period_end <= $4
            "#,
        )
        .bind(batch_id)
        .bind(element_ids)
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_for_batch(&self, batch_id: Uuid) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM billing_transactions
            WHERE billing_batch_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_candidates(&self, batch_id: Uuid) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM billing_transactions
            WHERE billing_batch_id = $1 AND status = 'candidate'
            ORDER BY created_at
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Marks the transaction charged, keeping the engine's charge id. Only a
    /// candidate can move; a transaction already settled stays as it is.
    pub async fn record_charge(&self, id: Uuid, external_charge_id: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_transactions
            SET status = 'charge_created', external_charge_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'candidate'
            "#,
        )
        .bind(id)
        .bind(external_charge_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_error(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_transactions
            SET status = 'error', updated_at = NOW()
            WHERE id = $1 AND status = 'candidate'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM billing_transactions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn status_counts(&self, batch_id: Uuid) -> AppResult<TransactionCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM billing_transactions
            WHERE billing_batch_id = $1
            GROUP BY status
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = TransactionCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match status.as_str() {
                "candidate" => counts.candidate = count,
                "charge_created" => counts.charge_created = count,
                "error" => counts.error = count,
                other => {
                    return Err(AppError::Message(format!(
                        "unknown transaction status {other}"
                    )))
                }
            }
        }
        Ok(counts)
    }

    pub async fn list_invoices(&self, batch_id: Uuid) -> AppResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM billing_invoices
            WHERE billing_batch_id = $1
            ORDER BY invoice_account_number, financial_year_ending
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Writes the engine's invoice reference onto the matching invoice row.
    /// Returns whether anything matched; an unknown reference is the
    /// caller's problem to report.
    pub async fn set_invoice_number(
        &self,
        batch_id: Uuid,
        invoice_account_number: &str,
        financial_year_ending: i32,
        number: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_invoices
            SET invoice_number = $4
            WHERE billing_batch_id = $1
              AND invoice_account_number = $2
              AND financial_year_ending = $3
            "#,
        )
        .bind(batch_id)
        .bind(invoice_account_number)
        .bind(financial_year_ending)
        .bind(number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops invoice licences left without transactions and invoices left
    /// without licences. Supplementary reconciliation can hollow out parts
    /// of the hierarchy; the empty shells must not reach the bill run.
    pub async fn remove_empty_shells(&self, batch_id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM billing_invoice_licences il
            USING billing_invoices i
            WHERE i.id = il.billing_invoice_id
              AND i.billing_batch_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM billing_transactions t
                  WHERE t.billing_invoice_licence_id = il.id
              )
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM billing_invoices i
            WHERE i.billing_batch_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM billing_invoice_licences il
                  WHERE il.billing_invoice_id = i.id
              )
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
