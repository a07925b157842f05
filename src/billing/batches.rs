use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::charging_engine::BillRunSummary;
use crate::config;
use crate::error::{AppError, AppResult};

use super::models::{Batch, BatchErrorCode, BatchStatus, BatchType};

/// key: billing-batches -> batch lifecycle and status machine
#[derive(Clone)]
pub struct BatchService {
    pool: PgPool,
}

#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_type: BatchType,
    pub region: String,
    pub to_financial_year_ending: i32,
    pub is_summer: bool,
}

impl BatchService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a batch in `processing`. A region may only hold one batch that
    /// has not yet reached a resting status; the partial unique index on
    /// `billing_batches` backstops the pre-check under concurrency.
    pub async fn create(&self, new: NewBatch) -> AppResult<Batch> {
        let live: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM billing_batches
            WHERE region = $1 AND status IN ('processing', 'review', 'ready')
            LIMIT 1
            "#,
        )
        .bind(&new.region)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(existing) = live {
            return Err(AppError::Conflict(format!(
                "region {} already has a live batch {existing}",
                new.region
            )));
        }

        let from_year = match new.batch_type {
            BatchType::Supplementary => {
                new.to_financial_year_ending - (*config::BILLING_SUPPLEMENTARY_YEARS - 1)
            }
            BatchType::Annual | BatchType::TwoPartTariff => new.to_financial_year_ending,
        };

        let row = sqlx::query(
            r#"
            INSERT INTO billing_batches (
                id,
                batch_type,
                status,
                region,
                from_financial_year_ending,
                to_financial_year_ending,
                is_summer
            ) VALUES ($1, $2, 'processing', $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.batch_type.as_str())
        .bind(&new.region)
        .bind(from_year)
        .bind(new.to_financial_year_ending)
        .bind(new.is_summer)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if unique_violation(&err) {
                AppError::Conflict(format!("region {} already has a live batch", new.region))
            } else {
                AppError::Db(err)
            }
        })?;

        batch_from_row(&row)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Batch> {
        let row = sqlx::query("SELECT * FROM billing_batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(AppError::NotFound);
        };
        batch_from_row(&row)
    }

    pub async fn list(&self, region: Option<&str>) -> AppResult<Vec<Batch>> {
        let rows = match region {
            Some(region) => {
                sqlx::query(
                    "SELECT * FROM billing_batches WHERE region = $1 ORDER BY created_at DESC",
                )
                .bind(region)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM billing_batches ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(batch_from_row).collect()
    }

    /// Moves a batch along one edge of the status machine. Returns false when
    /// the batch was no longer in `from`; callers treat that as a lost race
    /// (e.g. the batch was cancelled while the stage ran) and stop quietly.
    pub async fn advance(&self, id: Uuid, from: BatchStatus, to: BatchStatus) -> AppResult<bool> {
        if !from.can_transition(to) {
            return Err(AppError::Message(format!(
                "illegal batch transition {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let result = sqlx::query(
            "UPDATE billing_batches SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fails the batch, recording which stage gave up. The first error wins;
    /// a batch already in error keeps its original code.
    pub async fn mark_error(&self, id: Uuid, code: BatchErrorCode) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_batches
            SET status = 'error', error_code = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'error'
            "#,
        )
        .bind(id)
        .bind(code.code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cancel(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_batches
            SET status = 'cancel', updated_at = NOW()
            WHERE id = $1 AND status IN ('processing', 'review')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_bill_run(
        &self,
        id: Uuid,
        external_bill_run_id: &str,
        bill_run_number: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_batches
            SET external_bill_run_id = $2, bill_run_number = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(external_bill_run_id)
        .bind(bill_run_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_totals(&self, id: Uuid, summary: &BillRunSummary) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_batches
            SET invoice_count = $2,
                credit_note_count = $3,
                invoice_value = $4,
                credit_note_value = $5,
                net_total = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(summary.invoice_count)
        .bind(summary.credit_note_count)
        .bind(summary.invoice_value)
        .bind(summary.credit_note_value)
        .bind(summary.net_total)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub(crate) fn batch_from_row(row: &PgRow) -> AppResult<Batch> {
    let batch_type: String = row.get("batch_type");
    let status: String = row.get("status");
    let batch_type = BatchType::from_db(&batch_type)
        .ok_or_else(|| AppError::Message(format!("unknown batch type {batch_type}")))?;
    let status = BatchStatus::from_db(&status)
        .ok_or_else(|| AppError::Message(format!("unknown batch status {status}")))?;

    Ok(Batch {
        id: row.get("id"),
        batch_type,
        status,
        region: row.get("region"),
        from_financial_year_ending: row.get("from_financial_year_ending"),
        to_financial_year_ending: row.get("to_financial_year_ending"),
        is_summer: row.get("is_summer"),
        error_code: row.get("error_code"),
        external_bill_run_id: row.get("external_bill_run_id"),
        bill_run_number: row.get("bill_run_number"),
        invoice_count: row.get("invoice_count"),
        credit_note_count: row.get("credit_note_count"),
        invoice_value: row.get("invoice_value"),
        credit_note_value: row.get("credit_note_value"),
        net_total: row.get("net_total"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
