use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::{Batch, BatchType, ChargeVersionYear, ChargeVersionYearStatus};

// One statement per batch type: the scope filter is the only difference.
// Re-running population is harmless, the unique key swallows duplicates.
const ANNUAL_SCOPE_SQL: &str = r#"
    INSERT INTO billing_charge_version_years
        (id, billing_batch_id, charge_version_id, financial_year_ending, status)
    SELECT gen_random_uuid(), $1, cv.id, $2, 'processing'
    FROM charge_versions cv
    WHERE cv.region = $3
      AND cv.status = 'current'
      AND cv.start_date <= $4
      AND (cv.end_date IS NULL OR cv.end_date >= $5)
    ON CONFLICT (billing_batch_id, charge_version_id, financial_year_ending) DO NOTHING
    RETURNING *
"#;

const SUPPLEMENTARY_SCOPE_SQL: &str = r#"
    INSERT INTO billing_charge_version_years
        (id, billing_batch_id, charge_version_id, financial_year_ending, status)
    SELECT gen_random_uuid(), $1, cv.id, $2, 'processing'
    FROM charge_versions cv
    JOIN licences l ON l.id = cv.licence_id
    WHERE cv.region = $3
      AND cv.status = 'current'
      AND cv.start_date <= $4
      AND (cv.end_date IS NULL OR cv.end_date >= $5)
      AND l.include_in_supplementary_billing = TRUE
    ON CONFLICT (billing_batch_id, charge_version_id, financial_year_ending) DO NOTHING
    RETURNING *
"#;

const TWO_PART_TARIFF_SCOPE_SQL: &str = r#"
    INSERT INTO billing_charge_version_years
        (id, billing_batch_id, charge_version_id, financial_year_ending, status)
    SELECT gen_random_uuid(), $1, cv.id, $2, 'processing'
    FROM charge_versions cv
    WHERE cv.region = $3
      AND cv.status = 'current'
      AND cv.start_date <= $4
      AND (cv.end_date IS NULL OR cv.end_date >= $5)
      AND EXISTS (
          SELECT 1 FROM charge_elements ce
          WHERE ce.charge_version_id = cv.id AND ce.is_two_part_tariff = TRUE
      )
    ON CONFLICT (billing_batch_id, charge_version_id, financial_year_ending) DO NOTHING
    RETURNING *
"#;

/// key: billing-charge-version-years -> per-year work units and fan-in counts
#[derive(Clone)]
pub struct ChargeVersionYearService {
    pool: PgPool,
}

/// Snapshot of how far a batch's work units have got, taken with one
/// aggregate query. Stage fan-in decisions are made from this snapshot
/// only, never from worker-local state.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StatusCounts {
    pub processing: i64,
    pub ready: i64,
    pub error: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.processing + self.ready + self.error
    }

    pub fn settled(&self) -> bool {
        self.processing == 0
    }
}

impl ChargeVersionYearService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates one work unit per in-scope charge version per financial year
    /// of the batch. Which charge versions are in scope depends on the batch
    /// type; supplementary batches only look at licences flagged for
    /// supplementary billing.
    pub async fn populate_for_batch(&self, batch: &Batch) -> AppResult<Vec<ChargeVersionYear>> {
        let sql = match batch.batch_type {
            BatchType::Annual => ANNUAL_SCOPE_SQL,
            BatchType::Supplementary => SUPPLEMENTARY_SCOPE_SQL,
            BatchType::TwoPartTariff => TWO_PART_TARIFF_SCOPE_SQL,
        };

        let mut created = Vec::new();
        for year in batch.financial_years() {
            let rows = sqlx::query_as::<_, ChargeVersionYear>(sql)
                .bind(batch.id)
                .bind(year.ending())
                .bind(&batch.region)
                .bind(year.end())
                .bind(year.start())
                .fetch_all(&self.pool)
                .await?;
            created.extend(rows);
        }
        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<ChargeVersionYear> {
        sqlx::query_as::<_, ChargeVersionYear>(
            "SELECT * FROM billing_charge_version_years WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }

    /// Work units still to run, used when (re-)fanning out per-year jobs.
    /// Settled units are skipped so a replayed population does not re-process
    /// years that already finished.
    pub async fn list_processing(&self, batch_id: Uuid) -> AppResult<Vec<ChargeVersionYear>> {
        let rows = sqlx::query_as::<_, ChargeVersionYear>(
            r#"
            SELECT * FROM billing_charge_version_years
            WHERE billing_batch_id = $1 AND status = 'processing'
            ORDER BY financial_year_ending, charge_version_id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_status(&self, id: Uuid, status: ChargeVersionYearStatus) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_charge_version_years
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn status_counts(&self, batch_id: Uuid) -> AppResult<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM billing_charge_version_years
            WHERE billing_batch_id = $1
            GROUP BY status
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match status.as_str() {
                "processing" => counts.processing = count,
                "ready" => counts.ready = count,
                "error" => counts.error = count,
                other => {
                    return Err(AppError::Message(format!(
                        "unknown charge version year status {other}"
                    )))
                }
            }
        }
        Ok(counts)
    }
}
