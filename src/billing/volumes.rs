use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::matching::MatchedVolume;

use super::models::BillingVolume;

/// key: billing-volumes -> matched volume persistence and approval
#[derive(Clone)]
pub struct VolumeService {
    pool: PgPool,
}

impl VolumeService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Volumes already matched for these elements in this financial year,
    /// whichever batch produced them. Callers compare the result against
    /// their element list to decide whether matching can be skipped.
    pub async fn find_for_elements(
        &self,
        element_ids: &[Uuid],
        financial_year_ending: i32,
    ) -> AppResult<Vec<BillingVolume>> {
        let rows = sqlx::query_as::<_, BillingVolume>(
            r#"
            SELECT * FROM billing_volumes
            WHERE charge_element_id = ANY($1) AND financial_year_ending = $2
            "#,
        )
        .bind(element_ids)
        .bind(financial_year_ending)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Writes one matched volume. A season/year/element cell holds a single
    /// row; re-matching overwrites it, and a changed volume drops any earlier
    /// approval so the reviewer sees the new number.
    pub async fn upsert(
        &self,
        batch_id: Uuid,
        matched: &MatchedVolume,
    ) -> AppResult<BillingVolume> {
        let row = sqlx::query_as::<_, BillingVolume>(
            r#"
            INSERT INTO billing_volumes (
                id,
                charge_element_id,
                financial_year_ending,
                is_summer,
                calculated_volume,
                two_part_tariff_status,
                two_part_tariff_error,
                billing_batch_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (charge_element_id, financial_year_ending, is_summer)
            DO UPDATE SET
                calculated_volume = EXCLUDED.calculated_volume,
                two_part_tariff_status = EXCLUDED.two_part_tariff_status,
                two_part_tariff_error = EXCLUDED.two_part_tariff_error,
                billing_batch_id = EXCLUDED.billing_batch_id,
                is_approved = CASE
                    WHEN billing_volumes.calculated_volume IS DISTINCT FROM EXCLUDED.calculated_volume
                        THEN FALSE
                    ELSE billing_volumes.is_approved
                END,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(matched.charge_element_id)
        .bind(matched.financial_year_ending)
        .bind(matched.is_summer)
        .bind(matched.calculated_volume)
        .bind(matched.two_part_tariff_status)
        .bind(matched.two_part_tariff_error)
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_for_batch(&self, batch_id: Uuid) -> AppResult<Vec<BillingVolume>> {
        let rows = sqlx::query_as::<_, BillingVolume>(
            r#"
            SELECT * FROM billing_volumes
            WHERE billing_batch_id = $1
            ORDER BY financial_year_ending, charge_element_id, is_summer
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Volumes the batch would consume that no reviewer has approved yet.
    /// Joined through the batch's work units rather than the producing
    /// batch id, so volumes reused from an earlier batch count too.
    pub async fn unapproved_for_batch(&self, batch_id: Uuid) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM billing_volumes bv
            JOIN charge_elements ce ON ce.id = bv.charge_element_id
            JOIN billing_charge_version_years cvy
                ON cvy.charge_version_id = ce.charge_version_id
                AND cvy.financial_year_ending = bv.financial_year_ending
            WHERE cvy.billing_batch_id = $1
              AND bv.is_approved = FALSE
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn approve(&self, id: Uuid) -> AppResult<BillingVolume> {
        sqlx::query_as::<_, BillingVolume>(
            r#"
            UPDATE billing_volumes
            SET is_approved = TRUE, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }
}
