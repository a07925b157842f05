use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::{AbstractionPeriod, ChargeElement, ChargeVersion, Season};

/// key: billing-charge-data -> loaders over the charge reference tables
#[derive(Clone)]
pub struct ChargeDataService {
    pool: PgPool,
}

impl ChargeDataService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn charge_version(&self, id: Uuid) -> AppResult<ChargeVersion> {
        let row = sqlx::query("SELECT * FROM charge_versions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(AppError::NotFound);
        };
        Ok(charge_version_from_row(&row))
    }

    pub async fn elements_for_version(
        &self,
        charge_version_id: Uuid,
    ) -> AppResult<Vec<ChargeElement>> {
        let rows = sqlx::query(
            "SELECT * FROM charge_elements WHERE charge_version_id = $1 ORDER BY created_at",
        )
        .bind(charge_version_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(element_from_row).collect()
    }
}

fn charge_version_from_row(row: &PgRow) -> ChargeVersion {
    ChargeVersion {
        id: row.get("id"),
        licence_id: row.get("licence_id"),
        licence_ref: row.get("licence_ref"),
        region: row.get("region"),
        scheme: row.get("scheme"),
        invoice_account_id: row.get("invoice_account_id"),
        invoice_account_number: row.get("invoice_account_number"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        status: row.get("status"),
    }
}

fn element_from_row(row: &PgRow) -> AppResult<ChargeElement> {
    let season: Option<String> = row.get("season");
    let season = season
        .map(|value| {
            Season::from_db(&value)
                .ok_or_else(|| AppError::Message(format!("unknown element season {value}")))
        })
        .transpose()?;

    let start_day: i32 = row.get("abstraction_period_start_day");
    let start_month: i32 = row.get("abstraction_period_start_month");
    let end_day: i32 = row.get("abstraction_period_end_day");
    let end_month: i32 = row.get("abstraction_period_end_month");

    Ok(ChargeElement {
        id: row.get("id"),
        charge_version_id: row.get("charge_version_id"),
        purpose_use: row.get("purpose_use"),
        abstraction_period: AbstractionPeriod {
            start_day: start_day as u32,
            start_month: start_month as u32,
            end_day: end_day as u32,
            end_month: end_month as u32,
        },
        season,
        loss: row.get("loss"),
        authorised_annual_quantity: row.get("authorised_annual_quantity"),
        billable_annual_quantity: row.get("billable_annual_quantity"),
        is_two_part_tariff: row.get("is_two_part_tariff"),
    })
}
