use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::job_queue::{BillingJob, JobQueue};

use super::{
    Batch, BatchService, BatchStatus, BatchType, BillingVolume, ChargeVersionYearService, NewBatch,
    StatusCounts, VolumeService,
};

/// key: billing-api -> batch triggers and the review gate
#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub batch_type: BatchType,
    pub region: String,
    pub financial_year_ending: i32,
    #[serde(default)]
    pub is_summer: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatchListQuery {
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchDetail {
    pub batch: Batch,
    pub charge_version_years: StatusCounts,
}

/// Creates a batch and kicks the pipeline off. The batch comes back in
/// `processing` immediately; everything after that happens on the queue.
pub async fn create_batch(
    Extension(pool): Extension<PgPool>,
    Extension(queue): Extension<JobQueue>,
    Json(payload): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<Batch>), AppError> {
    let service = BatchService::new(pool);
    let batch = service
        .create(NewBatch {
            batch_type: payload.batch_type,
            region: payload.region,
            to_financial_year_ending: payload.financial_year_ending,
            is_summer: payload.is_summer,
        })
        .await?;

    queue
        .enqueue(&BillingJob::CreateBillRun { batch_id: batch.id })
        .await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

pub async fn list_batches(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<BatchListQuery>,
) -> Result<Json<Vec<Batch>>, AppError> {
    let service = BatchService::new(pool);
    let batches = service.list(query.region.as_deref()).await?;
    Ok(Json(batches))
}

/// Batch detail plus the per-year progress counts a poller needs to see
/// the fan-out advance.
pub async fn get_batch(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchDetail>, AppError> {
    let batches = BatchService::new(pool.clone());
    let years = ChargeVersionYearService::new(pool);
    let batch = batches.get(id).await?;
    let charge_version_years = years.status_counts(batch.id).await?;
    Ok(Json(BatchDetail {
        batch,
        charge_version_years,
    }))
}

/// Releases a batch parked in `review`. Refused while any of the batch's
/// volumes is still unapproved.
pub async fn approve_review(
    Extension(pool): Extension<PgPool>,
    Extension(queue): Extension<JobQueue>,
    Path(id): Path<Uuid>,
) -> Result<Json<Batch>, AppError> {
    let batches = BatchService::new(pool.clone());
    let volumes = VolumeService::new(pool);

    let batch = batches.get(id).await?;
    if batch.status != BatchStatus::Review {
        return Err(AppError::Conflict(format!(
            "batch is {}, not review",
            batch.status.as_str()
        )));
    }
    let unapproved = volumes.unapproved_for_batch(id).await?;
    if unapproved > 0 {
        return Err(AppError::Conflict(format!(
            "{unapproved} volumes still await approval"
        )));
    }

    let moved = batches
        .advance(id, BatchStatus::Review, BatchStatus::Processing)
        .await?;
    if !moved {
        return Err(AppError::Conflict("batch left review concurrently".into()));
    }
    queue
        .enqueue(&BillingJob::PrepareTransactions { batch_id: id })
        .await?;
    Ok(Json(batches.get(id).await?))
}

/// Triggers send: finalizes the bill run on the engine and stamps invoice
/// references. Only a `ready` batch can go.
pub async fn send_batch(
    Extension(pool): Extension<PgPool>,
    Extension(queue): Extension<JobQueue>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Batch>), AppError> {
    let service = BatchService::new(pool);
    let batch = service.get(id).await?;
    if batch.status != BatchStatus::Ready {
        return Err(AppError::Conflict(format!(
            "batch is {}, not ready",
            batch.status.as_str()
        )));
    }
    queue
        .enqueue(&BillingJob::UpdateInvoiceReferences { batch_id: id })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(batch)))
}

pub async fn cancel_batch(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<Json<Batch>, AppError> {
    let service = BatchService::new(pool);
    let cancelled = service.cancel(id).await?;
    if !cancelled {
        let batch = service.get(id).await?;
        return Err(AppError::Conflict(format!(
            "batch is {} and can no longer be cancelled",
            batch.status.as_str()
        )));
    }
    Ok(Json(service.get(id).await?))
}

pub async fn list_batch_volumes(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<BillingVolume>>, AppError> {
    let batches = BatchService::new(pool.clone());
    batches.get(id).await?;
    let volumes = VolumeService::new(pool);
    Ok(Json(volumes.list_for_batch(id).await?))
}

pub async fn approve_volume(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> Result<Json<BillingVolume>, AppError> {
    let volumes = VolumeService::new(pool);
    Ok(Json(volumes.approve(id).await?))
}
