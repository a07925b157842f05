use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use crate::billing::batches::BatchService;
use crate::billing::models::BatchErrorCode;
use crate::charging_engine::{CreateBillRunRequest, EngineError};
use crate::job_queue::{BillingJob, PipelineDeps};

/// Opens a bill run shell on the charging engine and hands the batch to
/// population. First stage of every pipeline.
pub async fn run(deps: &PipelineDeps, batch_id: Uuid) -> Result<()> {
    let batches = BatchService::new(deps.pool.clone());
    let batch = batches.get(batch_id).await?;
    if batch.status.is_terminal() {
        info!(%batch_id, status = batch.status.as_str(), "skipping bill run creation");
        return Ok(());
    }

    // A retry after a crash may find the bill run already recorded; the
    // engine call must not repeat, only the hand-off.
    if batch.external_bill_run_id.is_none() {
        let request = CreateBillRunRequest {
            region: batch.region.clone(),
            batch_type: batch.batch_type.as_str().to_string(),
            financial_year_ending: batch.to_financial_year_ending,
            is_summer: batch.is_summer,
        };
        let handle = match deps.engine.create_bill_run(&request).await {
            Ok(handle) => handle,
            Err(err @ EngineError::Rejected { .. }) => {
                batches
                    .mark_error(batch_id, BatchErrorCode::FailedToCreateBillRun)
                    .await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        batches
            .record_bill_run(batch_id, &handle.bill_run_id, handle.bill_run_number)
            .await?;
        info!(
            %batch_id,
            bill_run_id = %handle.bill_run_id,
            bill_run_number = handle.bill_run_number,
            "bill run created"
        );
    }

    deps.queue
        .enqueue(&BillingJob::PopulateChargeVersions { batch_id })
        .await?;
    Ok(())
}
