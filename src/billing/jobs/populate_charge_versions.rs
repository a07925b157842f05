use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use crate::billing::batches::BatchService;
use crate::billing::charge_version_years::ChargeVersionYearService;
use crate::billing::models::BatchStatus;
use crate::job_queue::{BillingJob, PipelineDeps};

/// Expands the batch into per-year work units and fans out one processing
/// job per unit. A batch whose region and years hold no chargeable versions
/// settles as `empty` here.
pub async fn run(deps: &PipelineDeps, batch_id: Uuid) -> Result<()> {
    let batches = BatchService::new(deps.pool.clone());
    let years = ChargeVersionYearService::new(deps.pool.clone());

    let batch = batches.get(batch_id).await?;
    if batch.status.is_terminal() {
        info!(%batch_id, status = batch.status.as_str(), "skipping population");
        return Ok(());
    }

    let created = years.populate_for_batch(&batch).await?;
    let counts = years.status_counts(batch_id).await?;
    info!(
        %batch_id,
        created = created.len(),
        total = counts.total(),
        "charge version years populated"
    );

    if counts.total() == 0 {
        batches
            .advance(batch_id, BatchStatus::Processing, BatchStatus::Empty)
            .await?;
        return Ok(());
    }

    // Replays fan out only the units still processing; settled years keep
    // their outcome.
    for year in years.list_processing(batch_id).await? {
        deps.queue
            .enqueue(&BillingJob::ProcessChargeVersionYear {
                charge_version_year_id: year.id,
            })
            .await?;
    }
    Ok(())
}
