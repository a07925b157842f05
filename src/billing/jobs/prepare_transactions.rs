use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use crate::billing::batches::BatchService;
use crate::billing::models::{BatchStatus, BatchType};
use crate::billing::supplementary::SupplementaryService;
use crate::billing::transactions::TransactionService;
use crate::job_queue::{BillingJob, PipelineDeps};

/// Fans the batch's candidate transactions out into one create-charge job
/// each. Supplementary batches reconcile against billing history first, so
/// only the delta reaches the charging engine.
pub async fn run(deps: &PipelineDeps, batch_id: Uuid) -> Result<()> {
    let batches = BatchService::new(deps.pool.clone());
    let transactions = TransactionService::new(deps.pool.clone());

    let batch = batches.get(batch_id).await?;
    if batch.status != BatchStatus::Processing {
        info!(
            batch_id = %batch.id,
            status = batch.status.as_str(),
            "skipping transaction preparation, batch no longer processing"
        );
        return Ok(());
    }

    if batch.batch_type == BatchType::Supplementary {
        let supplementary = SupplementaryService::new(deps.pool.clone());
        supplementary
            .reconcile(&batch, deps.accounts.as_ref(), &transactions)
            .await?;
    }

    let candidates = transactions.list_candidates(batch.id).await?;
    if candidates.is_empty() {
        let moved = batches
            .advance(batch.id, BatchStatus::Processing, BatchStatus::Empty)
            .await?;
        if moved {
            info!(batch_id = %batch.id, "batch produced no transactions");
            deps.queue
                .enqueue(&BillingJob::RefreshTotals { batch_id: batch.id })
                .await?;
        }
        return Ok(());
    }

    info!(
        batch_id = %batch.id,
        candidates = candidates.len(),
        "fanning out charge creation"
    );
    for transaction in &candidates {
        deps.queue
            .enqueue(&BillingJob::CreateCharge {
                batch_id: batch.id,
                transaction_id: transaction.id,
            })
            .await?;
    }
    Ok(())
}
