use anyhow::{anyhow, Result};
use tracing::info;
use uuid::Uuid;

use crate::billing::batches::BatchService;
use crate::job_queue::PipelineDeps;

/// Pulls the engine's aggregate totals onto the batch. The engine may still
/// be generating when asked; that surfaces as a retryable error and the job
/// comes back after the queue's backoff.
pub async fn run(deps: &PipelineDeps, batch_id: Uuid) -> Result<()> {
    let batches = BatchService::new(deps.pool.clone());

    let batch = batches.get(batch_id).await?;
    if batch.status.is_terminal() {
        info!(
            batch_id = %batch.id,
            status = batch.status.as_str(),
            "skipping totals refresh, batch is terminal"
        );
        return Ok(());
    }
    let bill_run_id = batch
        .external_bill_run_id
        .as_deref()
        .ok_or_else(|| anyhow!("batch {} has no bill run to total", batch.id))?;

    let summary = deps.engine.bill_run_summary(bill_run_id).await?;
    batches.record_totals(batch.id, &summary).await?;
    info!(
        batch_id = %batch.id,
        invoices = summary.invoice_count,
        credit_notes = summary.credit_note_count,
        net_total = %summary.net_total,
        "bill run totals recorded"
    );
    Ok(())
}
