use anyhow::{anyhow, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::billing::batches::BatchService;
use crate::billing::models::{BatchErrorCode, BatchStatus};
use crate::billing::transactions::TransactionService;
use crate::charging_engine::{EngineError, InvoiceReference};
use crate::job_queue::PipelineDeps;

/// Finalizes the bill run on the engine and copies the invoice references it
/// assigned back onto this batch's invoices. Only a `ready` batch can be
/// sent; anything else is a stale trigger.
pub async fn run(deps: &PipelineDeps, batch_id: Uuid) -> Result<()> {
    let batches = BatchService::new(deps.pool.clone());
    let transactions = TransactionService::new(deps.pool.clone());

    let batch = batches.get(batch_id).await?;
    if batch.status != BatchStatus::Ready {
        info!(
            batch_id = %batch.id,
            status = batch.status.as_str(),
            "skipping send, batch is not ready"
        );
        return Ok(());
    }
    let bill_run_id = batch
        .external_bill_run_id
        .as_deref()
        .ok_or_else(|| anyhow!("batch {} has no bill run to send", batch.id))?;

    let references = match send_and_fetch(deps, bill_run_id).await {
        Ok(references) => references,
        Err(err @ EngineError::Rejected { .. }) => {
            batches
                .mark_error(batch.id, BatchErrorCode::FailedToUpdateInvoiceReferences)
                .await?;
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    for reference in &references {
        let matched = transactions
            .set_invoice_number(
                batch.id,
                &reference.invoice_account_number,
                reference.financial_year_ending,
                &reference.invoice_number,
            )
            .await?;
        if !matched {
            warn!(
                batch_id = %batch.id,
                account = %reference.invoice_account_number,
                year = reference.financial_year_ending,
                "invoice reference has no matching invoice"
            );
        }
    }

    batches
        .advance(batch.id, BatchStatus::Ready, BatchStatus::Sent)
        .await?;
    info!(
        batch_id = %batch.id,
        references = references.len(),
        "bill run sent"
    );
    Ok(())
}

async fn send_and_fetch(
    deps: &PipelineDeps,
    bill_run_id: &str,
) -> Result<Vec<InvoiceReference>, EngineError> {
    deps.engine.send_bill_run(bill_run_id).await?;
    deps.engine.invoice_references(bill_run_id).await
}
