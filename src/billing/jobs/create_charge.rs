use anyhow::{anyhow, Result};
use tracing::info;
use uuid::Uuid;

use crate::billing::batches::BatchService;
use crate::billing::models::{Batch, BatchErrorCode, BatchStatus, Transaction, TransactionStatus};
use crate::billing::transactions::TransactionService;
use crate::charging_engine::{CreateChargeRequest, EngineError};
use crate::job_queue::{BillingJob, PipelineDeps};

/// Realizes one candidate transaction as a charge on the engine's bill run.
/// The handler that settles the batch's last candidate cleans up empty
/// invoice shells and decides between `ready` and `empty`.
pub async fn run(deps: &PipelineDeps, batch_id: Uuid, transaction_id: Uuid) -> Result<()> {
    let batches = BatchService::new(deps.pool.clone());
    let transactions = TransactionService::new(deps.pool.clone());

    let batch = batches.get(batch_id).await?;
    if batch.status != BatchStatus::Processing {
        info!(
            batch_id = %batch.id,
            status = batch.status.as_str(),
            "skipping charge creation, batch no longer processing"
        );
        return Ok(());
    }

    // A candidate can disappear when its charge version year is replayed;
    // the shrunk set of work still has to settle the batch.
    let transaction = match transactions.get(transaction_id).await {
        Ok(transaction) => Some(transaction),
        Err(crate::error::AppError::NotFound) => None,
        Err(err) => return Err(err.into()),
    };

    if let Some(transaction) = transaction {
        if transaction.status == TransactionStatus::Candidate.as_str() {
            push_charge(deps, &batches, &transactions, &batch, &transaction).await?;
        } else {
            info!(
                transaction_id = %transaction.id,
                status = %transaction.status,
                "transaction already settled"
            );
        }
    }

    settle_batch_if_done(deps, &batches, &transactions, &batch).await
}

async fn push_charge(
    deps: &PipelineDeps,
    batches: &BatchService,
    transactions: &TransactionService,
    batch: &Batch,
    transaction: &Transaction,
) -> Result<()> {
    let bill_run_id = batch
        .external_bill_run_id
        .as_deref()
        .ok_or_else(|| anyhow!("batch {} has no bill run to charge against", batch.id))?;
    let context = transactions.charging_context(transaction.id).await?;

    let request = CreateChargeRequest {
        transaction_id: transaction.id,
        licence_ref: context.licence_ref,
        invoice_account_number: context.invoice_account_number,
        financial_year_ending: context.financial_year_ending,
        charge_period_start: transaction.charge_period_start,
        charge_period_end: transaction.charge_period_end,
        is_credit: transaction.is_credit,
        season: transaction.season.clone(),
        volume: transaction.volume,
        description: transaction.description.clone(),
    };

    match deps.engine.create_charge(bill_run_id, &request).await {
        Ok(confirmation) => {
            transactions
                .record_charge(transaction.id, &confirmation.charge_id)
                .await?;
            Ok(())
        }
        Err(err @ EngineError::Rejected { .. }) => {
            transactions.mark_error(transaction.id).await?;
            batches
                .mark_error(batch.id, BatchErrorCode::FailedToCreateCharge)
                .await?;
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

async fn settle_batch_if_done(
    deps: &PipelineDeps,
    batches: &BatchService,
    transactions: &TransactionService,
    batch: &Batch,
) -> Result<()> {
    let counts = transactions.status_counts(batch.id).await?;
    if !counts.settled() || counts.error > 0 {
        return Ok(());
    }

    transactions.remove_empty_shells(batch.id).await?;

    if counts.charge_created > 0 {
        let moved = batches
            .advance(batch.id, BatchStatus::Processing, BatchStatus::Ready)
            .await?;
        if moved {
            info!(
                batch_id = %batch.id,
                charges = counts.charge_created,
                "all charges created, batch ready"
            );
            deps.queue
                .enqueue(&BillingJob::RefreshTotals { batch_id: batch.id })
                .await?;
        }
    } else {
        let moved = batches
            .advance(batch.id, BatchStatus::Processing, BatchStatus::Empty)
            .await?;
        if moved {
            info!(batch_id = %batch.id, "no charges survived, batch empty");
        }
    }
    Ok(())
}
