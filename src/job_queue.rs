use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::billing::jobs;
use crate::charging_engine::ChargingEngine;
use crate::config;
use crate::connectors::{AccountsData, ReturnsData};
use crate::error::{AppError, AppResult};

/// key: job-queue -> durable billing jobs over Postgres
///
/// Every stage of the pipeline is one of these variants; stages communicate
/// with each other only by enqueuing the next variant. The payload stored in
/// `billing_job_queue` is the serde form of the variant, so the set of jobs
/// the system can run is closed at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "kebab-case")]
pub enum BillingJob {
    CreateBillRun { batch_id: Uuid },
    PopulateChargeVersions { batch_id: Uuid },
    ProcessChargeVersionYear { charge_version_year_id: Uuid },
    PrepareTransactions { batch_id: Uuid },
    CreateCharge { batch_id: Uuid, transaction_id: Uuid },
    RefreshTotals { batch_id: Uuid },
    UpdateInvoiceReferences { batch_id: Uuid },
}

impl BillingJob {
    /// Deterministic identity of one logical unit of work. Two enqueues of
    /// the same unit collapse onto one live queue row.
    pub fn job_key(&self) -> String {
        match self {
            BillingJob::CreateBillRun { batch_id } => {
                format!("billing.create-bill-run.{batch_id}")
            }
            BillingJob::PopulateChargeVersions { batch_id } => {
                format!("billing.populate-charge-versions.{batch_id}")
            }
            BillingJob::ProcessChargeVersionYear {
                charge_version_year_id,
            } => format!("billing.process-charge-version-year.{charge_version_year_id}"),
            BillingJob::PrepareTransactions { batch_id } => {
                format!("billing.prepare-transactions.{batch_id}")
            }
            BillingJob::CreateCharge { transaction_id, .. } => {
                format!("billing.create-charge.{transaction_id}")
            }
            BillingJob::RefreshTotals { batch_id } => {
                format!("billing.refresh-totals.{batch_id}")
            }
            BillingJob::UpdateInvoiceReferences { batch_id } => {
                format!("billing.update-invoice-references.{batch_id}")
            }
        }
    }
}

/// A job a worker has taken ownership of.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub attempts: i32,
    pub max_attempts: i32,
    pub job: BillingJob,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Handle to the durable queue. Constructed once and handed to whoever needs
/// to enqueue; nothing reaches the queue table except through this.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Queues a job unless an identical live job already exists. Returns
    /// whether a new row was created; a deduplicated enqueue is success.
    pub async fn enqueue(&self, job: &BillingJob) -> AppResult<bool> {
        let payload = serde_json::to_value(job)
            .map_err(|err| AppError::Message(format!("unserializable job payload: {err}")))?;
        let result = sqlx::query(
            r#"
            INSERT INTO billing_job_queue (job_key, payload, max_attempts)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_key) WHERE status IN ('queued', 'active') DO NOTHING
            "#,
        )
        .bind(job.job_key())
        .bind(payload)
        .bind(*config::BILLING_JOB_MAX_ATTEMPTS)
        .execute(&self.pool)
        .await?;

        let queued = result.rows_affected() > 0;
        debug!(job = %job.job_key(), queued, "enqueue");
        Ok(queued)
    }

    /// Claims the next due job, if any. `FOR UPDATE SKIP LOCKED` lets
    /// concurrent workers claim without serializing on each other.
    pub async fn claim(&self) -> AppResult<Option<ClaimedJob>> {
        let row = sqlx::query(
            r#"
            UPDATE billing_job_queue
            SET status = 'active', attempts = attempts + 1, started_at = NOW()
            WHERE id = (
                SELECT id FROM billing_job_queue
                WHERE status = 'queued' AND scheduled_at <= NOW()
                ORDER BY scheduled_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, attempts, max_attempts, payload
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let payload: Value = row.get("payload");
        let job = match serde_json::from_value::<BillingJob>(payload) {
            Ok(job) => job,
            Err(err) => {
                // A payload this binary cannot read will never succeed here.
                warn!(%id, ?err, "dropping unreadable job payload");
                self.mark_failed(id, &format!("unreadable payload: {err}"))
                    .await?;
                return Ok(None);
            }
        };
        Ok(Some(ClaimedJob {
            id,
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            job,
        }))
    }

    pub async fn complete(&self, id: i64) -> AppResult<()> {
        sqlx::query(
            "UPDATE billing_job_queue SET status = 'completed', finished_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a failed attempt. The job goes back to `queued` with a linear
    /// backoff until its attempts are spent, then stays `failed` for good.
    /// Returns whether another attempt will run.
    pub async fn fail(&self, claimed: &ClaimedJob, error_text: &str) -> AppResult<bool> {
        if claimed.attempts >= claimed.max_attempts {
            self.mark_failed(claimed.id, error_text).await?;
            return Ok(false);
        }
        let backoff_secs =
            (claimed.attempts as i64 * *config::BILLING_JOB_RETRY_BACKOFF_SECS) as f64;
        sqlx::query(
            r#"
            UPDATE billing_job_queue
            SET status = 'queued',
                last_error = $2,
                scheduled_at = NOW() + make_interval(secs => $3)
            WHERE id = $1
            "#,
        )
        .bind(claimed.id)
        .bind(error_text)
        .bind(backoff_secs)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn mark_failed(&self, id: i64, error_text: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_job_queue
            SET status = 'failed', last_error = $2, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn counts(&self) -> AppResult<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM billing_job_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match status.as_str() {
                "queued" => counts.queued = count,
                "active" => counts.active = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                other => {
                    return Err(AppError::Message(format!("unknown job status {other}")))
                }
            }
        }
        Ok(counts)
    }
}

/// Everything a job handler may touch. Handed to workers at startup; nothing
/// in the pipeline reaches for process-wide state.
#[derive(Clone)]
pub struct PipelineDeps {
    pub pool: PgPool,
    pub queue: JobQueue,
    pub engine: Arc<dyn ChargingEngine>,
    pub returns: Arc<dyn ReturnsData>,
    pub accounts: Arc<dyn AccountsData>,
}

/// Routes one claimed job to its handler. The match is total over
/// [`BillingJob`], so adding a variant without a handler does not compile.
pub async fn dispatch(deps: &PipelineDeps, job: &BillingJob) -> anyhow::Result<()> {
    match job {
        BillingJob::CreateBillRun { batch_id } => {
            jobs::create_bill_run::run(deps, *batch_id).await
        }
        BillingJob::PopulateChargeVersions { batch_id } => {
            jobs::populate_charge_versions::run(deps, *batch_id).await
        }
        BillingJob::ProcessChargeVersionYear {
            charge_version_year_id,
        } => jobs::process_charge_version_year::run(deps, *charge_version_year_id).await,
        BillingJob::PrepareTransactions { batch_id } => {
            jobs::prepare_transactions::run(deps, *batch_id).await
        }
        BillingJob::CreateCharge {
            batch_id,
            transaction_id,
        } => jobs::create_charge::run(deps, *batch_id, *transaction_id).await,
        BillingJob::RefreshTotals { batch_id } => {
            jobs::refresh_totals::run(deps, *batch_id).await
        }
        BillingJob::UpdateInvoiceReferences { batch_id } => {
            jobs::update_invoice_references::run(deps, *batch_id).await
        }
    }
}

/// Claims and runs one job. Returns whether a job was found.
pub async fn work_one(deps: &PipelineDeps) -> AppResult<bool> {
    let Some(claimed) = deps.queue.claim().await? else {
        return Ok(false);
    };
    let key = claimed.job.job_key();
    match dispatch(deps, &claimed.job).await {
        Ok(()) => {
            deps.queue.complete(claimed.id).await?;
            debug!(job = %key, "job completed");
        }
        Err(err) => {
            let retrying = deps.queue.fail(&claimed, &format!("{err:#}")).await?;
            warn!(
                ?err,
                job = %key,
                attempt = claimed.attempts,
                retrying,
                "pipeline job failed"
            );
            if !retrying {
                if let Err(cb_err) = on_final_failure(deps, &claimed.job).await {
                    error!(?cb_err, job = %key, "failure callback did not complete");
                }
            }
        }
    }
    Ok(true)
}

/// Runs once when a job has spent its attempts: records the stage's error
/// code on the batch (and the affected sub-entity) so the persisted status
/// says what went wrong. Handlers that fail on a known-unrecoverable error
/// write the same code up front; this write is conditional either way, so
/// the first recorded code sticks.
async fn on_final_failure(deps: &PipelineDeps, job: &BillingJob) -> AppResult<()> {
    use crate::billing::batches::BatchService;
    use crate::billing::charge_version_years::ChargeVersionYearService;
    use crate::billing::models::{BatchErrorCode, ChargeVersionYearStatus};
    use crate::billing::transactions::TransactionService;

    let batches = BatchService::new(deps.pool.clone());
    match job {
        BillingJob::CreateBillRun { batch_id } => {
            batches
                .mark_error(*batch_id, BatchErrorCode::FailedToCreateBillRun)
                .await
        }
        BillingJob::PopulateChargeVersions { batch_id } => {
            batches
                .mark_error(*batch_id, BatchErrorCode::FailedToPopulateChargeVersions)
                .await
        }
        BillingJob::ProcessChargeVersionYear {
            charge_version_year_id,
        } => {
            let years = ChargeVersionYearService::new(deps.pool.clone());
            match years.get(*charge_version_year_id).await {
                Ok(year) => {
                    years
                        .set_status(year.id, ChargeVersionYearStatus::Error)
                        .await?;
                    batches
                        .mark_error(
                            year.billing_batch_id,
                            BatchErrorCode::FailedToProcessChargeVersionYears,
                        )
                        .await
                }
                Err(AppError::NotFound) => Ok(()),
                Err(err) => Err(err),
            }
        }
        BillingJob::PrepareTransactions { batch_id } => {
            batches
                .mark_error(*batch_id, BatchErrorCode::FailedToPrepareTransactions)
                .await
        }
        BillingJob::CreateCharge {
            batch_id,
            transaction_id,
        } => {
            let transactions = TransactionService::new(deps.pool.clone());
            transactions.mark_error(*transaction_id).await?;
            batches
                .mark_error(*batch_id, BatchErrorCode::FailedToCreateCharge)
                .await
        }
        BillingJob::RefreshTotals { batch_id } => {
            batches
                .mark_error(*batch_id, BatchErrorCode::FailedToGetEngineTotals)
                .await
        }
        BillingJob::UpdateInvoiceReferences { batch_id } => {
            batches
                .mark_error(*batch_id, BatchErrorCode::FailedToUpdateInvoiceReferences)
                .await
        }
    }
}

/// Runs jobs until the queue has nothing due. Tests and maintenance tooling
/// drive the pipeline deterministically through this.
pub async fn drain(deps: &PipelineDeps) -> AppResult<usize> {
    let mut processed = 0;
    while work_one(deps).await? {
        processed += 1;
    }
    Ok(processed)
}

/// Spawns the worker pool. Workers poll for due jobs and sleep briefly when
/// the queue is idle; they run until the process exits.
pub fn spawn_workers(deps: PipelineDeps) {
    for worker in 0..*config::BILLING_WORKER_CONCURRENCY {
        let deps = deps.clone();
        tokio::spawn(async move {
            let idle = Duration::from_millis(*config::BILLING_JOB_POLL_INTERVAL_MS);
            loop {
                match work_one(&deps).await {
                    Ok(true) => {}
                    Ok(false) => sleep(idle).await,
                    Err(err) => {
                        error!(?err, %worker, "job queue poll failed");
                        sleep(idle).await;
                    }
                }
            }
        });
    }
}
