use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use crate::billing::batches::BatchService;
use crate::billing::charge_data::ChargeDataService;
use crate::billing::charge_version_years::ChargeVersionYearService;
use crate::billing::models::{
    transaction_key, Batch, BatchStatus, BatchType, BillingVolume, ChargeElement,
    ChargeVersion, ChargeVersionYear, ChargeVersionYearStatus, FinancialYear, Season,
};
use crate::billing::transactions::{NewTransaction, TransactionService};
use crate::billing::volumes::VolumeService;
use crate::job_queue::{BillingJob, PipelineDeps};
use crate::matching::{element_season, match_charge_version, ChargePeriod, ProRataAllocation};

/// Bills one (charge version, financial year) pair: two-part-tariff batches
/// run volume matching first, then everything lands as `candidate`
/// transactions under the batch's invoice hierarchy. The handler that
/// settles the batch's last work unit decides what happens next.
pub async fn run(deps: &PipelineDeps, charge_version_year_id: Uuid) -> Result<()> {
    let batches = BatchService::new(deps.pool.clone());
    let years = ChargeVersionYearService::new(deps.pool.clone());

    let year = years.get(charge_version_year_id).await?;
    let batch = batches.get(year.billing_batch_id).await?;
    if batch.status != BatchStatus::Processing {
        info!(
            batch_id = %batch.id,
            status = batch.status.as_str(),
            "skipping charge version year, batch no longer processing"
        );
        return Ok(());
    }

    if let Err(err) = process_year(deps, &batch, &year).await {
        years
            .set_status(year.id, ChargeVersionYearStatus::Error)
            .await?;
        return Err(err);
    }
    years
        .set_status(year.id, ChargeVersionYearStatus::Ready)
        .await?;

    settle_batch_if_done(deps, &batches, &years, &batch).await
}

async fn process_year(deps: &PipelineDeps, batch: &Batch, year: &ChargeVersionYear) -> Result<()> {
    let charge_data = ChargeDataService::new(deps.pool.clone());
    let transactions = TransactionService::new(deps.pool.clone());

    let version = charge_data.charge_version(year.charge_version_id).await?;
    let elements = charge_data.elements_for_version(version.id).await?;
    let financial_year = FinancialYear(year.financial_year_ending);

    let Some(period) =
        ChargePeriod::for_financial_year(financial_year, version.start_date, version.end_date)
    else {
        // The charge version was not in force during this year at all.
        return Ok(());
    };

    match batch.batch_type {
        BatchType::TwoPartTariff => {
            bill_matched_volumes(
                deps,
                batch,
                &version,
                elements,
                financial_year,
                period,
                &transactions,
            )
            .await
        }
        BatchType::Annual | BatchType::Supplementary => {
            bill_billable_quantities(deps, batch, &version, &elements, period, &transactions).await
        }
    }
}

/// Annual and supplementary billing charge each element at its billable
/// quantity for the charge period.
async fn bill_billable_quantities(
    deps: &PipelineDeps,
    batch: &Batch,
    version: &ChargeVersion,
    elements: &[ChargeElement],
    period: ChargePeriod,
    transactions: &TransactionService,
) -> Result<()> {
    if elements.is_empty() {
        return Ok(());
    }
    let element_ids: Vec<Uuid> = elements.iter().map(|el| el.id).collect();
    transactions
        .delete_candidates_for_scope(batch.id, &element_ids, period.start_date, period.end_date)
        .await?;

    let invoice_licence_id = upsert_invoice_context(deps, batch, version, period).await?;
    for element in elements {
        let season = element_season(element);
        let volume = element.billable_quantity();
        transactions
            .insert(NewTransaction {
                billing_batch_id: batch.id,
                billing_invoice_licence_id: invoice_licence_id,
                charge_element_id: element.id,
                is_credit: false,
                charge_period_start: period.start_date,
                charge_period_end: period.end_date,
                description: format!("Water abstraction charge, {}", element.purpose_use),
                season,
                volume,
                transaction_key: transaction_key(
                    &version.licence_ref,
                    &version.invoice_account_number,
                    element.id,
                    period.start_date,
                    period.end_date,
                    season.as_str(),
                    volume,
                ),
            })
            .await?;
    }
    Ok(())
}

/// Two-part-tariff billing charges the matched abstraction volumes. Matching
/// is skipped when every eligible element already has a volume row for this
/// year, whichever batch computed it.
async fn bill_matched_volumes(
    deps: &PipelineDeps,
    batch: &Batch,
    version: &ChargeVersion,
    elements: Vec<ChargeElement>,
    financial_year: FinancialYear,
    period: ChargePeriod,
    transactions: &TransactionService,
) -> Result<()> {
    let volumes = VolumeService::new(deps.pool.clone());

    let tariff_elements: Vec<ChargeElement> = elements
        .into_iter()
        .filter(|el| el.is_two_part_tariff)
        .collect();
    if tariff_elements.is_empty() {
        return Ok(());
    }
    let element_ids: Vec<Uuid> = tariff_elements.iter().map(|el| el.id).collect();
    let by_id: HashMap<Uuid, &ChargeElement> =
        tariff_elements.iter().map(|el| (el.id, el)).collect();

    let expected: HashSet<(Uuid, bool)> = tariff_elements
        .iter()
        .map(|el| (el.id, element_season(el).is_summer()))
        .collect();
    let existing = volumes
        .find_for_elements(&element_ids, financial_year.ending())
        .await?;
    let have: HashSet<(Uuid, bool)> = existing
        .iter()
        .map(|v| (v.charge_element_id, v.is_summer))
        .collect();

    let year_volumes: Vec<BillingVolume> = if expected.is_subset(&have) {
        info!(
            batch_id = %batch.id,
            charge_version_id = %version.id,
            year = financial_year.ending(),
            "reusing existing matched volumes"
        );
        existing
            .into_iter()
            .filter(|v| expected.contains(&(v.charge_element_id, v.is_summer)))
            .collect()
    } else {
        let returns = deps
            .returns
            .returns_for_licence(&version.licence_ref, financial_year)
            .await?;
        let matched = match_charge_version(
            version,
            financial_year,
            tariff_elements.clone(),
            &returns,
            &ProRataAllocation,
        )
        .unwrap_or_default();

        let mut written = Vec::with_capacity(matched.len());
        for volume in &matched {
            written.push(volumes.upsert(batch.id, volume).await?);
        }
        written
    };

    transactions
        .delete_candidates_for_scope(batch.id, &element_ids, period.start_date, period.end_date)
        .await?;
    let invoice_licence_id = upsert_invoice_context(deps, batch, version, period).await?;

    for volume in &year_volumes {
        let Some(element) = by_id.get(&volume.charge_element_id) else {
            continue;
        };
        let season = if volume.is_summer {
            Season::Summer
        } else {
            Season::WinterAllYear
        };
        let billed = volume
            .calculated_volume
            .unwrap_or_else(|| element.billable_quantity());
        transactions
            .insert(NewTransaction {
                billing_batch_id: batch.id,
                billing_invoice_licence_id: invoice_licence_id,
                charge_element_id: element.id,
                is_credit: false,
                charge_period_start: period.start_date,
                charge_period_end: period.end_date,
                description: format!("Two-part tariff charge, {}", element.purpose_use),
                season,
                volume: billed,
                transaction_key: transaction_key(
                    &version.licence_ref,
                    &version.invoice_account_number,
                    element.id,
                    period.start_date,
                    period.end_date,
                    season.as_str(),
                    billed,
                ),
            })
            .await?;
    }
    Ok(())
}

async fn upsert_invoice_context(
    deps: &PipelineDeps,
    batch: &Batch,
    version: &ChargeVersion,
    period: ChargePeriod,
) -> Result<Uuid> {
    let transactions = TransactionService::new(deps.pool.clone());
    let account = deps
        .accounts
        .invoice_account(version.invoice_account_id)
        .await?;
    let year = FinancialYear::containing(period.end_date);
    let invoice = transactions
        .upsert_invoice(batch.id, &account, year.ending())
        .await?;
    let invoice_licence = transactions
        .upsert_invoice_licence(invoice.id, version.licence_id, &version.licence_ref)
        .await?;
    Ok(invoice_licence.id)
}

/// Fan-in: re-reads the batch's aggregate counts and, when this was the last
/// unit to settle cleanly, either parks the batch for review or moves it on.
/// Racing workers may both get here; the queue de-duplicates the enqueue and
/// the status update is conditional, so the decision lands once.
async fn settle_batch_if_done(
    deps: &PipelineDeps,
    batches: &BatchService,
    years: &ChargeVersionYearService,
    batch: &Batch,
) -> Result<()> {
    let counts = years.status_counts(batch.id).await?;
    if !counts.settled() || counts.error > 0 {
        return Ok(());
    }

    if batch.batch_type == BatchType::TwoPartTariff {
        let volumes = VolumeService::new(deps.pool.clone());
        let unapproved = volumes.unapproved_for_batch(batch.id).await?;
        if unapproved > 0 {
            let moved = batches
                .advance(batch.id, BatchStatus::Processing, BatchStatus::Review)
                .await?;
            if moved {
                info!(batch_id = %batch.id, unapproved, "batch parked for volume review");
            }
            return Ok(());
        }
    }

    deps.queue
        .enqueue(&BillingJob::PrepareTransactions { batch_id: batch.id })
        .await?;
    Ok(())
}
