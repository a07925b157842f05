use std::collections::{BTreeMap, BTreeSet, HashMap};

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::connectors::AccountsData;
use crate::error::{AppError, AppResult};

use super::models::{Batch, Season};
use super::transactions::{NewTransaction, TransactionService};

/// The fields reconciliation decisions are made from. Both sides of the
/// comparison reduce to this view.
#[derive(Debug, Clone)]
pub struct KeyedTransaction {
    pub id: Uuid,
    pub transaction_key: String,
    pub is_credit: bool,
}

/// What reconciliation decided to do. Deletions and credits touch disjoint
/// rows, so the two sets can be executed concurrently.
#[derive(Debug, Default)]
pub struct ReconciliationPlan {
    pub delete_ids: Vec<Uuid>,
    pub credit_source_ids: Vec<Uuid>,
}

/// Compares the batch's candidates against billing history and decides, per
/// transaction key, whether the candidate duplicates a past charge (delete
/// it) or a past charge has lost its candidate (credit it back).
///
/// When history holds several entries for one key the latest wins; a key
/// whose latest entry is a credit has already been paid back and needs no
/// further action. A credit already present in the batch also suppresses a
/// second credit for its key, which keeps a re-run of reconciliation from
/// doubling up.
pub fn plan_reconciliation(
    current: &[KeyedTransaction],
    historical: &[KeyedTransaction],
) -> ReconciliationPlan {
    let mut historical_index: BTreeMap<&str, &KeyedTransaction> = BTreeMap::new();
    for tx in historical {
        historical_index.insert(tx.transaction_key.as_str(), tx);
    }

    let mut current_charges: BTreeMap<&str, &KeyedTransaction> = BTreeMap::new();
    let mut current_credit_keys: BTreeSet<&str> = BTreeSet::new();
    for tx in current {
        if tx.is_credit {
            current_credit_keys.insert(tx.transaction_key.as_str());
        } else {
            current_charges.insert(tx.transaction_key.as_str(), tx);
        }
    }

    let mut plan = ReconciliationPlan::default();
    for (key, hist) in &historical_index {
        if hist.is_credit {
            continue;
        }
        if let Some(current) = current_charges.get(key) {
            plan.delete_ids.push(current.id);
        } else if !current_credit_keys.contains(key) {
            plan.credit_source_ids.push(hist.id);
        }
    }
    plan
}

/// A historical charge carrying the invoice and licence context a mirrored
/// credit needs, since the credit cannot borrow the old batch's invoices.
#[derive(Debug, Clone)]
pub struct HistoricalCharge {
    pub id: Uuid,
    pub charge_element_id: Uuid,
    pub is_credit: bool,
    pub charge_period_start: chrono::NaiveDate,
    pub charge_period_end: chrono::NaiveDate,
    pub description: String,
    pub season: String,
    pub volume: rust_decimal::Decimal,
    pub transaction_key: String,
    pub licence_id: Uuid,
    pub licence_ref: String,
    pub invoice_account_id: Uuid,
    pub financial_year_ending: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationOutcome {
    pub deleted: usize,
    pub credited: usize,
}

/// key: billing-supplementary -> delta reconciliation against sent batches
#[derive(Clone)]
pub struct SupplementaryService {
    pool: PgPool,
}

impl SupplementaryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the full reconciliation for a supplementary batch: both sides are
    /// read first, the plan is computed, then deletions and credit insertions
    /// execute concurrently. Nothing mutates until both reads are done.
    pub async fn reconcile(
        &self,
        batch: &Batch,
        accounts: &dyn AccountsData,
        transactions: &TransactionService,
    ) -> AppResult<ReconciliationOutcome> {
        let current = self.batch_candidates(batch.id).await?;
        let historical = self.historical_for_batch(batch).await?;

        let historical_keyed: Vec<KeyedTransaction> = historical
            .iter()
            .map(|tx| KeyedTransaction {
                id: tx.id,
                transaction_key: tx.transaction_key.clone(),
                is_credit: tx.is_credit,
            })
            .collect();
        let plan = plan_reconciliation(&current, &historical_keyed);

        let by_id: HashMap<Uuid, &HistoricalCharge> =
            historical.iter().map(|tx| (tx.id, tx)).collect();

        let deletions = async {
            for id in &plan.delete_ids {
                transactions.delete(*id).await?;
            }
            Ok::<_, AppError>(())
        };
        let credits = async {
            for source_id in &plan.credit_source_ids {
                let Some(hist) = by_id.get(source_id) else {
                    return Err(AppError::Message(format!(
                        "reconciliation lost historical transaction {source_id}"
                    )));
                };
                self.insert_credit(batch, hist, accounts, transactions)
                    .await?;
            }
            Ok::<_, AppError>(())
        };
        tokio::try_join!(deletions, credits)?;

        let outcome = ReconciliationOutcome {
            deleted: plan.delete_ids.len(),
            credited: plan.credit_source_ids.len(),
        };
        info!(
            batch_id = %batch.id,
            deleted = outcome.deleted,
            credited = outcome.credited,
            "supplementary reconciliation applied"
        );
        Ok(outcome)
    }

    async fn batch_candidates(&self, batch_id: Uuid) -> AppResult<Vec<KeyedTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_key, is_credit
            FROM billing_transactions
            WHERE billing_batch_id = $1 AND status = 'candidate'
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| KeyedTransaction {
                id: row.get("id"),
                transaction_key: row.get("transaction_key"),
                is_credit: row.get("is_credit"),
            })
            .collect())
    }

    /// Everything already billed for this batch's licences: transactions of
    /// sent batches in the region, within the batch's year span, oldest
    /// first so that index building keeps the latest entry per key.
    async fn historical_for_batch(&self, batch: &Batch) -> AppResult<Vec<HistoricalCharge>> {
        let rows = sqlx::query(
            r#"
            SELECT
                t.id,
                t.charge_element_id,
                t.is_credit,
                t.charge_period_start,
                t.charge_period_end,
                t.description,
                t.season,
                t.volume,
                t.transaction_key,
                il.licence_id,
                il.licence_ref,
                i.invoice_account_id,
                i.financial_year_ending
            FROM billing_transactions t
            JOIN billing_invoice_licences il ON il.id = t.billing_invoice_licence_id
            JOIN billing_invoices i ON i.id = il.billing_invoice_id
            JOIN billing_batches b ON b.id = t.billing_batch_id
            WHERE b.status = 'sent'
              AND b.region = $2
              AND t.status = 'charge_created'
              AND i.financial_year_ending BETWEEN $3 AND $4
              AND il.licence_ref IN (
                  SELECT il2.licence_ref
                  FROM billing_invoice_licences il2
                  JOIN billing_invoices i2 ON i2.id = il2.billing_invoice_id
                  WHERE i2.billing_batch_id = $1
              )
            ORDER BY t.created_at
            "#,
        )
        .bind(batch.id)
        .bind(&batch.region)
        .bind(batch.from_financial_year_ending)
        .bind(batch.to_financial_year_ending)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(historical_from_row).collect())
    }

    async fn insert_credit(
        &self,
        batch: &Batch,
        hist: &HistoricalCharge,
        accounts: &dyn AccountsData,
        transactions: &TransactionService,
    ) -> AppResult<()> {
        let account = accounts.invoice_account(hist.invoice_account_id).await?;
        let season = Season::from_db(&hist.season).ok_or_else(|| {
            AppError::Message(format!("unknown season {} in history", hist.season))
        })?;

        let invoice = transactions
            .upsert_invoice(batch.id, &account, hist.financial_year_ending)
            .await?;
        let invoice_licence = transactions
            .upsert_invoice_licence(invoice.id, hist.licence_id, &hist.licence_ref)
            .await?;
        transactions
            .insert(NewTransaction {
                billing_batch_id: batch.id,
                billing_invoice_licence_id: invoice_licence.id,
                charge_element_id: hist.charge_element_id,
                is_credit: true,
                charge_period_start: hist.charge_period_start,
                charge_period_end: hist.charge_period_end,
                description: hist.description.clone(),
                season,
                volume: hist.volume,
                transaction_key: hist.transaction_key.clone(),
            })
            .await?;
        Ok(())
    }
}

fn historical_from_row(row: &PgRow) -> HistoricalCharge {
    HistoricalCharge {
        id: row.get("id"),
        charge_element_id: row.get("charge_element_id"),
        is_credit: row.get("is_credit"),
        charge_period_start: row.get("charge_period_start"),
        charge_period_end: row.get("charge_period_end"),
        description: row.get("description"),
        season: row.get("season"),
        volume: row.get("volume"),
        transaction_key: row.get("transaction_key"),
        licence_id: row.get("licence_id"),
        licence_ref: row.get("licence_ref"),
        invoice_account_id: row.get("invoice_account_id"),
        financial_year_ending: row.get("financial_year_ending"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(key: &str, is_credit: bool) -> KeyedTransaction {
        KeyedTransaction {
            id: Uuid::new_v4(),
            transaction_key: key.into(),
            is_credit,
        }
    }

    #[test]
    fn historical_charge_with_no_candidate_is_credited() {
        let hist = keyed("A", false);
        let hist_id = hist.id;
        let plan = plan_reconciliation(&[], &[hist]);
        assert_eq!(plan.credit_source_ids, vec![hist_id]);
        assert!(plan.delete_ids.is_empty());
    }

    #[test]
    fn candidate_matching_a_historical_charge_is_deleted() {
        let current = keyed("A", false);
        let current_id = current.id;
        let plan = plan_reconciliation(&[current], &[keyed("A", false)]);
        assert_eq!(plan.delete_ids, vec![current_id]);
        assert!(plan.credit_source_ids.is_empty());
    }

    #[test]
    fn candidate_with_no_history_is_left_alone() {
        let plan = plan_reconciliation(&[keyed("B", false)], &[]);
        assert!(plan.delete_ids.is_empty());
        assert!(plan.credit_source_ids.is_empty());
    }

    #[test]
    fn historical_credit_suppresses_any_action() {
        // the charge was already paid back; a new candidate re-bills it
        let plan = plan_reconciliation(&[keyed("A", false)], &[keyed("A", true)]);
        assert!(plan.delete_ids.is_empty());
        assert!(plan.credit_source_ids.is_empty());

        let plan = plan_reconciliation(&[], &[keyed("A", true)]);
        assert!(plan.delete_ids.is_empty());
        assert!(plan.credit_source_ids.is_empty());
    }

    #[test]
    fn latest_history_entry_wins_per_key() {
        // charge then credit: the key is settled, candidate stays billable
        let plan = plan_reconciliation(
            &[keyed("A", false)],
            &[keyed("A", false), keyed("A", true)],
        );
        assert!(plan.delete_ids.is_empty());
        assert!(plan.credit_source_ids.is_empty());

        // credit then charge re-billed later: candidate duplicates it
        let current = keyed("A", false);
        let current_id = current.id;
        let plan = plan_reconciliation(&[current], &[keyed("A", true), keyed("A", false)]);
        assert_eq!(plan.delete_ids, vec![current_id]);
    }

    #[test]
    fn existing_batch_credit_is_not_credited_twice() {
        let plan = plan_reconciliation(&[keyed("A", true)], &[keyed("A", false)]);
        assert!(plan.delete_ids.is_empty());
        assert!(plan.credit_source_ids.is_empty());
    }

    #[test]
    fn mixed_keys_produce_independent_decisions() {
        let dup = keyed("A", false);
        let dup_id = dup.id;
        let gone = keyed("B", false);
        let gone_id = gone.id;
        let plan = plan_reconciliation(
            &[dup, keyed("C", false)],
            &[keyed("A", false), gone, keyed("D", true)],
        );
        assert_eq!(plan.delete_ids, vec![dup_id]);
        assert_eq!(plan.credit_source_ids, vec![gone_id]);
    }
}
