use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use water_billing::billing::{
    BatchService, BatchStatus, BatchType, NewBatch, TransactionService, VolumeService,
};
use water_billing::charging_engine::StubChargingEngine;
use water_billing::connectors::{PgAccountsData, PgReturnsData};
use water_billing::job_queue::{drain, BillingJob, JobQueue, PipelineDeps};
use water_billing::matching::MatchedVolume;

// key: volume-tests -> matched volume reuse, approval resets, review gating

fn pipeline(pool: &PgPool) -> PipelineDeps {
    PipelineDeps {
        pool: pool.clone(),
        queue: JobQueue::new(pool.clone()),
        engine: Arc::new(StubChargingEngine::default()),
        returns: Arc::new(PgReturnsData::new(pool.clone())),
        accounts: Arc::new(PgAccountsData::new(pool.clone())),
    }
}

async fn seed_licence(pool: &PgPool, licence_ref: &str, region: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO licences (id, licence_ref, region) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(licence_ref)
        .bind(region)
        .execute(pool)
        .await
        .unwrap();
    id
}

async fn seed_account(pool: &PgPool, account_number: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO invoice_accounts (id, account_number, company_name, address) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(account_number)
    .bind("Severn Valley Farms Ltd")
    .bind(json!({"line1": "8 Weir Street", "postcode": "WR1 3DD"}))
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn seed_charge_version(
    pool: &PgPool,
    licence_id: Uuid,
    licence_ref: &str,
    region: &str,
    account_id: Uuid,
    account_number: &str,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO charge_versions
            (id, licence_id, licence_ref, region, invoice_account_id, invoice_account_number, start_date)
        VALUES ($1, $2, $3, $4, $5, $6, '2020-04-01')
        "#,
    )
    .bind(id)
    .bind(licence_id)
    .bind(licence_ref)
    .bind(region)
    .bind(account_id)
    .bind(account_number)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn seed_summer_element(
    pool: &PgPool,
    charge_version_id: Uuid,
    authorised: i64,
    billable: Option<i64>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO charge_elements
            (id, charge_version_id, purpose_use, season, authorised_annual_quantity,
             billable_annual_quantity, is_two_part_tariff)
        VALUES ($1, $2, 'spray irrigation', 'summer', $3, $4, TRUE)
        "#,
    )
    .bind(id)
    .bind(charge_version_id)
    .bind(Decimal::new(authorised, 0))
    .bind(billable.map(|b| Decimal::new(b, 0)))
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn seed_summer_return(pool: &PgPool, licence_ref: &str, quantities: &[i64], under_query: bool) {
    let lines: Vec<serde_json::Value> = quantities
        .iter()
        .enumerate()
        .map(|(i, q)| {
            json!({
                "start_date": format!("2025-06-{:02}", i + 1),
                "end_date": format!("2025-06-{:02}", i + 1),
                "quantity": q.to_string()
            })
        })
        .collect();
    sqlx::query(
        r#"
        INSERT INTO water_returns
            (id, licence_ref, status, is_summer, is_two_part_tariff, under_query, purpose_uses,
             start_date, end_date, lines)
        VALUES ($1, $2, 'completed', TRUE, TRUE, $3, $4, '2025-04-01', '2026-03-31', $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(licence_ref)
    .bind(under_query)
    .bind(json!(["spray irrigation"]))
    .bind(json!(lines))
    .execute(pool)
    .await
    .unwrap();
}

async fn run_two_part_tariff_batch(deps: &PipelineDeps, pool: &PgPool, region: &str) -> Uuid {
    let batches = BatchService::new(pool.clone());
    let batch = batches
        .create(NewBatch {
            batch_type: BatchType::TwoPartTariff,
            region: region.into(),
            to_financial_year_ending: 2026,
            is_summer: true,
        })
        .await
        .unwrap();
    deps.queue
        .enqueue(&BillingJob::CreateBillRun { batch_id: batch.id })
        .await
        .unwrap();
    drain(deps).await.unwrap();
    batch.id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn matched_volumes_are_reused_by_later_batches(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let licence_id = seed_licence(&pool, "20/100", "severn").await;
    let account_id = seed_account(&pool, "A80000005A").await;
    let version =
        seed_charge_version(&pool, licence_id, "20/100", "severn", account_id, "A80000005A").await;
    let element = seed_summer_element(&pool, version, 100, None).await;
    seed_summer_return(&pool, "20/100", &[30, 20], false).await;

    // First batch matches, gets reviewed and goes all the way to sent.
    let deps = pipeline(&pool);
    let batches = BatchService::new(pool.clone());
    let volumes = VolumeService::new(pool.clone());
    let first = run_two_part_tariff_batch(&deps, &pool, "severn").await;
    assert_eq!(batches.get(first).await.unwrap().status, BatchStatus::Review);

    let matched = volumes.list_for_batch(first).await.unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].calculated_volume, Some(Decimal::new(50, 0)));
    volumes.approve(matched[0].id).await.unwrap();
    assert!(batches
        .advance(first, BatchStatus::Review, BatchStatus::Processing)
        .await
        .unwrap());
    deps.queue
        .enqueue(&BillingJob::PrepareTransactions { batch_id: first })
        .await
        .unwrap();
    drain(&deps).await.unwrap();
    deps.queue
        .enqueue(&BillingJob::UpdateInvoiceReferences { batch_id: first })
        .await
        .unwrap();
    drain(&deps).await.unwrap();
    assert_eq!(batches.get(first).await.unwrap().status, BatchStatus::Sent);

    // The licence holder resubmits different quantities afterwards; the
    // already-approved volume must win over a re-match.
    sqlx::query("UPDATE water_returns SET lines = $1 WHERE licence_ref = '20/100'")
        .bind(json!([
            {"start_date": "2025-06-01", "end_date": "2025-06-30", "quantity": "80"}
        ]))
        .execute(&pool)
        .await
        .unwrap();

    let later_deps = pipeline(&pool);
    let second = run_two_part_tariff_batch(&later_deps, &pool, "severn").await;

    let batch = batches.get(second).await.unwrap();
    assert_eq!(
        batch.status,
        BatchStatus::Ready,
        "an approved volume needs no second review"
    );
    assert_eq!(batch.invoice_count, Some(1));
    assert_eq!(batch.net_total, Some(Decimal::new(50, 0)));

    let rows = volumes.find_for_elements(&[element], 2026).await.unwrap();
    assert_eq!(rows.len(), 1, "reuse writes no second volume row");
    assert_eq!(rows[0].calculated_volume, Some(Decimal::new(50, 0)));
    assert!(rows[0].is_approved);
    assert_eq!(rows[0].billing_batch_id, first, "the producing batch keeps the row");

    let transactions = TransactionService::new(pool.clone());
    let charged = transactions.list_for_batch(second).await.unwrap();
    assert_eq!(charged.len(), 1);
    assert_eq!(charged[0].volume, Decimal::new(50, 0));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn changed_volume_resets_its_approval(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let licence_id = seed_licence(&pool, "21/150", "tees").await;
    let account_id = seed_account(&pool, "A80000006A").await;
    let version =
        seed_charge_version(&pool, licence_id, "21/150", "tees", account_id, "A80000006A").await;
    let element = seed_summer_element(&pool, version, 100, None).await;

    let batches = BatchService::new(pool.clone());
    let batch = batches
        .create(NewBatch {
            batch_type: BatchType::TwoPartTariff,
            region: "tees".into(),
            to_financial_year_ending: 2026,
            is_summer: true,
        })
        .await
        .unwrap();

    let volumes = VolumeService::new(pool.clone());
    let mut matched = MatchedVolume {
        charge_element_id: element,
        financial_year_ending: 2026,
        is_summer: true,
        calculated_volume: Some(Decimal::new(50, 0)),
        two_part_tariff_status: None,
        two_part_tariff_error: false,
    };
    let row = volumes.upsert(batch.id, &matched).await.unwrap();
    assert!(!row.is_approved);
    volumes.approve(row.id).await.unwrap();

    // Re-matching the same number keeps the approval.
    let row = volumes.upsert(batch.id, &matched).await.unwrap();
    assert!(row.is_approved);

    // A different number drops it.
    matched.calculated_volume = Some(Decimal::new(60, 0));
    let row = volumes.upsert(batch.id, &matched).await.unwrap();
    assert_eq!(row.calculated_volume, Some(Decimal::new(60, 0)));
    assert!(!row.is_approved, "a changed volume must be re-reviewed");

    volumes.approve(row.id).await.unwrap();
    matched.calculated_volume = None;
    matched.two_part_tariff_status = Some(20);
    matched.two_part_tariff_error = true;
    let row = volumes.upsert(batch.id, &matched).await.unwrap();
    assert!(!row.is_approved, "losing the volume also drops the approval");
    assert_eq!(row.two_part_tariff_status, Some(20));

    let rows = volumes.find_for_elements(&[element], 2026).await.unwrap();
    assert_eq!(rows.len(), 1, "the cell keeps a single row through every rewrite");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn missing_season_coverage_triggers_rematching(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let licence_id = seed_licence(&pool, "21/200", "mersey").await;
    let account_id = seed_account(&pool, "A90000007A").await;
    let version =
        seed_charge_version(&pool, licence_id, "21/200", "mersey", account_id, "A90000007A").await;
    let element = seed_summer_element(&pool, version, 100, None).await;
    seed_summer_return(&pool, "21/200", &[25, 20], false).await;

    // A winter row exists from an earlier batch, but this element bills as
    // summer, so coverage is incomplete and matching must run.
    let earlier = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO billing_batches
            (id, batch_type, status, region, from_financial_year_ending, to_financial_year_ending)
        VALUES ($1, 'two_part_tariff', 'sent', 'mersey', 2026, 2026)
        "#,
    )
    .bind(earlier)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        INSERT INTO billing_volumes
            (id, charge_element_id, financial_year_ending, is_summer, calculated_volume,
             is_approved, billing_batch_id)
        VALUES ($1, $2, 2026, FALSE, 99, TRUE, $3)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(element)
    .bind(earlier)
    .execute(&pool)
    .await
    .unwrap();

    let deps = pipeline(&pool);
    let batches = BatchService::new(pool.clone());
    let batch_id = run_two_part_tariff_batch(&deps, &pool, "mersey").await;
    assert_eq!(
        batches.get(batch_id).await.unwrap().status,
        BatchStatus::Review,
        "the freshly matched summer volume needs approval"
    );

    let volumes = VolumeService::new(pool.clone());
    let rows = volumes.find_for_elements(&[element], 2026).await.unwrap();
    assert_eq!(rows.len(), 2);
    let summer = rows.iter().find(|v| v.is_summer).unwrap();
    assert_eq!(summer.calculated_volume, Some(Decimal::new(45, 0)));
    assert_eq!(summer.billing_batch_id, batch_id);
    assert!(!summer.is_approved);
    let winter = rows.iter().find(|v| !v.is_summer).unwrap();
    assert_eq!(winter.calculated_volume, Some(Decimal::new(99, 0)));
    assert_eq!(winter.billing_batch_id, earlier, "the stale winter row is untouched");

    assert_eq!(volumes.list_for_batch(batch_id).await.unwrap().len(), 1);
    let transactions = TransactionService::new(pool.clone());
    let candidates = transactions.list_candidates(batch_id).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].volume, Decimal::new(45, 0));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn under_query_returns_fall_back_to_billable_quantity(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let licence_id = seed_licence(&pool, "22/300", "thames").await;
    let account_id = seed_account(&pool, "A90000008A").await;
    let version =
        seed_charge_version(&pool, licence_id, "22/300", "thames", account_id, "A90000008A").await;
    let element = seed_summer_element(&pool, version, 90, Some(70)).await;
    seed_summer_return(&pool, "22/300", &[30], true).await;

    let deps = pipeline(&pool);
    let batches = BatchService::new(pool.clone());
    let batch_id = run_two_part_tariff_batch(&deps, &pool, "thames").await;
    assert_eq!(batches.get(batch_id).await.unwrap().status, BatchStatus::Review);

    let volumes = VolumeService::new(pool.clone());
    let rows = volumes.list_for_batch(batch_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].calculated_volume,
        Some(Decimal::new(70, 0)),
        "an under-query match bills the billable quantity"
    );
    assert_eq!(rows[0].two_part_tariff_status, Some(20));
    assert!(rows[0].two_part_tariff_error);
    assert!(!rows[0].is_approved);

    let transactions = TransactionService::new(pool.clone());
    let candidates = transactions.list_candidates(batch_id).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].volume, Decimal::new(70, 0));
}
