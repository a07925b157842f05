use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use water_billing::billing::{BatchService, BatchType, NewBatch};
use water_billing::job_queue::JobQueue;
use water_billing::routes::api_routes;

// key: http-tests -> the REST surface over the batch services

async fn root() -> &'static str {
    "Water Billing API"
}

#[tokio::test]
async fn root_responds_ok() {
    let app = Router::new().route("/", get(root));
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, "Water Billing API".as_bytes());
}

#[tokio::test]
async fn metrics_returns_ok() {
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .layer(layer);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

fn app(pool: &PgPool) -> Router {
    api_routes()
        .layer(Extension(pool.clone()))
        .layer(Extension(JobQueue::new(pool.clone())))
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn create_batch_rejects_a_second_live_batch_in_the_region(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(&pool);

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/api/billing/batches")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "batch_type": "annual",
                    "region": "wessex",
                    "financial_year_ending": 2026
                })
                .to_string(),
            ))
            .unwrap()
    };

    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let batch = json_body(response).await;
    assert_eq!(batch["status"], "processing");
    assert_eq!(batch["region"], "wessex");
    assert_eq!(batch["from_financial_year_ending"], 2026);

    let job_key: String = format!("billing.create-bill-run.{}", batch["id"].as_str().unwrap());
    let queued: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM billing_job_queue WHERE job_key = $1")
            .bind(&job_key)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(queued, 1, "creating a batch starts the pipeline");

    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn batch_detail_reports_year_progress(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(&pool);

    let licence_id = Uuid::new_v4();
    sqlx::query("INSERT INTO licences (id, licence_ref, region) VALUES ($1, '30/400', 'dee')")
        .bind(licence_id)
        .execute(&pool)
        .await
        .unwrap();
    let account_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO invoice_accounts (id, account_number, company_name, address) VALUES ($1, 'A90000009A', 'Dee Growers Ltd', '{}'::jsonb)",
    )
    .bind(account_id)
    .execute(&pool)
    .await
    .unwrap();
    let version = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO charge_versions
            (id, licence_id, licence_ref, region, invoice_account_id, invoice_account_number, start_date)
        VALUES ($1, $2, '30/400', 'dee', $3, 'A90000009A', '2020-04-01')
        "#,
    )
    .bind(version)
    .bind(licence_id)
    .bind(account_id)
    .execute(&pool)
    .await
    .unwrap();

    let batches = BatchService::new(pool.clone());
    let batch = batches
        .create(NewBatch {
            batch_type: BatchType::Annual,
            region: "dee".into(),
            to_financial_year_ending: 2026,
            is_summer: false,
        })
        .await
        .unwrap();
    for (fy, status) in [(2025, "ready"), (2026, "processing")] {
        sqlx::query(
            r#"
            INSERT INTO billing_charge_version_years
                (id, billing_batch_id, charge_version_id, financial_year_ending, status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(batch.id)
        .bind(version)
        .bind(fy)
        .bind(status)
        .execute(&pool)
        .await
        .unwrap();
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/billing/batches/{}", batch.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = json_body(response).await;
    assert_eq!(detail["batch"]["id"], batch.id.to_string());
    assert_eq!(detail["charge_version_years"]["ready"], 1);
    assert_eq!(detail["charge_version_years"]["processing"], 1);
    assert_eq!(detail["charge_version_years"]["error"], 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approve_review_requires_a_reviewable_batch(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(&pool);

    let batches = BatchService::new(pool.clone());
    let batch = batches
        .create(NewBatch {
            batch_type: BatchType::TwoPartTariff,
            region: "eden".into(),
            to_financial_year_ending: 2026,
            is_summer: true,
        })
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/billing/batches/{}/approve-review", batch.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        StatusCode::CONFLICT,
        "a processing batch has no review to approve"
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn missing_batch_returns_not_found(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(&pool);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/billing/batches/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
