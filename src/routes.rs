use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::api;

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/billing/batches",
            get(api::list_batches).post(api::create_batch),
        )
        .route("/api/billing/batches/:id", get(api::get_batch))
        .route(
            "/api/billing/batches/:id/approve-review",
            post(api::approve_review),
        )
        .route("/api/billing/batches/:id/send", post(api::send_batch))
        .route("/api/billing/batches/:id/cancel", post(api::cancel_batch))
        .route(
            "/api/billing/batches/:id/volumes",
            get(api::list_batch_volumes),
        )
        .route("/api/billing/volumes/:id/approve", post(api::approve_volume))
}
