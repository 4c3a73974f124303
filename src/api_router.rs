//! Central API route table.
//!
//! The idempotency gate wraps the whole API so any POST carrying an
//! `Idempotency-Key` header is covered; authentication and rate limiting
//! are layered per route group where they apply.

use axum::{middleware, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::auth;
use crate::idempotency::idempotency_middleware;
use crate::shared::state::AppState;
use crate::tickets;

pub fn configure_api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/auth", auth::configure())
        .nest("/api/users", auth::me_routes(state.clone()))
        .nest("/api", tickets::configure(state.clone()))
        .layer(middleware::from_fn_with_state(state, idempotency_middleware))
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
