//! Idempotency replay cache.
//!
//! POST requests carrying an `Idempotency-Key` header are answered from the
//! cache when the key has been seen before; otherwise the downstream
//! response is captured once and stored for 24 hours. Requests without the
//! header, non-POST requests and any cache failure pass straight through —
//! the cache is a best-effort protection, never a correctness gate.
//!
//! The lookup and the store are two separate cache calls, so two
//! near-simultaneous first requests with the same key can both reach the
//! handler. Callers needing strict at-most-once execution must not rely on
//! this layer.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::{error, warn};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::shared::state::AppState;

const KEY_PREFIX: &str = "idempotency:";
const TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub body: String,
}

pub async fn idempotency_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }

    let Some(token) = request
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return next.run(request).await;
    };

    let Some(client) = state.cache.clone() else {
        return next.run(request).await;
    };

    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("idempotency cache unavailable, continuing without protection: {e}");
            return next.run(request).await;
        }
    };

    let key = format!("{KEY_PREFIX}{token}");

    match conn.get::<_, Option<String>>(&key).await {
        Ok(Some(cached)) => match serde_json::from_str::<CachedResponse>(&cached) {
            Ok(entry) => return replay(entry),
            Err(e) => warn!("discarding unreadable idempotency entry for {key}: {e}"),
        },
        Ok(None) => {}
        Err(e) => {
            warn!("idempotency lookup failed, continuing without protection: {e}");
            return next.run(request).await;
        }
    }

    let response = next.run(request).await;

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to buffer response body for idempotency capture: {e}");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let entry = CachedResponse {
        status_code: parts.status.as_u16(),
        body: String::from_utf8_lossy(&bytes).into_owned(),
    };
    match serde_json::to_string(&entry) {
        Ok(json) => {
            if let Err(e) = conn.set_ex::<_, _, ()>(&key, json, TTL_SECS).await {
                warn!("failed to store idempotency entry for {key}: {e}");
            }
        }
        Err(e) => error!("failed to serialize idempotency entry: {e}"),
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn replay(entry: CachedResponse) -> Response {
    let status = StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(entry.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
