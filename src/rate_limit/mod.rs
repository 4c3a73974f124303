//! Per-principal rate limiting.
//!
//! Fixed-window counter backed by the cache's atomic `INCR`: the first
//! increment in a window sets a TTL, and the counter disappears wholesale
//! when it expires. Bursts straddling a window boundary are admitted; a
//! sliding scheme was deliberately not used. The expiry is a separate call
//! after the increment, so a crash in between can leave a counter that
//! outlives its window by one reset.
//!
//! Unauthenticated requests pass through (the auth gate upstream owns that
//! rejection), and any cache failure fails open with a log line.

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::warn;
use redis::AsyncCommands;
use std::sync::Arc;

use crate::auth::AuthenticatedUser;
use crate::shared::errors::ApiError;
use crate::shared::state::AppState;

const KEY_PREFIX: &str = "rate-limit:";

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    // Only the expensive mutation endpoints are gated.
    if request.method() != Method::POST {
        return next.run(request).await;
    }

    let Some(user) = request.extensions().get::<AuthenticatedUser>() else {
        return next.run(request).await;
    };

    let Some(client) = state.cache.clone() else {
        return next.run(request).await;
    };

    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("rate limiter cache unavailable, allowing request: {e}");
            return next.run(request).await;
        }
    };

    let key = format!("{KEY_PREFIX}{}", user.id);
    let limits = &state.config.rate_limit;

    match conn.incr::<_, _, i64>(&key, 1).await {
        Ok(count) => {
            if count == 1 {
                if let Err(e) = conn.expire::<_, ()>(&key, limits.window_secs).await {
                    warn!("failed to set rate-limit window on {key}: {e}");
                }
            }
            if count > limits.max_requests {
                return ApiError::RateLimit.into_response();
            }
            next.run(request).await
        }
        Err(e) => {
            warn!("rate limiter increment failed, allowing request: {e}");
            next.run(request).await
        }
    }
}
