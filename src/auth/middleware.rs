//! Bearer-token authentication and role checks.
//!
//! `protect` validates the `Authorization` header, loads the user record and
//! inserts an [`AuthenticatedUser`] into the request extensions for
//! downstream handlers and the rate limiter. Role branching is centralized
//! here instead of being repeated at each call site.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use diesel::prelude::*;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{Claims, Role, User};
use crate::shared::errors::ApiError;
use crate::shared::schema::users;
use crate::shared::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn is_elevated(&self) -> bool {
        matches!(self.role, Role::Agent | Role::Admin)
    }

    /// Capability check for reading or commenting on a ticket: elevated
    /// roles always pass, plain users only for tickets they created.
    pub fn can_access_ticket(&self, created_by: Uuid) -> bool {
        self.is_elevated() || self.id == created_by
    }
}

/// Gate for routes restricted to the given roles.
pub fn require_any_role(user: &AuthenticatedUser, roles: &[Role]) -> Result<(), ApiError> {
    if roles.contains(&user.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "User role '{}' is not authorized to access this route",
            user.role.as_str()
        )))
    }
}

pub async fn protect(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&state, request.headers()) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::NoToken)?;

    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::NotAuthorized("Not authorized, token failed".into()))?
    .claims;

    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| ApiError::NotAuthorized("Not authorized, token failed".into()))?;

    let mut conn = state.conn.get()?;
    let user: User = users::table
        .filter(users::id.eq(user_id))
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| ApiError::NotAuthorized("User not found".into()))?;

    Ok(AuthenticatedUser {
        id: user.id,
        username: user.username,
        email: user.email,
        role: Role::parse(&user.role),
    })
}
