pub mod middleware;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use diesel::prelude::*;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::errors::ApiError;
use crate::shared::schema::users;
use crate::shared::state::AppState;

pub use middleware::{protect, AuthenticatedUser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::Admin => "admin",
        }
    }

    /// Unknown role strings degrade to the least-privileged role.
    pub fn parse(s: &str) -> Self {
        match s {
            "admin" => Role::Admin,
            "agent" => Role::Agent,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
}

pub fn me_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/me", get(me))
        .layer(axum::middleware::from_fn_with_state(state, protect))
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let (username, email, password) = match (req.username, req.email, req.password) {
        (Some(u), Some(e), Some(p)) if !u.trim().is_empty() && !e.trim().is_empty() && !p.is_empty() => {
            (u.trim().to_string(), e.trim().to_lowercase(), p)
        }
        _ => return Err(ApiError::FieldRequired("All fields are required".into())),
    };

    let mut conn = state.conn.get()?;

    let existing: Option<Uuid> = users::table
        .filter(users::email.eq(&email).or(users::username.eq(&username)))
        .select(users::id)
        .first(&mut conn)
        .optional()?;
    if existing.is_some() {
        return Err(ApiError::UserExists);
    }

    let password_hash = hash_password(&password)?;
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        username,
        email,
        password_hash,
        role: req.role.unwrap_or(Role::User).as_str().to_string(),
        created_at: now,
        updated_at: now,
    };

    diesel::insert_into(users::table)
        .values(&user)
        .execute(&mut conn)?;

    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            id: user.id,
            username: user.username,
            email: user.email,
            role: Role::parse(&user.role),
        }),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let (email, password) = match (req.email, req.password) {
        (Some(e), Some(p)) if !e.trim().is_empty() && !p.is_empty() => {
            (e.trim().to_lowercase(), p)
        }
        _ => {
            return Err(ApiError::FieldRequired(
                "Email and password are required".into(),
            ))
        }
    };

    let mut conn = state.conn.get()?;

    let user: User = users::table
        .filter(users::email.eq(&email))
        .first(&mut conn)
        .optional()?
        .ok_or(ApiError::InvalidCredentials)?;

    if !verify_password(&password, &user.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }

    let token = issue_token(
        user.id,
        Role::parse(&user.role),
        &state.config.jwt_secret,
        state.config.jwt_expires_in_secs,
    )
    .map_err(|e| anyhow::anyhow!("token encoding failed: {e}"))?;

    Ok(Json(TokenResponse { token }))
}

pub async fn me(Extension(user): Extension<AuthenticatedUser>) -> Json<UserResponse> {
    Json(UserResponse {
        id: user.id,
        username: user.username,
        email: user.email,
        role: user.role,
    })
}

pub fn issue_token(
    user_id: Uuid,
    role: Role,
    secret: &str,
    expires_in_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.as_str().to_string(),
        iat: now,
        exp: now + expires_in_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {e}")))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
