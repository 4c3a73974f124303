pub mod api_router;
pub mod auth;
pub mod config;
pub mod idempotency;
pub mod rate_limit;
pub mod shared;
pub mod tickets;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
