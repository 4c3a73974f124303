use anyhow::Context;
use diesel_migrations::MigrationHarness;
use dotenvy::dotenv;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use deskserver::api_router::configure_api_routes;
use deskserver::config::AppConfig;
use deskserver::shared::state::AppState;
use deskserver::shared::utils::create_conn;
use deskserver::MIGRATIONS;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = AppConfig::from_env();

    let pool = create_conn(&config.database_url).context("failed to build database pool")?;
    {
        let mut conn = pool.get().context("failed to connect to database")?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("migrations failed: {e}"))?;
    }
    info!("connected to Postgres");

    // The cache backs best-effort protections only; the server starts
    // without it and the gates fail open.
    let cache = match redis::Client::open(config.redis_url.as_str()) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("cache disabled, invalid REDIS_URL: {e}");
            None
        }
    };

    let addr = SocketAddr::new(
        config.server.host.parse().context("invalid SERVER_HOST")?,
        config.server.port,
    );

    let state = Arc::new(AppState {
        conn: pool,
        cache,
        config,
    });
    let app = configure_api_routes(state.clone()).with_state(state);

    info!("server running on http://{addr}");
    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
