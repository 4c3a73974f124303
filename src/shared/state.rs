use crate::config::AppConfig;
use crate::shared::utils::DbPool;
use redis::Client as RedisClient;
use std::sync::Arc;

pub struct AppState {
    pub conn: DbPool,
    pub cache: Option<Arc<RedisClient>>,
    pub config: AppConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("cache", &self.cache.is_some())
            .field("config", &self.config)
            .finish()
    }
}
