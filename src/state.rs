use crate::auth::jwt::TokenService;
use crate::config::AppConfig;
use crate::storage::{Storage, StorageClient};
use crate::users::{memory::MemoryUserStore, pg::PgUserStore, TimeoutStore, UserStore};
use anyhow::Context;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub storage: Arc<dyn StorageClient>,
    pub tokens: Arc<TokenService>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let users = if config.database_url == "memory" {
            warn!("DATABASE_URL=memory: users are kept in process memory and lost on restart");
            Arc::new(MemoryUserStore::new()) as Arc<dyn UserStore>
        } else {
            let db = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(config.store_timeout())
                .connect(&config.database_url)
                .await
                .context("connect to database")?;

            if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
                warn!(error = %e, "migration failed; continuing");
            }
            Arc::new(PgUserStore::new(db)) as Arc<dyn UserStore>
        };

        let storage = Arc::new(Storage::new(&config.media).await?) as Arc<dyn StorageClient>;

        Ok(Self::from_parts(config, users, storage))
    }

    /// Wires the given collaborators; every store call is bounded by the configured timeout.
    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        let users = Arc::new(TimeoutStore::new(users, config.store_timeout())) as Arc<dyn UserStore>;
        let tokens = Arc::new(TokenService::from_config(&config.jwt));
        Self {
            config,
            users,
            storage,
            tokens,
        }
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with(
            Arc::new(MemoryUserStore::new()),
            Arc::new(fake::FakeStorage::default()),
        )
    }

    #[cfg(test)]
    pub fn fake_with(users: Arc<dyn UserStore>, storage: Arc<dyn StorageClient>) -> Self {
        Self::from_parts(Arc::new(crate::config::test_config()), users, storage)
    }
}
