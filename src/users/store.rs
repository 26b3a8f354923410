use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use super::repo_types::{NewUser, User};
use crate::error::AppError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(_) => AppError::StoreUnavailable(e.to_string()),
            StoreError::Duplicate(_) => {
                AppError::conflict("User with email or username already exists")
            }
            StoreError::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_),
            ) => AppError::StoreUnavailable(e.to_string()),
            StoreError::Database(db) => AppError::Internal(anyhow::Error::new(db)),
        }
    }
}

/// Persistence for user records. The only shared mutable state in the service.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Match on username OR email, preferring a username match; `None` fields never match.
    async fn find_by_login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, StoreError>;

    async fn exists(&self, username: &str, email: &str) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when username or email is taken.
    async fn create(&self, new: NewUser) -> Result<User, StoreError>;

    /// Overwrite (or clear) the stored refresh token unconditionally.
    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), StoreError>;

    /// Atomically replace the stored refresh token only if it still equals `expected`.
    /// Returns `false` when another writer got there first.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> Result<bool, StoreError>;

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError>;

    async fn update_details(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn set_avatar(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError>;

    async fn set_cover_image(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError>;
}

/// Bounds every call on the wrapped store by a fixed deadline.
pub struct TimeoutStore {
    inner: Arc<dyn UserStore>,
    limit: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn UserStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(res) => res,
            Err(_) => {
                warn!(op, limit_ms = self.limit.as_millis() as u64, "store call timed out");
                Err(StoreError::Timeout(self.limit))
            }
        }
    }
}

#[async_trait]
impl UserStore for TimeoutStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.bounded("find_by_id", self.inner.find_by_id(id)).await
    }

    async fn find_by_login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, StoreError> {
        self.bounded("find_by_login", self.inner.find_by_login(username, email))
            .await
    }

    async fn exists(&self, username: &str, email: &str) -> Result<bool, StoreError> {
        self.bounded("exists", self.inner.exists(username, email)).await
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        self.bounded("create", self.inner.create(new)).await
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), StoreError> {
        self.bounded("set_refresh_token", self.inner.set_refresh_token(id, token))
            .await
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "rotate_refresh_token",
            self.inner.rotate_refresh_token(id, expected, next),
        )
        .await
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError> {
        self.bounded("set_password_hash", self.inner.set_password_hash(id, hash))
            .await
    }

    async fn update_details(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        self.bounded("update_details", self.inner.update_details(id, full_name, email))
            .await
    }

    async fn set_avatar(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
        self.bounded("set_avatar", self.inner.set_avatar(id, url)).await
    }

    async fn set_cover_image(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
        self.bounded("set_cover_image", self.inner.set_cover_image(id, url))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::memory::MemoryUserStore;

    #[tokio::test]
    async fn slow_store_times_out_as_unavailable() {
        let slow = Arc::new(MemoryUserStore::with_latency(Duration::from_millis(200)));
        let store = TimeoutStore::new(slow, Duration::from_millis(20));

        let err = store.find_by_id(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(matches!(AppError::from(err), AppError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn fast_store_passes_through() {
        let store = TimeoutStore::new(Arc::new(MemoryUserStore::new()), Duration::from_secs(1));
        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn duplicate_maps_to_conflict() {
        let err = AppError::from(StoreError::Duplicate("username"));
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn pool_timeout_maps_to_unavailable() {
        let err = AppError::from(StoreError::Database(sqlx::Error::PoolTimedOut));
        assert!(matches!(err, AppError::StoreUnavailable(_)));
    }
}
