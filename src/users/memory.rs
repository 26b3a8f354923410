use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    repo_types::{NewUser, User},
    store::{StoreError, UserStore},
};

/// In-process user store. Uniqueness and refresh rotation are checked under the
/// write lock, so it gives the same guarantees as the Postgres constraints.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
    latency: Option<Duration>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` first; used to exercise store timeouts.
    #[cfg(test)]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            users: RwLock::default(),
            latency: Some(latency),
        }
    }

    async fn pause(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    async fn modify<F>(&self, id: Uuid, f: F) -> Option<User>
    where
        F: FnOnce(&mut User) + Send,
    {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id)?;
        f(user);
        user.updated_at = OffsetDateTime::now_utc();
        Some(user.clone())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.pause().await;
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, StoreError> {
        self.pause().await;
        let users = self.users.read().await;
        let by_name = username.and_then(|n| users.values().find(|u| u.username == n));
        let by_email = || email.and_then(|e| users.values().find(|u| u.email == e));
        Ok(by_name.or_else(by_email).cloned())
    }

    async fn exists(&self, username: &str, email: &str) -> Result<bool, StoreError> {
        self.pause().await;
        let users = self.users.read().await;
        Ok(users
            .values()
            .any(|u| u.username == username || u.email == email))
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        self.pause().await;
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == new.username) {
            return Err(StoreError::Duplicate("username"));
        }
        if users.values().any(|u| u.email == new.email) {
            return Err(StoreError::Duplicate("email"));
        }

        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            username: new.username,
            email: new.email,
            full_name: new.full_name,
            avatar: new.avatar,
            cover_image: new.cover_image,
            password_hash: new.password_hash,
            refresh_token: None,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), StoreError> {
        self.pause().await;
        let token = token.map(str::to_owned);
        self.modify(id, |u| u.refresh_token = token).await;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> Result<bool, StoreError> {
        self.pause().await;
        let mut users = self.users.write().await;
        match users.get_mut(&id) {
            Some(u) if u.refresh_token.as_deref() == Some(expected) => {
                u.refresh_token = Some(next.to_owned());
                u.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError> {
        self.pause().await;
        let hash = hash.to_owned();
        self.modify(id, |u| u.password_hash = hash).await;
        Ok(())
    }

    async fn update_details(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        self.pause().await;
        let mut users = self.users.write().await;
        if users.values().any(|u| u.id != id && u.email == email) {
            return Err(StoreError::Duplicate("email"));
        }
        Ok(users.get_mut(&id).map(|u| {
            u.full_name = full_name.to_owned();
            u.email = email.to_owned();
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }

    async fn set_avatar(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
        self.pause().await;
        let url = url.to_owned();
        Ok(self.modify(id, |u| u.avatar = url).await)
    }

    async fn set_cover_image(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
        self.pause().await;
        let url = url.to_owned();
        Ok(self.modify(id, |u| u.cover_image = Some(url)).await)
    }
}
