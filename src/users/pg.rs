use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    repo_types::{NewUser, User},
    store::{StoreError, UserStore},
};

/// Postgres-backed store. Uniqueness comes from `users_username_key` / `users_email_key`.
#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Turn a unique-constraint violation into [`StoreError::Duplicate`].
fn map_unique(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            let field = match db.constraint() {
                Some(c) if c.contains("email") => "email",
                _ => "username",
            };
            return StoreError::Duplicate(field);
        }
    }
    StoreError::Database(e)
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, full_name, avatar, cover_image,
                   password_hash, refresh_token, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, StoreError> {
        // NULL binds never compare equal, so an absent field cannot match.
        // A username match wins over an email match on another row.
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, full_name, avatar, cover_image,
                   password_hash, refresh_token, created_at, updated_at
            FROM users
            WHERE username = $1 OR email = $2
            ORDER BY (username = $1) DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn exists(&self, username: &str, email: &str) -> Result<bool, StoreError> {
        let found: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM users WHERE username = $1 OR email = $2)"#,
        )
        .bind(username)
        .bind(email)
        .fetch_one(&self.db)
        .await?;
        Ok(found)
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, email, full_name, avatar, cover_image, password_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, username, email, full_name, avatar, cover_image,
                      password_hash, refresh_token, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.full_name)
        .bind(&new.avatar)
        .bind(&new.cover_image)
        .bind(&new.password_hash)
        .fetch_one(&self.db)
        .await
        .map_err(map_unique)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1"#)
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        expected: &str,
        next: &str,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET refresh_token = $3, updated_at = now()
             WHERE id = $1 AND refresh_token = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1"#)
            .bind(id)
            .bind(hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn update_details(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
               SET full_name = $2, email = $3, updated_at = now()
             WHERE id = $1
            RETURNING id, username, email, full_name, avatar, cover_image,
                      password_hash, refresh_token, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(full_name)
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .map_err(map_unique)
    }

    async fn set_avatar(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET avatar = $2, updated_at = now()
             WHERE id = $1
            RETURNING id, username, email, full_name, avatar, cover_image,
                      password_hash, refresh_token, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(url)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn set_cover_image(&self, id: Uuid, url: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET cover_image = $2, updated_at = now()
             WHERE id = $1
            RETURNING id, username, email, full_name, avatar, cover_image,
                      password_hash, refresh_token, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(url)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }
}
