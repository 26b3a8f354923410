use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the credential store.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,              // lowercase, unique
    pub email: String,                 // lowercase, unique
    pub full_name: String,
    pub avatar: String,                // public media URL
    pub cover_image: Option<String>,   // public media URL
    pub password_hash: String,         // Argon2 PHC string
    pub refresh_token: Option<String>, // the single live refresh token
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields needed to insert a user. Username and email must already be normalized.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub password_hash: String,
}

/// User as returned to clients: no password hash, no refresh token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            email: u.email,
            full_name: u.full_name,
            avatar: u.avatar,
            cover_image: u.cover_image,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}
