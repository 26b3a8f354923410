use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use super::dto::{RegisterForm, UpdateAccountRequest};
use crate::{
    auth::{
        password::{hash_password, MIN_PASSWORD_LEN},
        AuthUser,
    },
    error::AppError,
    media::{self, MediaKind, UploadItem},
    state::AppState,
    users::{NewUser, PublicUser},
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalized_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        warn!(%email, "invalid email");
        return Err(AppError::validation("Invalid email"));
    }
    Ok(email)
}

/// Create an account. The existence check is advisory; the store's unique
/// constraint decides races, and uploaded media is removed when creation fails.
#[instrument(skip(st, form), fields(username = %form.username))]
pub async fn register(st: &AppState, form: RegisterForm) -> Result<PublicUser, AppError> {
    let full_name = form.full_name.trim().to_string();
    let username = form.username.trim().to_lowercase();
    if [&full_name, &username, &form.email, &form.password]
        .iter()
        .any(|f| f.trim().is_empty())
    {
        return Err(AppError::validation("All fields are required"));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(AppError::validation("Username must not contain spaces"));
    }
    let email = normalized_email(&form.email)?;
    if form.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation("Password too short"));
    }

    if st.users.exists(&username, &email).await? {
        warn!(%username, %email, "username or email already registered");
        return Err(AppError::conflict("User with email or username already exists"));
    }

    let avatar_item = form
        .avatar
        .ok_or_else(|| AppError::validation("Avatar file is required"))?;
    let avatar = media::upload_image(st, MediaKind::Avatar, avatar_item).await?;

    let cover_image = match form.cover_image {
        Some(item) => match media::upload_image(st, MediaKind::CoverImage, item).await {
            Ok(url) => Some(url),
            Err(e) => {
                media::discard(st, &avatar).await;
                return Err(e);
            }
        },
        None => None,
    };

    let created = async {
        let password_hash = hash_password(&form.password)?;
        let user = st
            .users
            .create(NewUser {
                username,
                email,
                full_name,
                avatar: avatar.clone(),
                cover_image: cover_image.clone(),
                password_hash,
            })
            .await?;
        Ok::<_, AppError>(user)
    }
    .await;

    match created {
        Ok(user) => {
            info!(user_id = %user.id, "user registered");
            Ok(user.into())
        }
        Err(e) => {
            media::discard(st, &avatar).await;
            if let Some(url) = &cover_image {
                media::discard(st, url).await;
            }
            Err(e)
        }
    }
}

#[instrument(skip(st, auth, input), fields(user_id = %auth.id))]
pub async fn update_details(
    st: &AppState,
    auth: &AuthUser,
    input: UpdateAccountRequest,
) -> Result<PublicUser, AppError> {
    let full_name = input.full_name.trim();
    if full_name.is_empty() || input.email.trim().is_empty() {
        return Err(AppError::validation("All fields are required"));
    }
    let email = normalized_email(&input.email)?;

    let user = st
        .users
        .update_details(auth.id, full_name, &email)
        .await?
        .ok_or(AppError::NotFound)?;
    info!(email_changed = email != auth.email, "account details updated");
    Ok(user.into())
}

/// Replace the avatar; the previous object is deleted once the new URL is stored.
#[instrument(skip(st, auth, item), fields(user_id = %auth.id))]
pub async fn update_avatar(
    st: &AppState,
    auth: &AuthUser,
    item: Option<UploadItem>,
) -> Result<PublicUser, AppError> {
    let item = item.ok_or_else(|| AppError::validation("Avatar file is missing"))?;
    let previous = st.users.find_by_id(auth.id).await?.ok_or(AppError::NotFound)?;

    let url = media::upload_image(st, MediaKind::Avatar, item).await?;
    let updated = match st.users.set_avatar(auth.id, &url).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            media::discard(st, &url).await;
            return Err(AppError::NotFound);
        }
        Err(e) => {
            media::discard(st, &url).await;
            return Err(e.into());
        }
    };

    media::discard(st, &previous.avatar).await;
    info!("avatar updated");
    Ok(updated.into())
}

#[instrument(skip(st, auth, item), fields(user_id = %auth.id))]
pub async fn update_cover_image(
    st: &AppState,
    auth: &AuthUser,
    item: Option<UploadItem>,
) -> Result<PublicUser, AppError> {
    let item = item.ok_or_else(|| AppError::validation("Cover image file is missing"))?;
    let previous = st.users.find_by_id(auth.id).await?.ok_or(AppError::NotFound)?;

    let url = media::upload_image(st, MediaKind::CoverImage, item).await?;
    let updated = match st.users.set_cover_image(auth.id, &url).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            media::discard(st, &url).await;
            return Err(AppError::NotFound);
        }
        Err(e) => {
            media::discard(st, &url).await;
            return Err(e.into());
        }
    };

    if let Some(old) = previous.cover_image {
        media::discard(st, &old).await;
    }
    info!("cover image updated");
    Ok(updated.into())
}
