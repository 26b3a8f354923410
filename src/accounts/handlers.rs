use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::{patch, post},
    Json, Router,
};
use tracing::{instrument, warn};

use super::{
    dto::{RegisterForm, UpdateAccountRequest},
    services,
};
use crate::{auth::AuthUser, error::AppError, media::UploadItem, state::AppState, users::PublicUser};

const UPLOAD_LIMIT: usize = 10 * 1024 * 1024; // 10MB

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/users/register", post(register))
        .route("/users/update-account", patch(update_account))
        .route("/users/avatar", patch(update_avatar))
        .route("/users/cover-image", patch(update_cover_image))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
}

fn bad_multipart(e: impl std::fmt::Display) -> AppError {
    warn!(error = %e, "malformed multipart body");
    AppError::validation("Malformed multipart body")
}

async fn read_file(field: axum::extract::multipart::Field<'_>) -> Result<UploadItem, AppError> {
    let content_type = field
        .content_type()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "application/octet-stream".into());
    let body = field.bytes().await.map_err(bad_multipart)?;
    Ok(UploadItem { body, content_type })
}

/// Pull the single file field `name` out of a multipart body; other fields are ignored.
async fn read_single_file(mut mp: Multipart, name: &str) -> Result<Option<UploadItem>, AppError> {
    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        if field.name() == Some(name) {
            return Ok(Some(read_file(field).await?));
        }
    }
    Ok(None)
}

/// POST /users/register (multipart)
/// Fields: fullName, email, username, password; files: avatar (required), coverImage.
#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mut mp: Multipart,
) -> Result<(StatusCode, Json<PublicUser>), AppError> {
    let mut form = RegisterForm::default();
    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fullName" => form.full_name = field.text().await.map_err(bad_multipart)?,
            "email" => form.email = field.text().await.map_err(bad_multipart)?,
            "username" => form.username = field.text().await.map_err(bad_multipart)?,
            "password" => form.password = field.text().await.map_err(bad_multipart)?,
            "avatar" => form.avatar = Some(read_file(field).await?),
            "coverImage" => form.cover_image = Some(read_file(field).await?),
            _ => {}
        }
    }

    let user = services::register(&state, form).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, auth, payload), fields(user_id = %auth.id, username = %auth.username))]
pub async fn update_account(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<PublicUser>, AppError> {
    Ok(Json(services::update_details(&state, &auth, payload).await?))
}

#[instrument(skip(state, auth, mp), fields(user_id = %auth.id, username = %auth.username))]
pub async fn update_avatar(
    State(state): State<AppState>,
    auth: AuthUser,
    mp: Multipart,
) -> Result<Json<PublicUser>, AppError> {
    let item = read_single_file(mp, "avatar").await?;
    Ok(Json(services::update_avatar(&state, &auth, item).await?))
}

#[instrument(skip(state, auth, mp), fields(user_id = %auth.id, username = %auth.username))]
pub async fn update_cover_image(
    State(state): State<AppState>,
    auth: AuthUser,
    mp: Multipart,
) -> Result<Json<PublicUser>, AppError> {
    let item = read_single_file(mp, "coverImage").await?;
    Ok(Json(services::update_cover_image(&state, &auth, item).await?))
}
