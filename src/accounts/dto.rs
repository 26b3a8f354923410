use serde::Deserialize;

use crate::media::UploadItem;

/// Parsed `multipart/form-data` registration body.
#[derive(Default)]
pub struct RegisterForm {
    pub full_name: String,
    pub email: String,
    pub username: String,
    pub password: String,
    pub avatar: Option<UploadItem>,
    pub cover_image: Option<UploadItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
}
