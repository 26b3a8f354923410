use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

pub struct UploadItem {
    pub body: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Avatar,
    CoverImage,
}

impl MediaKind {
    fn prefix(self) -> &'static str {
        match self {
            MediaKind::Avatar => "avatars",
            MediaKind::CoverImage => "covers",
        }
    }
}

/// Upload one image and return the URL it is served from.
pub async fn upload_image(
    st: &AppState,
    kind: MediaKind,
    item: UploadItem,
) -> Result<String, AppError> {
    if item.body.is_empty() {
        return Err(AppError::validation("Uploaded file is empty"));
    }
    let ext = ext_from_mime(&item.content_type)
        .ok_or_else(|| AppError::validation("Unsupported image type"))?;

    let key = format!("{}/{}.{}", kind.prefix(), Uuid::new_v4(), ext);
    st.storage
        .put_object(&key, item.body, &item.content_type)
        .await
        .map_err(|e| AppError::StoreUnavailable(format!("media upload {}: {:#}", key, e)))?;

    debug!(%key, ?kind, "media uploaded");
    Ok(st.storage.public_url(&key))
}

/// Best-effort removal of a previously uploaded object. Foreign URLs are left alone.
pub async fn discard(st: &AppState, url: &str) {
    let Some(key) = st.storage.key_for_url(url) else {
        return;
    };
    if let Err(e) = st.storage.delete_object(&key).await {
        warn!(error = %e, %key, "failed to delete media object");
    }
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
