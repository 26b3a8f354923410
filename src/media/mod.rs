pub mod services;

pub use services::{discard, upload_image, MediaKind, UploadItem};
