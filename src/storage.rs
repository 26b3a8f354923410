use anyhow::Context;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use axum::async_trait;
use bytes::Bytes;

use crate::config::MediaConfig;

/// External media host. Objects are addressed by key and served from a public URL.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
    fn public_url(&self, key: &str) -> String;

    /// Inverse of [`StorageClient::public_url`]; `None` for URLs this store did not produce.
    fn key_for_url(&self, url: &str) -> Option<String>;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
    public_url: String,
}

impl Storage {
    pub async fn new(cfg: &MediaConfig) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(Credentials::new(
                &cfg.access_key,
                &cfg.secret_key,
                None,
                None,
                "static",
            ))
            .endpoint_url(&cfg.endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(&cfg.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
            public_url: cfg.public_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StorageClient for Storage {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("s3 put_object")?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_url, key)
    }

    fn key_for_url(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.public_url)?
            .strip_prefix('/')
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }
}
