use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_types::SdkConfig;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Object storage for rendered images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key` in `bucket`
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;

    /// Mint a time-limited GET URL for an object
    async fn presigned_get_url(&self, bucket: &str, key: &str, expires_in: Duration)
        -> Result<String>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store from the shared SDK configuration
    pub fn new(sdk_config: &SdkConfig, config: &S3Config) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            force_path_style = config.force_path_style,
            "S3 object store initialized"
        );

        Self { client }
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload QR code to S3")?;

        debug!(bucket = %bucket, key = %key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String> {
        let presigning_config =
            PresigningConfig::expires_in(expires_in).context("Failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned.uri().to_string())
    }
}

/// Build the `s3://bucket/key` locator for an object
pub fn s3_uri(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}
