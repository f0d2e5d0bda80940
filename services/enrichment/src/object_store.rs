//! S3 access: whole-object reads and presigned links.

use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
#[cfg(test)]
use mockall::automock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// Errors returned when an object cannot be read
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("Transient storage error: {0}")]
    Transient(String),
}

/// Errors returned when a time-limited link cannot be produced
#[derive(Debug, Error)]
pub enum PresignError {
    #[error("Invalid presigning expiry: {0}")]
    InvalidExpiry(String),

    #[error("Failed to presign request: {0}")]
    Signing(String),
}

/// Object content plus the metadata the store reports for it
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Vec<u8>,
    /// Content length reported by the store
    pub declared_size: Option<u64>,
    /// Content type reported by the store
    pub content_type: Option<String>,
}

/// Reads whole objects by bucket and key
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<FetchedObject, FetchError>;
}

/// Issues time-limited download and upload links
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkSigner: Send + Sync {
    async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration)
        -> Result<String, PresignError>;

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        expires_in: Duration,
    ) -> Result<String, PresignError>;
}

/// S3-backed object access for the pipeline and the query API
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store client
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

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
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object store initialized"
        );

        Ok(Self { client })
    }

    /// Simply assert we can list the bucket. Used at startup to fail fast on bad credentials.
    pub async fn ping_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .list_objects_v2()
            .bucket(bucket)
            .max_keys(1)
            .send()
            .await
            .context("Failed to list bucket")?;
        Ok(())
    }
}

#[async_trait]
impl ObjectFetcher for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<FetchedObject, FetchError> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                return Err(FetchError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => {
                error!(error = ?e, "Failed to fetch object from S3");
                return Err(FetchError::Transient(e.to_string()));
            }
        };

        let declared_size = response
            .content_length()
            .and_then(|len| u64::try_from(len).ok());
        let content_type = response.content_type().map(String::from);

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| FetchError::Transient(format!("Failed to read object body: {}", e)))?
            .to_vec();

        debug!(
            size_bytes = bytes.len(),
            declared_size = ?declared_size,
            "Fetched object"
        );

        Ok(FetchedObject {
            bytes,
            declared_size,
            content_type,
        })
    }
}

#[async_trait]
impl LinkSigner for S3ObjectStore {
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, PresignError> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| PresignError::InvalidExpiry(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| PresignError::Signing(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        expires_in: Duration,
    ) -> Result<String, PresignError> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| PresignError::InvalidExpiry(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type)
            .presigned(presigning_config)
            .await
            .map_err(|e| PresignError::Signing(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}
