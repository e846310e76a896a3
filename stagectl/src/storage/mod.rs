//! Where finished images end up.
//!
//! Storage runs only after the provider reported success. A storage failure
//! fails the job exactly like a provider failure would.

use crate::{config::StorageConfig, errors::Error};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("storage returned {status} for {key}")]
    Status { status: u16, key: String },

    #[error("artifact download returned {status}")]
    Download { status: u16 },
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage { message: err.to_string() }
    }
}

#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Upload `bytes` under `key`, returning the public URL
    async fn store(&self, key: &str, bytes: Bytes) -> Result<String, StorageError>;

    /// Copy the provider's result into our own storage, returning the public URL
    async fn persist(&self, key: &str, result_url: &str) -> Result<String, StorageError>;
}

/// Bucket-style object storage: `PUT {base}/object/{bucket}/{key}`, served
/// from `{base}/object/public/{bucket}/{key}`.
#[derive(Clone)]
pub struct HttpArtifactStorage {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
    api_key: Option<String>,
}

impl HttpArtifactStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.as_str().trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/object/public/{}/{}", self.base_url, self.bucket, key)
    }
}

#[async_trait]
impl ArtifactStorage for HttpArtifactStorage {
    #[instrument(skip(self, bytes), fields(size = bytes.len()), err)]
    async fn store(&self, key: &str, bytes: Bytes) -> Result<String, StorageError> {
        let mut request = self
            .http
            .put(format!("{}/object/{}/{}", self.base_url, self.bucket, key))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {api_key}"));
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(StorageError::Status {
                status: resp.status().as_u16(),
                key: key.to_string(),
            });
        }
        Ok(self.public_url(key))
    }

    async fn persist(&self, key: &str, result_url: &str) -> Result<String, StorageError> {
        let resp = self.http.get(result_url).send().await?;
        if !resp.status().is_success() {
            return Err(StorageError::Download {
                status: resp.status().as_u16(),
            });
        }
        let bytes = resp.bytes().await?;
        debug!(key, size = bytes.len(), "Downloaded provider artifact");
        self.store(key, bytes).await
    }
}

/// Keeps the provider-hosted URL as the final artifact. Used when no bucket
/// is configured.
#[derive(Clone, Copy, Default)]
pub struct PassthroughStorage;

#[async_trait]
impl ArtifactStorage for PassthroughStorage {
    async fn store(&self, key: &str, _bytes: Bytes) -> Result<String, StorageError> {
        Err(StorageError::Status {
            status: 501,
            key: key.to_string(),
        })
    }

    async fn persist(&self, _key: &str, result_url: &str) -> Result<String, StorageError> {
        Ok(result_url.to_string())
    }
}

/// Object key for one attempt's output
pub fn artifact_key(user_id: uuid::Uuid, job_id: uuid::Uuid, attempt: i32) -> String {
    format!("{user_id}/{job_id}/attempt-{attempt}.png")
}
