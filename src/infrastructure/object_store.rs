// Object storage boundary - durable home for uploaded images when configured

use async_trait::async_trait;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as _, PutPayload};
use std::sync::Arc;
use tracing::info;

use crate::config::ObjectStoreConfig;
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return the public URL for it
    async fn put(&self, key: &str, bytes: Vec<u8>) -> AppResult<String>;

    async fn delete(&self, key: &str) -> AppResult<()>;
}

/// S3-compatible bucket addressed path-style as `{endpoint}/{bucket}/{key}`,
/// with every request SigV4-signed for the configured region
pub struct S3ObjectStore {
    client: AmazonS3,
    bucket_access_url: String,
}

impl S3ObjectStore {
    pub fn from_config(config: &ObjectStoreConfig) -> AppResult<Self> {
        let required = [
            ("S3_ENDPOINT_URL", &config.endpoint_url),
            ("S3_BUCKET_NAME", &config.bucket_name),
            ("S3_BUCKET_ACCESS_URL", &config.bucket_access_url),
            ("S3_ACCESS_KEY_ID", &config.access_key_id),
            ("S3_SECRET_ACCESS_KEY", &config.secret_access_key),
            ("S3_REGION", &config.region),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(AppError::ConfigurationError(format!(
                "Set {} environment variable",
                name
            )));
        }

        let client = AmazonS3Builder::new()
            .with_endpoint(config.endpoint_url.trim_end_matches('/'))
            .with_region(&config.region)
            .with_bucket_name(&config.bucket_name)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(true)
            .build()
            .map_err(|e| AppError::ConfigurationError(format!("Invalid S3 settings: {}", e)))?;

        Ok(Self {
            client,
            bucket_access_url: config.bucket_access_url.clone(),
        })
    }
}

/// Public URL of an object: the access URL joined with the key
pub fn public_url(bucket_access_url: &str, key: &str) -> String {
    format!("{}/{}", bucket_access_url.trim_end_matches('/'), key.trim_start_matches('/'))
}

// A missing bucket is a deployment mistake, not a transient fault
fn storage_error(action: &str, key: &str, err: object_store::Error) -> AppError {
    match err {
        object_store::Error::NotFound { .. } => AppError::ConfigurationError(format!(
            "Object store {} of '{}' found no bucket; check S3_* settings",
            action, key
        )),
        other => AppError::Internal(format!("Object store {} of '{}' failed: {}", action, key, other)),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> AppResult<String> {
        let size = bytes.len();
        self.client
            .put(&ObjectPath::from(key), PutPayload::from(bytes))
            .await
            .map_err(|e| storage_error("upload", key, e))?;

        info!("Stored {} bytes as object '{}'", size, key);
        Ok(public_url(&self.bucket_access_url, key))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        match self.client.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(storage_error("delete", key, e)),
        }
    }
}

/// Build the configured store, or `None` when object storage is disabled
pub fn object_store_from_config(
    config: Option<&ObjectStoreConfig>,
) -> AppResult<Option<Arc<dyn ObjectStore>>> {
    match config {
        Some(cfg) => {
            let store = S3ObjectStore::from_config(cfg)?;
            info!(
                "Object storage enabled: bucket '{}' at {} ({})",
                cfg.bucket_name, cfg.endpoint_url, cfg.region
            );
            Ok(Some(Arc::new(store)))
        }
        None => Ok(None),
    }
}
