//! Blob storage for source photos and cloaked outputs.

use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("Failed to download {key}: {reason}")]
    Download { key: String, reason: String },
    #[error("Failed to upload {key}: {reason}")]
    Upload { key: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), DriveError>;

    async fn put_from_file(&self, key: &str, src: &Path) -> Result<(), DriveError>;
}

#[cfg(feature = "drive")]
pub use s3::S3Drive;

#[cfg(feature = "drive")]
mod s3 {
    use super::{BlobStore, DriveError};
    use crate::config::AppConfig;
    use async_trait::async_trait;
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::config::Builder as S3ConfigBuilder;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client as S3Client;
    use std::path::Path;

    pub struct S3Drive {
        client: S3Client,
        bucket: String,
    }

    impl S3Drive {
        pub async fn connect(config: &AppConfig) -> Self {
            let endpoint = config.drive_endpoint();
            let base_config = aws_config::defaults(BehaviorVersion::latest())
                .endpoint_url(endpoint)
                .region(aws_config::Region::new(config.drive.region.clone()))
                .credentials_provider(aws_sdk_s3::config::Credentials::new(
                    config.drive.access_key.clone(),
                    config.drive.secret_key.clone(),
                    None,
                    None,
                    "static",
                ))
                .load()
                .await;

            let s3_config = S3ConfigBuilder::from(&base_config)
                .force_path_style(true)
                .build();

            Self {
                client: S3Client::from_conf(s3_config),
                bucket: config.drive.bucket.clone(),
            }
        }
    }

    #[async_trait]
    impl BlobStore for S3Drive {
        async fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), DriveError> {
            let download = |reason: String| DriveError::Download {
                key: key.to_string(),
                reason,
            };

            let result = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| download(e.to_string()))?;

            let data = result
                .body
                .collect()
                .await
                .map_err(|e| download(e.to_string()))?;

            tokio::fs::write(dest, data.into_bytes()).await?;
            log::debug!("Downloaded s3://{}/{} to {}", self.bucket, key, dest.display());
            Ok(())
        }

        async fn put_from_file(&self, key: &str, src: &Path) -> Result<(), DriveError> {
            let body = ByteStream::from_path(src).await.map_err(|e| DriveError::Upload {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| DriveError::Upload {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;

            log::info!("Uploaded {} to s3://{}/{}", src.display(), self.bucket, key);
            Ok(())
        }
    }
}
