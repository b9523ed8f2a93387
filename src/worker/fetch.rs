//! Concurrent download of job photos into a per-batch staging directory.

use super::drive::BlobStore;
use super::queue::Job;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("No object key in image URL {0}")]
    InvalidUrl(String),
    #[error("Gave up on {key} after {attempts} attempts")]
    Exhausted { key: String, attempts: u32 },
    #[error("Cannot stage {key}: {source}")]
    Staging { key: String, source: std::io::Error },
}

/// Uniquely named directory owned by one in-flight batch.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub async fn create(work_root: &Path) -> std::io::Result<Self> {
        let path = work_root.join(uuid::Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the photo of the job at `index` in the batch lands. Each job
    /// gets its own subdirectory so equal file names never collide.
    pub fn local_path(&self, index: usize, job: &Job) -> Option<PathBuf> {
        job.file_name().map(|name| self.path.join(index.to_string()).join(name))
    }

    pub async fn remove(self) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(&self.path).await
    }
}

pub struct FetchPool {
    drive: Arc<dyn BlobStore>,
    concurrency: usize,
    attempts: u32,
    retry_delay: Duration,
}

impl FetchPool {
    pub fn new(drive: Arc<dyn BlobStore>, concurrency: usize, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            drive,
            concurrency: concurrency.max(1),
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    /// Fetches every job's photo with at most `concurrency` downloads in
    /// flight. Returns once all of them have settled, one result per job in
    /// job order.
    pub async fn fetch_all(&self, staging: &StagingDir, jobs: &[Job]) -> Vec<Result<PathBuf, FetchError>> {
        let results: Vec<Result<PathBuf, FetchError>> = stream::iter(jobs.iter().enumerate())
            .map(|(index, job)| self.fetch_one(staging, index, job))
            .buffered(self.concurrency)
            .collect()
            .await;

        let fetched = results.iter().filter(|r| r.is_ok()).count();
        info!("Fetched {fetched} of {} file(s)", jobs.len());
        results
    }

    async fn fetch_one(&self, staging: &StagingDir, index: usize, job: &Job) -> Result<PathBuf, FetchError> {
        let (Some(key), Some(dest)) = (job.object_key(), staging.local_path(index, job)) else {
            warn!("Cannot derive object key from {}", job.image_url);
            return Err(FetchError::InvalidUrl(job.image_url.clone()));
        };
        if let Some(parent) = dest.parent() {
            if let Err(source) = tokio::fs::create_dir_all(parent).await {
                return Err(FetchError::Staging { key, source });
            }
        }

        for attempt in 1..=self.attempts {
            match self.drive.get_to_file(&key, &dest).await {
                Ok(()) => return Ok(dest),
                Err(e) => {
                    warn!("Fetch attempt {attempt}/{} for {key} failed: {e}", self.attempts);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        // A partial write must not look like a fetched photo.
        if let Err(e) = tokio::fs::remove_file(&dest).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove partial download {}: {e}", dest.display());
            }
        }
        Err(FetchError::Exhausted {
            key,
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util::{job, FakeDrive};

    #[tokio::test(start_paused = true)]
    async fn test_missing_object_exhausts_retries() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let staging = StagingDir::create(root.path()).await?;
        let drive = Arc::new(FakeDrive::default());
        drive.insert("u1/a.jpg", b"a".to_vec());

        let pool = FetchPool::new(drive.clone(), 5, 10, Duration::from_secs(5));
        let jobs = vec![job("u1", "https://cdn/x/u1/a.jpg"), job("u2", "https://cdn/x/u2/b.jpg")];
        let started = tokio::time::Instant::now();
        let results = pool.fetch_all(&staging, &jobs).await;

        assert!(results[0].as_ref().is_ok_and(|p| p.exists()));
        assert!(matches!(
            results[1],
            Err(FetchError::Exhausted { attempts: 10, .. })
        ));
        assert_eq!(drive.download_attempts("u2/b.jpg"), 10);
        assert!(started.elapsed() >= Duration::from_secs(45));
        assert!(staging.local_path(1, &jobs[1]).is_some_and(|p| !p.exists()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_file_name_for_two_users() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let staging = StagingDir::create(root.path()).await?;
        let drive = Arc::new(FakeDrive::default());
        drive.insert("u1/a.png", b"first".to_vec());
        drive.insert("u3/a.png", b"third".to_vec());

        let pool = FetchPool::new(drive, 5, 3, Duration::from_secs(1));
        let jobs = vec![
            job("u1", "https://cdn/x/u1/a.png"),
            job("u2", "https://cdn/x/u2/a.png"),
            job("u3", "https://cdn/x/u3/a.png"),
        ];
        let results = pool.fetch_all(&staging, &jobs).await;

        let first = results[0].as_ref().map_err(|e| e.to_string())?;
        let third = results[2].as_ref().map_err(|e| e.to_string())?;
        assert_ne!(first, third);
        assert!(results[1].is_err());
        assert_eq!(std::fs::read(first)?, b"first");
        assert_eq!(std::fs::read(third)?, b"third");
        Ok(())
    }

    #[tokio::test]
    async fn test_staging_dirs_are_unique_and_removable() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let a = StagingDir::create(root.path()).await?;
        let b = StagingDir::create(root.path()).await?;
        assert_ne!(a.path(), b.path());

        let kept = a.path().to_path_buf();
        std::fs::write(kept.join("x.jpg"), b"x")?;
        a.remove().await?;
        assert!(!kept.exists());
        assert!(b.path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_url_without_key_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let staging = StagingDir::create(root.path()).await?;
        let pool = FetchPool::new(Arc::new(FakeDrive::default()), 5, 3, Duration::ZERO);
        let results = pool.fetch_all(&staging, &[job("u1", "a.jpg")]).await;
        assert!(matches!(results[0], Err(FetchError::InvalidUrl(_))));
        Ok(())
    }
}
