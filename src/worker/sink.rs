//! Per-job reconciliation of cloaking outcomes against storage and records.

use super::datastore::{DatastoreError, DocumentStore, WriteBatch};
use super::drive::{BlobStore, DriveError};
use super::fetch::StagingDir;
use super::queue::Job;
use crate::cloak::{output_path, OutputFormat, QualityMode};
use crate::config::{DatastoreConfig, DriveConfig};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

/// What happened to one job during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Cloaked output uploaded under this key.
    Published { key: String },
    /// No output; the record keeps the original image.
    Degraded,
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub outcomes: Vec<JobOutcome>,
    pub records: usize,
}

impl ReconcileSummary {
    pub fn published(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Published { .. }))
            .count()
    }
}

pub struct ResultSink {
    drive: Arc<dyn BlobStore>,
    store: Arc<dyn DocumentStore>,
    drive_config: DriveConfig,
    datastore_config: DatastoreConfig,
}

impl ResultSink {
    pub fn new(
        drive: Arc<dyn BlobStore>,
        store: Arc<dyn DocumentStore>,
        drive_config: DriveConfig,
        datastore_config: DatastoreConfig,
    ) -> Self {
        Self {
            drive,
            store,
            drive_config,
            datastore_config,
        }
    }

    /// Stages exactly one record per job and commits them as one batch.
    /// Counters are decremented and outputs uploaded only for jobs whose
    /// cloaked file exists.
    pub async fn reconcile(
        &self,
        jobs: &[Job],
        staging: &StagingDir,
        mode: QualityMode,
        format: OutputFormat,
    ) -> Result<ReconcileSummary, SinkError> {
        let mut batch = WriteBatch::new();
        let mut summary = ReconcileSummary::default();

        for (index, job) in jobs.iter().enumerate() {
            let output = staging
                .local_path(index, job)
                .map(|p| output_path(&p, mode, format))
                .filter(|p| p.is_file());

            let mut record = job.body.clone();
            let outcome = match (output, job.object_key()) {
                (Some(output), Some(object_key)) => {
                    self.store
                        .increment(
                            &self.datastore_config.users_collection,
                            &job.uid,
                            &self.datastore_config.counter_field,
                            -1,
                        )
                        .await?;

                    let key = format!("{}/{object_key}", self.drive_config.upload_prefix);
                    self.drive.put_from_file(&key, &output).await?;

                    record.insert("unalteredImageUrl".to_string(), Value::String(job.image_url.clone()));
                    record.insert(
                        "imageUrl".to_string(),
                        Value::String(format!("{}{key}", self.drive_config.cdn_url)),
                    );
                    info!("Published {key} for user {}", job.uid);
                    JobOutcome::Published { key }
                }
                _ => {
                    warn!("No cloaked output for {}, keeping original", job.image_url);
                    record.insert("unalteredImageUrl".to_string(), Value::String(job.image_url.clone()));
                    JobOutcome::Degraded
                }
            };

            batch.create(&self.datastore_config.records_collection, record);
            summary.outcomes.push(outcome);
        }

        summary.records = batch.len();
        self.store.commit(batch).await?;
        info!(
            "Reconciled {} job(s): {} published, {} record(s) committed",
            jobs.len(),
            summary.published(),
            summary.records
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util::{job, FakeDrive, FakeStore};

    fn sink(drive: Arc<FakeDrive>, store: Arc<FakeStore>) -> ResultSink {
        ResultSink::new(
            drive,
            store,
            DriveConfig {
                cdn_url: "https://cdn.example.com/".to_string(),
                ..Default::default()
            },
            DatastoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_published_and_degraded_records() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let staging = StagingDir::create(root.path()).await?;
        std::fs::create_dir_all(staging.path().join("0"))?;
        std::fs::write(staging.path().join("0").join("a_low_cloaked.jpeg"), b"cloaked")?;

        let drive = Arc::new(FakeDrive::default());
        let store = Arc::new(FakeStore::default());
        let jobs = vec![
            job("u1", "https://cdn/x/u1/a.jpg"),
            job("u2", "https://cdn/x/u2/b.jpg"),
        ];

        let summary = sink(drive.clone(), store.clone())
            .reconcile(&jobs, &staging, QualityMode::Low, OutputFormat::Jpeg)
            .await?;

        assert_eq!(summary.records, 2);
        assert_eq!(
            summary.outcomes,
            vec![
                JobOutcome::Published { key: "processed/u1/a.jpg".to_string() },
                JobOutcome::Degraded
            ]
        );
        assert_eq!(store.counter("users", "u1"), -1);
        assert_eq!(store.counter("users", "u2"), 0);
        assert_eq!(drive.uploaded(), vec!["processed/u1/a.jpg".to_string()]);

        let records = store.committed();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields["imageUrl"], "https://cdn.example.com/processed/u1/a.jpg");
        assert_eq!(records[0].fields["unalteredImageUrl"], "https://cdn/x/u1/a.jpg");
        assert_eq!(records[1].fields["imageUrl"], "https://cdn/x/u2/b.jpg");
        assert_eq!(records[1].fields["unalteredImageUrl"], "https://cdn/x/u2/b.jpg");
        assert!(records.iter().all(|r| r.collection == "trixpix"));
        Ok(())
    }

    #[tokio::test]
    async fn test_same_file_name_keeps_outputs_apart() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let staging = StagingDir::create(root.path()).await?;
        let jobs = vec![
            job("u1", "https://cdn/x/u1/a.png"),
            job("u2", "https://cdn/x/u2/a.png"),
        ];
        for (index, bytes) in [(0, b"one"), (1, b"two")] {
            let output = staging
                .local_path(index, &jobs[index])
                .map(|p| output_path(&p, QualityMode::Low, OutputFormat::Png))
                .ok_or("no local path")?;
            std::fs::create_dir_all(output.parent().ok_or("no parent")?)?;
            std::fs::write(output, bytes)?;
        }

        let drive = Arc::new(FakeDrive::default());
        let store = Arc::new(FakeStore::default());
        let summary = sink(drive.clone(), store.clone())
            .reconcile(&jobs, &staging, QualityMode::Low, OutputFormat::Png)
            .await?;

        assert_eq!(summary.published(), 2);
        assert_eq!(drive.object("processed/u1/a.png"), Some(b"one".to_vec()));
        assert_eq!(drive.object("processed/u2/a.png"), Some(b"two".to_vec()));
        let records = store.committed();
        assert_eq!(records[0].fields["imageUrl"], "https://cdn.example.com/processed/u1/a.png");
        assert_eq!(records[1].fields["imageUrl"], "https://cdn.example.com/processed/u2/a.png");
        Ok(())
    }
}
