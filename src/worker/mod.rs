//! The queue-driven cloaking loop.
//!
//! One batch at a time: receive, fetch, cloak, reconcile, commit. Only the
//! fetch phase runs concurrently, and it completes before cloaking starts.

pub mod datastore;
pub mod drive;
pub mod fetch;
pub mod queue;
pub mod sink;

pub use datastore::{DatastoreError, DocumentStore, FirestoreStore, StagedDocument, WriteBatch};
pub use drive::{BlobStore, DriveError};
pub use fetch::{FetchError, FetchPool, StagingDir};
pub use queue::{Job, JobBatch, JobSource, MessageQueue, QueueError, QueueMessage, VisibilityLease};
pub use sink::{JobOutcome, ReconcileSummary, ResultSink, SinkError};

use crate::cloak::{CloakError, CloakPipeline, CloakService};
use crate::config::WorkerConfig;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("Staging directory error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum BatchOutcome {
    /// The queue had nothing to hand out.
    Idle,
    Processed(ReconcileSummary),
}

pub struct Worker {
    source: JobSource,
    fetch: FetchPool,
    pipeline: CloakPipeline,
    service: Arc<CloakService>,
    sink: ResultSink,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        source: JobSource,
        fetch: FetchPool,
        pipeline: CloakPipeline,
        service: Arc<CloakService>,
        sink: ResultSink,
        config: WorkerConfig,
    ) -> Self {
        Self {
            source,
            fetch,
            pipeline,
            service,
            sink,
            config,
        }
    }

    /// Polls forever. Returns only on an infrastructure error.
    pub async fn run(&self) -> Result<(), WorkerError> {
        loop {
            if let BatchOutcome::Idle = self.run_once().await? {
                info!(
                    "No messages in queue, waiting {} seconds",
                    self.config.idle_backoff_seconds
                );
                tokio::time::sleep(Duration::from_secs(self.config.idle_backoff_seconds)).await;
            }
        }
    }

    pub async fn run_once(&self) -> Result<BatchOutcome, WorkerError> {
        let batch = self.source.receive_batch().await?;
        if batch.is_empty() {
            return Ok(BatchOutcome::Idle);
        }
        let lease = self.source.hold(&batch);

        let staging = StagingDir::create(&self.config.work_root).await?;
        let fetched: Vec<PathBuf> = self
            .fetch
            .fetch_all(&staging, &batch.jobs)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("{e}");
                    None
                }
            })
            .collect();

        if fetched.is_empty() {
            warn!("Nothing fetched for this batch");
        } else {
            match self.pipeline.run(&self.service, &fetched).await {
                Ok(report) => info!("Cloaking produced {} output(s)", report.outputs.len()),
                Err(CloakError::FaceNotFound) => info!("No faces found in batch"),
                Err(e) if e.is_benign() => info!("{e}"),
                Err(e) => error!("Cloaking failed, reconciling without outputs: {e}"),
            }
        }

        let settings = self.pipeline.settings();
        let summary = self
            .sink
            .reconcile(&batch.jobs, &staging, settings.mode, settings.format)
            .await?;
        drop(lease);
        self.source.acknowledge(&batch).await?;

        if let Err(e) = staging.remove().await {
            warn!("Could not remove staging directory: {e}");
        }
        Ok(BatchOutcome::Processed(summary))
    }
}
