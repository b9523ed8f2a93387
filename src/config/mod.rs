use crate::cloak::{CloakSettings, OutputFormat, QualityMode, TargetMode};
use crate::models::ModelBridgeConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "facecloak.toml";
pub const ENV_PREFIX: &str = "FACECLOAK_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),
    #[error("Invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Figment(Box::new(e))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub drive: DriveConfig,
    pub queue: QueueConfig,
    pub datastore: DatastoreConfig,
    pub cloak: CloakConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub server: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Public prefix prepended to uploaded keys in published records.
    pub cdn_url: String,
    pub upload_prefix: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            server: "http://localhost:9000".to_string(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: "trix".to_string(),
            cdn_url: String::new(),
            upload_prefix: "processed".to_string(),
        }
    }
}

/// When received messages are deleted from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Delete once the batch's record writes are committed.
    #[default]
    AfterReconcile,
    /// Delete immediately after receipt, before any processing.
    OnReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub url: String,
    pub region: String,
    pub batch_size: usize,
    pub wait_seconds: i32,
    pub visibility_timeout_seconds: i32,
    pub processing_visibility_seconds: i32,
    pub ack_policy: AckPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            region: "us-west-2".to_string(),
            batch_size: 3,
            wait_seconds: 0,
            visibility_timeout_seconds: 30,
            processing_visibility_seconds: 900,
            ack_policy: AckPolicy::AfterReconcile,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreConfig {
    pub base_url: String,
    pub project_id: String,
    pub access_token: String,
    pub users_collection: String,
    pub counter_field: String,
    pub records_collection: String,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            base_url: "https://firestore.googleapis.com/v1".to_string(),
            project_id: String::new(),
            access_token: String::new(),
            users_collection: "users".to_string(),
            counter_field: "unprocessedCount".to_string(),
            records_collection: "trixpix".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloakConfig {
    pub mode: QualityMode,
    pub format: OutputFormat,
    pub target_mode: TargetMode,
    pub max_batch_faces: usize,
    pub margin: f32,
    pub model_dir: PathBuf,
    pub extractors: Vec<String>,
    pub seed: Option<u64>,
    pub bridge: ModelBridgeConfig,
}

impl Default for CloakConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        Self {
            mode: QualityMode::Low,
            format: OutputFormat::Jpeg,
            target_mode: TargetMode::PerFace,
            max_batch_faces: 8,
            margin: 0.7,
            model_dir: home.join(".facecloak"),
            extractors: vec!["high_extract".to_string()],
            seed: None,
            bridge: ModelBridgeConfig::default(),
        }
    }
}

impl CloakConfig {
    pub fn settings(&self) -> CloakSettings {
        CloakSettings {
            mode: self.mode,
            format: self.format,
            target_mode: self.target_mode,
            max_batch_faces: self.max_batch_faces,
            margin: self.margin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Parent of the per-batch staging directories.
    pub work_root: PathBuf,
    pub idle_backoff_seconds: u64,
    pub fetch_concurrency: usize,
    pub fetch_retries: u32,
    pub fetch_retry_delay_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("facecloak"),
            idle_backoff_seconds: 10,
            fetch_concurrency: 5,
            fetch_retries: 10,
            fetch_retry_delay_seconds: 5,
        }
    }
}

impl AppConfig {
    /// Loads `.env`, then layers defaults, the TOML file named by
    /// `FACECLOAK_CONFIG` and `FACECLOAK_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env loaded: {e}");
        }
        let path = std::env::var("FACECLOAK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::from_figment(Self::figment(Path::new(&path)))
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.queue.batch_size) {
            return Err(ConfigError::Invalid {
                key: "queue.batch_size",
                reason: format!("{} is outside 1..=10", self.queue.batch_size),
            });
        }
        if self.cloak.max_batch_faces == 0 {
            return Err(ConfigError::Invalid {
                key: "cloak.max_batch_faces",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.cloak.extractors.is_empty() {
            return Err(ConfigError::Invalid {
                key: "cloak.extractors",
                reason: "at least one extractor is required".to_string(),
            });
        }
        if self.cloak.margin.is_nan() || self.cloak.margin < 0.0 {
            return Err(ConfigError::Invalid {
                key: "cloak.margin",
                reason: format!("{} is negative", self.cloak.margin),
            });
        }
        if self.worker.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "worker.fetch_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Drive endpoint with a scheme, defaulting to plain http.
    pub fn drive_endpoint(&self) -> String {
        let server = &self.drive.server;
        if !server.starts_with("http://") && !server.starts_with("https://") {
            format!("http://{server}")
        } else {
            server.clone()
        }
    }
}
