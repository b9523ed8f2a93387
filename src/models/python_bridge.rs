use super::{
    CloakOptimizer, FaceAligner, FaceDetection, FeatureExtractor, ImageTensor, ModelError,
    OptimizerParams,
};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

/// Tensor as it crosses the process boundary: base64 of little-endian f32s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireTensor {
    pub shape: [usize; 3],
    pub data: String,
}

impl WireTensor {
    pub fn encode(tensor: &ImageTensor) -> Self {
        let (h, w, c) = tensor.dim();
        let mut bytes = Vec::with_capacity(h * w * c * 4);
        for value in tensor.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            shape: [h, w, c],
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<ImageTensor, ModelError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| ModelError::InvalidTensor(e.to_string()))?;
        let [h, w, c] = self.shape;
        if bytes.len() != h * w * c * 4 {
            return Err(ModelError::InvalidTensor(format!(
                "expected {} bytes for shape {:?}, got {}",
                h * w * c * 4,
                self.shape,
                bytes.len()
            )));
        }
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        ImageTensor::from_shape_vec((h, w, c), values)
            .map_err(|e| ModelError::InvalidTensor(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum BridgeCommand {
    #[serde(rename = "health")]
    Health,
    #[serde(rename = "gpu_available")]
    GpuAvailable,
    #[serde(rename = "detect")]
    Detect { image: WireTensor },
    #[serde(rename = "extract")]
    Extract {
        extractor: String,
        images: Vec<WireTensor>,
    },
    #[serde(rename = "optimize")]
    Optimize {
        crops: Vec<WireTensor>,
        targets: Vec<WireTensor>,
        params: OptimizerParams,
    },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum BridgeResponse {
    #[serde(rename = "success")]
    Success { data: serde_json::Value },
    #[serde(rename = "error")]
    Error { message: String, code: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBridgeConfig {
    pub python_path: String,
    pub script_path: String,
    pub gpu: String,
}

impl Default for ModelBridgeConfig {
    fn default() -> Self {
        Self {
            python_path: "python3".to_string(),
            script_path: "scripts/cloak_models.py".to_string(),
            gpu: "0".to_string(),
        }
    }
}

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Long-lived child process hosting the aligner, the feature extractors and
/// the optimizer. One command is in flight at a time.
pub struct ModelBridge {
    config: ModelBridgeConfig,
    model_dir: PathBuf,
    extractors: Vec<String>,
    process: Mutex<Option<BridgeProcess>>,
}

impl ModelBridge {
    pub fn new(config: ModelBridgeConfig, model_dir: PathBuf, extractors: Vec<String>) -> Self {
        Self {
            config,
            model_dir,
            extractors,
            process: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), ModelError> {
        let mut process_guard = self.process.lock().await;

        if process_guard.is_some() {
            return Ok(());
        }

        let mut child = tokio::process::Command::new(&self.config.python_path)
            .arg(&self.config.script_path)
            .arg("--model-dir")
            .arg(&self.model_dir)
            .arg("--extractors")
            .arg(self.extractors.join(","))
            .arg("--gpu")
            .arg(&self.config.gpu)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ModelError::ProcessSpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ModelError::ProcessSpawnFailed("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ModelError::ProcessSpawnFailed("Failed to capture stdout".to_string()))?;

        *process_guard = Some(BridgeProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });

        drop(process_guard);

        if self.health_check().await.is_err() {
            return Err(ModelError::HealthCheckFailed);
        }

        log::info!(
            "Model bridge started (extractors: {})",
            self.extractors.join(",")
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ModelError> {
        let mut process_guard = self.process.lock().await;

        if let Some(mut process) = process_guard.take() {
            let cmd_json = serde_json::to_string(&BridgeCommand::Shutdown)
                .map_err(|e| ModelError::SerializationError(e.to_string()))?;

            let _ = process.stdin.write_all(format!("{cmd_json}\n").as_bytes()).await;
            let _ = process.stdin.flush().await;

            tokio::time::sleep(std::time::Duration::from_millis(500)).await;

            let _ = process.child.kill().await;
        }

        log::info!("Model bridge stopped");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), ModelError> {
        match self.send_command(&BridgeCommand::Health).await? {
            BridgeResponse::Success { .. } => Ok(()),
            BridgeResponse::Error { message, .. } => {
                log::warn!("Model bridge health check failed: {message}");
                Err(ModelError::HealthCheckFailed)
            }
        }
    }

    pub fn extractor_names(&self) -> &[String] {
        &self.extractors
    }

    async fn send_command(&self, command: &BridgeCommand) -> Result<BridgeResponse, ModelError> {
        let mut process_guard = self.process.lock().await;

        let process = process_guard
            .as_mut()
            .ok_or(ModelError::ProcessNotRunning)?;

        let cmd_json = serde_json::to_string(command)
            .map_err(|e| ModelError::SerializationError(e.to_string()))?;

        process
            .stdin
            .write_all(format!("{cmd_json}\n").as_bytes())
            .await
            .map_err(|e| ModelError::CommunicationError(e.to_string()))?;

        process
            .stdin
            .flush()
            .await
            .map_err(|e| ModelError::CommunicationError(e.to_string()))?;

        let mut response_line = String::new();
        let read = process
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|e| ModelError::CommunicationError(e.to_string()))?;

        if read == 0 {
            return Err(ModelError::CommunicationError(
                "model process closed its stdout".to_string(),
            ));
        }

        serde_json::from_str(&response_line)
            .map_err(|e| ModelError::DeserializationError(e.to_string()))
    }
}

fn decode_tensors(data: serde_json::Value) -> Result<Vec<ImageTensor>, ModelError> {
    let wire: Vec<WireTensor> = serde_json::from_value(data)
        .map_err(|e| ModelError::DeserializationError(e.to_string()))?;
    wire.iter().map(WireTensor::decode).collect()
}

#[async_trait]
impl FaceAligner for ModelBridge {
    async fn detect(&self, image: &ImageTensor) -> Result<Vec<FaceDetection>, ModelError> {
        let command = BridgeCommand::Detect {
            image: WireTensor::encode(image),
        };

        match self.send_command(&command).await? {
            BridgeResponse::Success { data } => serde_json::from_value(data)
                .map_err(|e| ModelError::DeserializationError(e.to_string())),
            BridgeResponse::Error { message, .. } => Err(ModelError::DetectionFailed(message)),
        }
    }
}

#[async_trait]
impl CloakOptimizer for ModelBridge {
    async fn gpu_available(&self) -> Result<bool, ModelError> {
        match self.send_command(&BridgeCommand::GpuAvailable).await? {
            BridgeResponse::Success { data } => Ok(data.as_bool().unwrap_or(false)),
            BridgeResponse::Error { message, .. } => Err(ModelError::CommunicationError(message)),
        }
    }

    async fn optimize(
        &self,
        crops: &[ImageTensor],
        targets: &[ImageTensor],
        params: &OptimizerParams,
    ) -> Result<Vec<ImageTensor>, ModelError> {
        let command = BridgeCommand::Optimize {
            crops: crops.iter().map(WireTensor::encode).collect(),
            targets: targets.iter().map(WireTensor::encode).collect(),
            params: *params,
        };

        match self.send_command(&command).await? {
            BridgeResponse::Success { data } => decode_tensors(data),
            BridgeResponse::Error { message, .. } => Err(ModelError::OptimizationFailed(message)),
        }
    }
}

/// One named extractor hosted by a shared [`ModelBridge`].
pub struct BridgeExtractor {
    bridge: Arc<ModelBridge>,
    name: String,
}

impl BridgeExtractor {
    pub fn new(bridge: Arc<ModelBridge>, name: impl Into<String>) -> Self {
        Self {
            bridge,
            name: name.into(),
        }
    }

    pub fn all(bridge: &Arc<ModelBridge>) -> Vec<Arc<dyn FeatureExtractor>> {
        bridge
            .extractor_names()
            .iter()
            .map(|name| Arc::new(Self::new(bridge.clone(), name.clone())) as Arc<dyn FeatureExtractor>)
            .collect()
    }
}

#[async_trait]
impl FeatureExtractor for BridgeExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, crops: &[ImageTensor]) -> Result<Vec<Vec<f32>>, ModelError> {
        let command = BridgeCommand::Extract {
            extractor: self.name.clone(),
            images: crops.iter().map(WireTensor::encode).collect(),
        };

        match self.bridge.send_command(&command).await? {
            BridgeResponse::Success { data } => serde_json::from_value(data)
                .map_err(|e| ModelError::DeserializationError(e.to_string())),
            BridgeResponse::Error { message, .. } => Err(ModelError::EmbeddingFailed(message)),
        }
    }
}
