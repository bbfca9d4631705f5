//! Model management for ONNX Runtime
//!
//! Defines the inference boundary used by the pipeline (tensor in, named
//! tensors out) and the ONNX-backed implementation that loads detector and
//! recognizer models from a local model directory.

use anyhow::{bail, Context, Result};
use ndarray::{Array4, ArrayD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::decoder::Vocabulary;
use crate::config::ModelSettings;

/// Network outputs keyed by output name
pub type NamedOutputs = HashMap<String, ArrayD<f32>>;

/// An opaque inference function: one input tensor, named output tensors
pub trait InferenceEngine: Send {
    fn run(&mut self, input: Array4<f32>) -> Result<NamedOutputs>;
}

/// Everything a worker needs to run the pipeline
pub struct ModelSet {
    pub detector: Box<dyn InferenceEngine>,
    pub recognizer: Box<dyn InferenceEngine>,
    pub vocabulary: Arc<Vocabulary>,
}

/// Supplies freshly loaded models to a worker context
pub trait ModelProvider: Send + Sync {
    fn load(&self) -> Result<ModelSet>;
}

/// Model file kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text region detector
    Detection,
    /// Text line recognizer
    Recognition,
    /// Character table for the recognizer
    Vocabulary,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [ModelType::Detection, ModelType::Recognition, ModelType::Vocabulary];

    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Detection => "det.onnx",
            ModelType::Recognition => "rec.onnx",
            ModelType::Vocabulary => "dict.txt",
        }
    }

    /// Display name for status reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Detection => "Text Detection",
            ModelType::Recognition => "Text Recognition",
            ModelType::Vocabulary => "Character Table",
        }
    }
}

/// Manifest pinning model digests
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

impl ModelManifest {
    fn entry(&self, filename: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.filename == filename)
    }
}

/// Resolves and reads model files from a directory
#[derive(Debug, Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
}

impl ModelManager {
    /// Model manager for the configured directory, or the platform data directory
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        match &settings.models_dir {
            Some(dir) => Ok(Self::with_dir(dir.clone())),
            None => Ok(Self::with_dir(crate::config::default_data_dir()?.join("models"))),
        }
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Check if a model file is present and non-empty
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        std::fs::metadata(self.model_path(model_type))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Check if all required models are available
    pub fn are_models_ready(&self) -> bool {
        ModelType::ALL.iter().all(|&t| self.is_model_available(t))
    }

    /// Get status of all models
    pub fn get_model_status(&self) -> Vec<(ModelType, bool, Option<u64>)> {
        ModelType::ALL
            .iter()
            .map(|&model_type| {
                let size = std::fs::metadata(self.model_path(model_type)).ok().map(|m| m.len());
                (model_type, self.is_model_available(model_type), size)
            })
            .collect()
    }

    /// Read a model file, checking its digest against the manifest when pinned
    pub fn read_model(&self, model_type: ModelType, verify: bool) -> Result<Vec<u8>> {
        let path = self.model_path(model_type);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("{} model not found at {:?}", model_type.display_name(), path))?;

        if bytes.is_empty() {
            bail!("{} model at {:?} is empty", model_type.display_name(), path);
        }

        if verify {
            let manifest = self.load_manifest()?;
            match manifest.entry(model_type.filename()).and_then(|m| m.sha256.as_deref()) {
                Some(expected) => {
                    let actual = sha256_hex(&bytes);
                    if actual != expected {
                        bail!(
                            "Checksum mismatch for {}: expected {}, got {}",
                            model_type.filename(),
                            expected,
                            actual
                        );
                    }
                    debug!("Checksum verified for {}", model_type.display_name());
                }
                None => debug!("No pinned checksum for {}", model_type.filename()),
            }
        }

        Ok(bytes)
    }

    /// Record the current digest of a model file in the manifest
    pub fn pin_model(&self, model_type: ModelType) -> Result<String> {
        let bytes = self.read_model(model_type, false)?;
        let hash = sha256_hex(&bytes);
        let mut manifest = self.load_manifest()?;

        let info = ModelInfo {
            filename: model_type.filename().to_string(),
            size_bytes: bytes.len() as u64,
            sha256: Some(hash.clone()),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.filename == info.filename) {
            *existing = info;
        } else {
            manifest.models.push(info);
        }

        self.save_manifest(&manifest)?;
        info!("Pinned {} ({})", model_type.display_name(), hash);
        Ok(hash)
    }

    /// Load the model manifest; a missing manifest is an empty one
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)
                .with_context(|| format!("Invalid manifest {:?}", manifest_path))?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        std::fs::create_dir_all(&self.models_dir)?;
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Hex-encoded SHA-256 digest
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Create a new ONNX session from in-memory model bytes
    pub fn from_memory(model: &[u8], intra_threads: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_memory(model)
            .context("Failed to load ONNX model")?;

        let input_names: Vec<String> = session.inputs.iter().map(|input| input.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|output| output.name.clone()).collect();

        info!("Model loaded. Inputs: {:?}, Outputs: {:?}", input_names, output_names);

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }
}

impl InferenceEngine for OnnxSession {
    fn run(&mut self, input: Array4<f32>) -> Result<NamedOutputs> {
        let input_name = self
            .input_names
            .first()
            .cloned()
            .context("Model declares no inputs")?;

        let tensor = Tensor::from_array(input).context("Failed to build input tensor")?;
        let outputs = self
            .session
            .run(ort::inputs![input_name.as_str() => tensor])
            .context("Inference failed")?;

        let mut named = NamedOutputs::new();
        for name in &self.output_names {
            let value = &outputs[name.as_str()];
            // Label outputs are commonly int64
            let array = match value.try_extract_array::<f32>() {
                Ok(view) => view.to_owned(),
                Err(_) => value
                    .try_extract_array::<i64>()
                    .with_context(|| format!("Unsupported element type for output '{}'", name))?
                    .mapv(|v| v as f32),
            };
            named.insert(name.clone(), array);
        }

        Ok(named)
    }
}

/// Loads the detector, recognizer and character table from a model directory
pub struct OnnxModelProvider {
    manager: ModelManager,
    settings: ModelSettings,
}

impl OnnxModelProvider {
    pub fn new(manager: ModelManager, settings: ModelSettings) -> Self {
        Self { manager, settings }
    }
}

impl ModelProvider for OnnxModelProvider {
    fn load(&self) -> Result<ModelSet> {
        let verify = self.settings.verify_checksums;
        info!("Loading models from {:?}", self.manager.models_dir());

        let det_bytes = self.manager.read_model(ModelType::Detection, verify)?;
        let rec_bytes = self.manager.read_model(ModelType::Recognition, verify)?;
        let dict_bytes = self.manager.read_model(ModelType::Vocabulary, verify)?;

        let detector = OnnxSession::from_memory(&det_bytes, self.settings.intra_threads)
            .context("Failed to load detection model")?;
        let recognizer = OnnxSession::from_memory(&rec_bytes, self.settings.intra_threads)
            .context("Failed to load recognition model")?;

        let dict = String::from_utf8(dict_bytes).context("Character table is not valid UTF-8")?;
        let vocabulary = Vocabulary::from_text(&dict);
        if vocabulary.is_empty() {
            warn!("Character table is empty; every region will decode to no text");
        }

        Ok(ModelSet {
            detector: Box::new(detector),
            recognizer: Box::new(recognizer),
            vocabulary: Arc::new(vocabulary),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_models(dir: &Path) {
        std::fs::write(dir.join("det.onnx"), b"detector-bytes").unwrap();
        std::fs::write(dir.join("rec.onnx"), b"recognizer-bytes").unwrap();
        std::fs::write(dir.join("dict.txt"), "a\nb\nc\n").unwrap();
    }

    #[test]
    fn test_model_type_filenames() {
        assert_eq!(ModelType::Detection.filename(), "det.onnx");
        assert_eq!(ModelType::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelType::Vocabulary.filename(), "dict.txt");
    }

    #[test]
    fn test_model_status_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf());

        assert!(!manager.are_models_ready());
        let status = manager.get_model_status();
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|(_, available, size)| !available && size.is_none()));

        write_models(dir.path());
        assert!(manager.are_models_ready());
    }

    #[test]
    fn test_read_model_verifies_pinned_digest() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let manager = ModelManager::with_dir(dir.path().to_path_buf());

        let hash = manager.pin_model(ModelType::Detection).unwrap();
        assert_eq!(hash, sha256_hex(b"detector-bytes"));
        assert!(manager.read_model(ModelType::Detection, true).is_ok());

        std::fs::write(dir.path().join("det.onnx"), b"tampered").unwrap();
        let err = manager.read_model(ModelType::Detection, true).unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));

        // Unverified reads ignore the manifest
        assert!(manager.read_model(ModelType::Detection, false).is_ok());
    }

    #[test]
    fn test_read_model_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf());
        assert!(manager.read_model(ModelType::Recognition, true).is_err());
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let manager = ModelManager::with_dir(dir.path().to_path_buf());

        manager.pin_model(ModelType::Vocabulary).unwrap();
        manager.pin_model(ModelType::Vocabulary).unwrap();

        let manifest = manager.load_manifest().unwrap();
        assert_eq!(manifest.models.len(), 1);
        assert_eq!(manifest.models[0].filename, "dict.txt");
        assert_eq!(manifest.models[0].size_bytes, 6);
    }
}
