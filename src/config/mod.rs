//! Application Configuration
//!
//! Pipeline settings stored in TOML format. Every section has defaults, so a
//! partial file only needs the values it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pipeline::output::OutputFormat;
use crate::vision::preprocess::Normalization;
use crate::vision::reading_order::{ClusteringMode, ColumnDirection, ReadingMode};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Model file locations and session options
    pub models: ModelSettings,
    /// Detector pre/post-processing
    pub detection: DetectionSettings,
    /// Recognizer pre-processing and decoding
    pub recognition: RecognitionSettings,
    /// Reading-order reconstruction
    pub reading_order: ReadingOrderSettings,
    /// Default output representations
    pub output: OutputSettings,
}

/// Where model files live and how sessions are built
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model directory; the platform data directory when unset
    pub models_dir: Option<PathBuf>,
    /// Intra-op threads per ONNX session
    pub intra_threads: usize,
    /// Check model digests against the manifest before loading
    pub verify_checksums: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            intra_threads: 4,
            verify_checksums: true,
        }
    }
}

/// Region detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Side of the square network input
    pub input_size: u32,
    /// Fill value used when padding the page to a square
    pub pad_value: u8,
    /// Per-channel normalization applied after scaling to 0-1
    pub normalization: Normalization,
    /// Minimum detector score (0.0 - 1.0)
    pub score_threshold: f32,
    /// IoU above which a lower-scored box is suppressed
    pub iou_threshold: f32,
    /// Minimum box width and height in pixels
    pub min_box_size: f32,
    /// Fraction of box height added above and below
    pub vertical_expand_ratio: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            input_size: 1024,
            pad_value: 0,
            normalization: Normalization::default(),
            score_threshold: 0.3,
            iou_threshold: 0.5,
            min_box_size: 10.0,
            vertical_expand_ratio: 0.02,
        }
    }
}

/// Line recognizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    /// Recognizer input width
    pub input_width: u32,
    /// Recognizer input height
    pub input_height: u32,
    /// Rotate tall crops so the text line runs left to right
    pub rotate_vertical: bool,
    pub normalization: Normalization,
    /// Confidence reported when the scores carry no usable probability
    pub placeholder_confidence: f32,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            input_width: 768,
            input_height: 16,
            rotate_vertical: true,
            normalization: Normalization::default(),
            placeholder_confidence: 0.9,
        }
    }
}

/// Reading-order reconstruction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingOrderSettings {
    /// Vertical columns or horizontal lines
    pub mode: ReadingMode,
    /// Order in which columns are read
    pub column_direction: ColumnDirection,
    /// Estimate mode and direction from the regions instead
    pub auto_detect: bool,
    /// Max distance (px) between a region center and a column/row mean
    pub group_threshold: f32,
    /// Regions below this recognition confidence are dropped
    pub min_confidence: f32,
    pub clustering: ClusteringMode,
    /// Center displacement (px) reported as a large jump
    pub jump_threshold: f32,
    /// IoU between neighbors reported as an overlap
    pub overlap_threshold: f32,
}

impl Default for ReadingOrderSettings {
    fn default() -> Self {
        Self {
            mode: ReadingMode::Vertical,
            column_direction: ColumnDirection::RightToLeft,
            auto_detect: false,
            group_threshold: 20.0,
            min_confidence: 0.1,
            clustering: ClusteringMode::Stable,
            jump_threshold: 300.0,
            overlap_threshold: 0.5,
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Representations produced when a job does not ask for specific ones
    pub formats: Vec<OutputFormat>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            formats: vec![OutputFormat::Txt],
        }
    }
}

/// Get the application data directory
pub fn default_data_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("org", "koten-ocr", "KotenOcr")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    Ok(proj_dirs.data_dir().to_path_buf())
}

/// Get the default configuration file path
pub fn default_config_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("org", "koten-ocr", "KotenOcr")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(proj_dirs.config_dir().join("config.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Invalid config file {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
