//! OCR Pipeline
//!
//! Runs one page through detection, per-region recognition, reading-order
//! reconstruction and output assembly, reporting progress as it goes.

pub mod output;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, OutputSettings, ReadingOrderSettings, RecognitionSettings};
use crate::vision::geometry::to_model_space;
use crate::vision::preprocess::preprocess_for_recognition;
use crate::vision::{
    ColumnDirection, DecodedText, Detection, DetectionPostProcessor, InferenceEngine, ModelSet,
    ReadingMode, ReadingOrderReconstructor, SequenceDecoder,
};

pub use output::{OcrResult, OutputFormat};

/// Processing stages of a job, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    Detecting,
    Recognizing,
    Reordering,
    Assembling,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Detecting => "detecting",
            Stage::Recognizing => "recognizing",
            Stage::Reordering => "reordering",
            Stage::Assembling => "assembling",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-tagged job failure
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Models could not be made available
    #[error("initialization failed: {0}")]
    Initialization(String),
    /// A stage failed
    #[error("{stage} failed: {message}")]
    Stage { stage: Stage, message: String },
    /// The job was cancelled before finishing
    #[error("cancelled while {0}")]
    Cancelled(Stage),
}

impl PipelineError {
    pub fn stage(stage: Stage, error: impl fmt::Display) -> Self {
        PipelineError::Stage {
            stage,
            message: error.to_string(),
        }
    }

    /// Name of the stage the failure originated in
    pub fn stage_name(&self) -> &'static str {
        match self {
            PipelineError::Initialization(_) => "initialization",
            PipelineError::Stage { stage, .. } => stage.as_str(),
            PipelineError::Cancelled(stage) => stage.as_str(),
        }
    }
}

/// Shared cancellation flag checked between stages and regions
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled(stage)` once the flag is raised
    pub fn check(&self, stage: Stage) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled(stage));
        }
        Ok(())
    }
}

/// Progress report for a running job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: Stage,
    /// Fraction complete (0.0 - 1.0), never decreasing within a job
    pub progress: f32,
    pub message: String,
}

/// Forwards progress to a callback, holding the fraction non-decreasing
struct ProgressReporter<F: FnMut(ProgressUpdate)> {
    callback: F,
    last: f32,
}

impl<F: FnMut(ProgressUpdate)> ProgressReporter<F> {
    fn new(callback: F) -> Self {
        Self { callback, last: 0.0 }
    }

    fn report(&mut self, stage: Stage, progress: f32, message: impl Into<String>) {
        let progress = progress.clamp(0.0, 1.0).max(self.last);
        self.last = progress;
        (self.callback)(ProgressUpdate {
            stage,
            progress,
            message: message.into(),
        });
    }
}

/// Per-job options; unset fields fall back to the application config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobConfig {
    /// Representations to produce
    pub output_formats: Option<Vec<OutputFormat>>,
    pub reading_mode: Option<ReadingMode>,
    pub column_direction: Option<ColumnDirection>,
    /// Estimate mode and direction from the page
    pub auto_direction: Option<bool>,
}

impl JobConfig {
    /// Reading-order settings with this job's overrides applied
    pub fn reading_order_settings(&self, base: &ReadingOrderSettings) -> ReadingOrderSettings {
        let mut settings = base.clone();
        if let Some(mode) = self.reading_mode {
            settings.mode = mode;
        }
        if let Some(columns) = self.column_direction {
            settings.column_direction = columns;
        }
        if let Some(auto) = self.auto_direction {
            settings.auto_detect = auto;
        }
        settings
    }

    /// Formats to render; an empty or missing list means the configured default
    pub fn formats(&self, base: &OutputSettings) -> Vec<OutputFormat> {
        let formats = match &self.output_formats {
            Some(formats) if !formats.is_empty() => formats.clone(),
            _ => base.formats.clone(),
        };
        if formats.is_empty() {
            return vec![OutputFormat::Txt];
        }

        let mut unique = Vec::with_capacity(formats.len());
        for format in formats {
            if !unique.contains(&format) {
                unique.push(format);
            }
        }
        unique
    }
}

/// Detection, recognition and ordering for one page at a time
pub struct OcrPipeline {
    detector: Box<dyn InferenceEngine>,
    recognizer: Box<dyn InferenceEngine>,
    post_processor: DetectionPostProcessor,
    decoder: SequenceDecoder,
    config: AppConfig,
}

impl OcrPipeline {
    pub fn new(models: ModelSet, config: &AppConfig) -> Self {
        Self {
            detector: models.detector,
            recognizer: models.recognizer,
            post_processor: DetectionPostProcessor::new(config.detection.clone()),
            decoder: SequenceDecoder::new(models.vocabulary, config.recognition.placeholder_confidence),
            config: config.clone(),
        }
    }

    /// Run one page through every stage
    pub fn process(
        &mut self,
        image: &RgbImage,
        job: &JobConfig,
        cancel: &CancelToken,
        on_progress: impl FnMut(ProgressUpdate),
    ) -> Result<OcrResult, PipelineError> {
        let start = Instant::now();
        let mut progress = ProgressReporter::new(on_progress);
        let (width, height) = image.dimensions();

        progress.report(Stage::Initializing, 0.0, format!("Processing {}x{} image", width, height));
        cancel.check(Stage::Initializing)?;

        progress.report(Stage::Detecting, 0.05, "Detecting text regions");
        let detections = self.detect(image)?;
        let total = detections.len();
        info!("Detected {} text regions", total);
        cancel.check(Stage::Detecting)?;

        progress.report(Stage::Recognizing, 0.2, format!("Recognizing {} regions", total));
        let mut regions = Vec::with_capacity(total);
        for (i, detection) in detections.into_iter().enumerate() {
            cancel.check(Stage::Recognizing)?;

            let decoded = self.recognize(image, &detection);
            regions.push(detection.recognized(decoded.text, decoded.confidence));

            let fraction = 0.2 + 0.7 * (i + 1) as f32 / total as f32;
            progress.report(Stage::Recognizing, fraction, format!("Recognized region {}/{}", i + 1, total));
        }
        let successful = regions.iter().filter(|r| !r.text.is_empty()).count();
        cancel.check(Stage::Recognizing)?;

        progress.report(Stage::Reordering, 0.9, "Reconstructing reading order");
        let reconstructor =
            ReadingOrderReconstructor::new(job.reading_order_settings(&self.config.reading_order));
        let blocks = reconstructor.reconstruct(&regions);
        let issues = reconstructor.validate(&blocks);
        for issue in &issues {
            debug!("Reading order: {}", issue);
        }
        cancel.check(Stage::Reordering)?;

        progress.report(Stage::Assembling, 0.95, "Assembling output");
        let formats = job.formats(&self.config.output);
        // Taken before rendering so every output reports the same figure
        let elapsed = start.elapsed().as_millis() as u64;
        let mut result = OcrResult::new(blocks, total, successful, elapsed, issues);
        result
            .render(&formats)
            .map_err(|e| PipelineError::stage(Stage::Assembling, e))?;

        progress.report(Stage::Done, 1.0, "Done");
        info!(
            "OCR finished: {} regions, {} recognized, {} blocks in {} ms",
            total,
            successful,
            result.text_blocks.len(),
            result.processing_time_ms
        );

        Ok(result)
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, PipelineError> {
        let settings = self.post_processor.settings();
        let (tensor, transform) = to_model_space(
            image,
            settings.input_size,
            settings.pad_value,
            &settings.normalization,
        );

        let outputs = self
            .detector
            .run(tensor)
            .map_err(|e| PipelineError::stage(Stage::Detecting, format!("{:#}", e)))?;

        Ok(self.post_processor.process(&outputs, &transform, image.dimensions()))
    }

    /// Decode one region; failures leave the region without text
    fn recognize(&mut self, image: &RgbImage, detection: &Detection) -> DecodedText {
        let settings: &RecognitionSettings = &self.config.recognition;
        let Some(tensor) = preprocess_for_recognition(image, detection, settings) else {
            debug!("Region at ({:.0}, {:.0}) covers no pixels", detection.x, detection.y);
            return DecodedText::empty();
        };

        let outputs = match self.recognizer.run(tensor) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("Recognizer failed for region at ({:.0}, {:.0}): {:#}", detection.x, detection.y, e);
                return DecodedText::empty();
            }
        };

        match self.decoder.decode_outputs(&outputs) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Could not decode region at ({:.0}, {:.0}): {:#}", detection.x, detection.y, e);
                DecodedText::empty()
            }
        }
    }
}
