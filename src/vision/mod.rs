//! Vision Layer
//!
//! Turns raw detector/recognizer network output into ordered, recognized text
//! regions for vertically-written page images:
//! - square-padding geometry between image space and model-input space
//! - detector post-processing (thresholding, box expansion, NMS)
//! - greedy sequence decoding of recognizer scores
//! - reading-order reconstruction and validation

pub mod decoder;
pub mod detection;
pub mod geometry;
pub mod models;
pub mod preprocess;
pub mod reading_order;

use serde::{Deserialize, Serialize};

pub use decoder::{DecodedText, SequenceDecoder, Vocabulary};
pub use detection::{DetectionPostProcessor, RawDetection};
pub use geometry::{to_image_space, to_model_space, SquareTransform};
pub use models::{
    InferenceEngine, ModelManager, ModelProvider, ModelSet, ModelType, NamedOutputs,
    OnnxModelProvider, OnnxSession,
};
pub use reading_order::{
    ClusteringMode, ColumnDirection, OrderIssue, ReadingDirection, ReadingMode,
    ReadingOrderReconstructor,
};

/// A text region located by the detector, in original-image pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Box width (always > 0)
    pub width: f32,
    /// Box height (always > 0)
    pub height: f32,
    /// Detector score (0.0 - 1.0)
    pub confidence: f32,
    /// Detector class
    pub class_id: u32,
}

impl Detection {
    /// Right edge
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    /// Bottom edge
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Center point as (x, y)
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection-over-union with another box
    pub fn iou(&self, other: &Detection) -> f32 {
        intersection_over_union(self, other)
    }

    /// Attach decoded text, producing a new recognized region
    pub fn recognized(self, text: impl Into<String>, confidence: f32) -> RecognizedRegion {
        RecognizedRegion {
            detection: self,
            text: text.into(),
            confidence,
        }
    }
}

/// Axis-aligned IoU; 0 when the union is empty
pub fn intersection_over_union(a: &Detection, b: &Detection) -> f32 {
    let inter_w = (a.right().min(b.right()) - a.x.max(b.x)).max(0.0);
    let inter_h = (a.bottom().min(b.bottom()) - a.y.max(b.y)).max(0.0);
    let intersection = inter_w * inter_h;
    let union = a.area() + b.area() - intersection;

    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// A detection with its decoded text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizedRegion {
    /// Source detection (geometry and detector score)
    pub detection: Detection,
    /// Decoded text, empty when nothing was recognized
    pub text: String,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
}

impl RecognizedRegion {
    /// Assign a 1-based reading position
    pub fn with_order(self, reading_order: usize) -> OrderedTextBlock {
        let d = self.detection;
        OrderedTextBlock {
            reading_order,
            text: self.text,
            confidence: self.confidence,
            x: d.x,
            y: d.y,
            width: d.width,
            height: d.height,
            detection_confidence: d.confidence,
            class_id: d.class_id,
        }
    }
}

/// Final pipeline artifact: recognized text with its position in reading order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedTextBlock {
    /// 1-based, dense reading position
    pub reading_order: usize,
    pub text: String,
    /// Recognition confidence
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score of the underlying region
    pub detection_confidence: f32,
    pub class_id: u32,
}

impl OrderedTextBlock {
    /// Center point as (x, y)
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Geometry of this block as a detection
    pub fn bounds(&self) -> Detection {
        Detection {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            confidence: self.detection_confidence,
            class_id: self.class_id,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_box(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Detection {
    Detection {
        x,
        y,
        width,
        height,
        confidence,
        class_id: 0,
    }
}
