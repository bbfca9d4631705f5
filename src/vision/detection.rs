//! Region detector post-processing
//!
//! Converts raw detection-network output into filtered, deduplicated text
//! regions in original-image coordinates: score filtering, inversion of the
//! square-padding transform, a small vertical allowance for ascenders and
//! descenders, a minimum-size filter, and greedy non-maximum suppression.

use ndarray::{ArrayD, ArrayView1, ArrayView2, Axis, Ix2, Ix3};
use tracing::{debug, warn};

use super::geometry::{to_image_space, SquareTransform};
use super::models::NamedOutputs;
use super::Detection;
use crate::config::DetectionSettings;

/// One detector row in resized-square space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub class_id: u32,
}

/// Turns detector output into image-space detections
#[derive(Debug, Clone)]
pub struct DetectionPostProcessor {
    settings: DetectionSettings,
}

impl DetectionPostProcessor {
    pub fn new(settings: DetectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    /// Post-process named network outputs.
    ///
    /// Output layouts that cannot be interpreted yield no detections; the page
    /// then simply has no text.
    pub fn process(
        &self,
        outputs: &NamedOutputs,
        transform: &SquareTransform,
        image_size: (u32, u32),
    ) -> Vec<Detection> {
        match parse_raw_detections(outputs) {
            Some(raw) => self.process_raw(&raw, transform, image_size),
            None => {
                let shapes: Vec<(&String, &[usize])> =
                    outputs.iter().map(|(name, a)| (name, a.shape())).collect();
                warn!("Unrecognized detector output {:?}; treating page as empty", shapes);
                Vec::new()
            }
        }
    }

    /// Post-process already-parsed detector rows
    pub fn process_raw(
        &self,
        raw: &[RawDetection],
        transform: &SquareTransform,
        image_size: (u32, u32),
    ) -> Vec<Detection> {
        let s = &self.settings;
        let img_h = image_size.1 as f32;

        let candidates: Vec<Detection> = raw
            .iter()
            .filter(|r| r.score.is_finite() && r.score >= s.score_threshold)
            .filter_map(|r| {
                let corners = [(r.x1, r.y1), (r.x2, r.y1), (r.x1, r.y2), (r.x2, r.y2)]
                    .map(|p| to_image_space(p, transform, image_size));

                let min_x = corners.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
                let max_x = corners.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
                let min_y = corners.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
                let max_y = corners.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);

                let allowance = (max_y - min_y) * s.vertical_expand_ratio;
                let top = (min_y - allowance).clamp(0.0, img_h);
                let bottom = (max_y + allowance).clamp(0.0, img_h);

                let width = max_x - min_x;
                let height = bottom - top;
                if !width.is_finite() || !height.is_finite() || width <= 0.0 || height <= 0.0 {
                    return None;
                }
                if width < s.min_box_size || height < s.min_box_size {
                    return None;
                }

                Some(Detection {
                    x: min_x,
                    y: top,
                    width,
                    height,
                    confidence: r.score.clamp(0.0, 1.0),
                    class_id: r.class_id,
                })
            })
            .collect();

        let candidate_count = candidates.len();
        let kept = non_maximum_suppression(candidates, s.iou_threshold);

        debug!(
            "Detection post-processing: {} raw, {} candidates, {} kept",
            raw.len(),
            candidate_count,
            kept.len()
        );

        kept
    }
}

/// Greedy NMS: highest confidence first, suppressing any later box whose IoU
/// with a kept box exceeds `iou_threshold`. Output is confidence-descending.
pub fn non_maximum_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut suppressed = vec![false; detections.len()];
    let mut kept = Vec::new();

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && detections[i].iou(&detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
        kept.push(detections[i].clone());
    }

    kept
}

/// Interpret detector outputs.
///
/// Recognized layouts:
/// - `dets` `[1, N, 5]` with `labels` `[1, N]`
/// - a single `[1, N, 6]` / `[N, 6]` output (`x1, y1, x2, y2, score, class`)
/// - a single `[1, N, 5]` / `[N, 5]` output (class 0)
pub fn parse_raw_detections(outputs: &NamedOutputs) -> Option<Vec<RawDetection>> {
    if let (Some(dets), Some(labels)) = (outputs.get("dets"), outputs.get("labels")) {
        return parse_dets_with_labels(dets, labels);
    }

    if outputs.len() == 1 {
        let array = outputs.values().next()?;
        let rows = as_rows(array)?;
        return match rows.ncols() {
            6 => Some(rows.axis_iter(Axis(0)).map(|r| raw_row(r, Some(r[5]))).collect()),
            5 => Some(rows.axis_iter(Axis(0)).map(|r| raw_row(r, None)).collect()),
            _ => None,
        };
    }

    None
}

fn parse_dets_with_labels(dets: &ArrayD<f32>, labels: &ArrayD<f32>) -> Option<Vec<RawDetection>> {
    let rows = as_rows(dets)?;
    if rows.ncols() < 5 || labels.len() != rows.nrows() {
        return None;
    }

    Some(
        rows.axis_iter(Axis(0))
            .zip(labels.iter())
            .map(|(r, &label)| raw_row(r, Some(label)))
            .collect(),
    )
}

/// View `[1, N, K]` or `[N, K]` as an `N x K` matrix
fn as_rows(array: &ArrayD<f32>) -> Option<ArrayView2<'_, f32>> {
    match array.shape() {
        [1, _, _] => Some(
            array
                .view()
                .into_dimensionality::<Ix3>()
                .ok()?
                .index_axis_move(Axis(0), 0),
        ),
        [_, _] => array.view().into_dimensionality::<Ix2>().ok(),
        _ => None,
    }
}

/// Build a detection from a row of at least five values
fn raw_row(row: ArrayView1<'_, f32>, class: Option<f32>) -> RawDetection {
    let class_id = class
        .filter(|c| c.is_finite())
        .map(|c| c.max(0.0).round() as u32)
        .unwrap_or(0);

    RawDetection {
        x1: row[0],
        y1: row[1],
        x2: row[2],
        y2: row[3],
        score: row[4],
        class_id,
    }
}
