//! Reading-order reconstruction
//!
//! Groups recognized regions into columns (vertical text) or rows (horizontal
//! text), orders the groups and their members, and assigns a dense 1-based
//! reading order. Also estimates the reading direction when a caller does not
//! supply one, and flags implausible neighbors in a finished order.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use super::{intersection_over_union, OrderedTextBlock, RecognizedRegion};
use crate::config::ReadingOrderSettings;

/// Neighbor pairs closer than this vertically count as side by side
const NEAR_HORIZONTAL_DY: f32 = 50.0;
/// Adjacency scores below this switch columns to left-to-right
const LEFT_TO_RIGHT_SCORE: f32 = -0.2;

/// Whether text runs in columns or lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingMode {
    /// Top-to-bottom columns
    #[default]
    Vertical,
    /// Left-to-right or right-to-left lines stacked top to bottom
    Horizontal,
}

/// Order in which columns (or characters within a line) are read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDirection {
    #[default]
    RightToLeft,
    LeftToRight,
}

/// How regions are assigned to columns/rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMode {
    /// Greedy assignment over regions sorted by position; independent of
    /// input order
    #[default]
    Stable,
    /// Greedy assignment in input order
    Sequential,
}

impl FromStr for ReadingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vertical" => Ok(Self::Vertical),
            "horizontal" => Ok(Self::Horizontal),
            other => Err(format!("unknown reading mode '{}' (expected vertical or horizontal)", other)),
        }
    }
}

impl FromStr for ColumnDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "right-to-left" | "rtl" => Ok(Self::RightToLeft),
            "left-to-right" | "ltr" => Ok(Self::LeftToRight),
            other => Err(format!("unknown column direction '{}' (expected rtl or ltr)", other)),
        }
    }
}

/// Mode and column direction together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadingDirection {
    pub mode: ReadingMode,
    pub columns: ColumnDirection,
}

/// Advisory diagnostic about two neighbors in the final order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderIssue {
    /// Centers are far apart on at least one axis
    LargeJump { from: usize, to: usize, dx: f32, dy: f32 },
    /// Boxes overlap heavily
    Overlap { from: usize, to: usize, ratio: f32 },
}

impl fmt::Display for OrderIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderIssue::LargeJump { from, to, dx, dy } => {
                write!(f, "large jump {} -> {} (dx {:.0}, dy {:.0})", from, to, dx, dy)
            }
            OrderIssue::Overlap { from, to, ratio } => {
                write!(f, "overlap {} -> {} (ratio {:.2})", from, to, ratio)
            }
        }
    }
}

/// A column or row under construction
struct Group {
    members: Vec<usize>,
    center_sum: f32,
}

impl Group {
    fn mean(&self) -> f32 {
        self.center_sum / self.members.len() as f32
    }
}

/// Clusters and orders recognized regions
#[derive(Debug, Clone)]
pub struct ReadingOrderReconstructor {
    settings: ReadingOrderSettings,
}

impl ReadingOrderReconstructor {
    pub fn new(settings: ReadingOrderSettings) -> Self {
        Self { settings }
    }

    /// Direction the reconstructor will use for these regions
    pub fn resolve_direction<R: Borrow<RecognizedRegion>>(&self, regions: &[R]) -> ReadingDirection {
        if self.settings.auto_detect {
            detect_direction(regions)
        } else {
            ReadingDirection {
                mode: self.settings.mode,
                columns: self.settings.column_direction,
            }
        }
    }

    /// Filter, cluster and order regions. Never fails; may return nothing.
    pub fn reconstruct(&self, regions: &[RecognizedRegion]) -> Vec<OrderedTextBlock> {
        let kept: Vec<&RecognizedRegion> = regions
            .iter()
            .filter(|r| r.confidence >= self.settings.min_confidence && !r.text.trim().is_empty())
            .collect();

        if kept.is_empty() {
            return Vec::new();
        }

        // Dropped regions do not vote on direction
        let direction = self.resolve_direction(&kept);
        let vertical = direction.mode == ReadingMode::Vertical;

        // Clustering axis: x centers for columns, y centers for rows
        let axis_center = |r: &RecognizedRegion| {
            let (cx, cy) = r.detection.center();
            if vertical { cx } else { cy }
        };
        let cross_center = |r: &RecognizedRegion| {
            let (cx, cy) = r.detection.center();
            if vertical { cy } else { cx }
        };

        let mut visit: Vec<usize> = (0..kept.len()).collect();
        if self.settings.clustering == ClusteringMode::Stable {
            visit.sort_by(|&a, &b| {
                axis_center(kept[a])
                    .total_cmp(&axis_center(kept[b]))
                    .then_with(|| cross_center(kept[a]).total_cmp(&cross_center(kept[b])))
                    .then_with(|| tie_break(kept[a], kept[b]))
            });
        }

        let mut groups: Vec<Group> = Vec::new();
        for idx in visit {
            let center = axis_center(kept[idx]);
            match groups
                .iter_mut()
                .find(|g| (g.mean() - center).abs() <= self.settings.group_threshold)
            {
                Some(group) => {
                    group.members.push(idx);
                    group.center_sum += center;
                }
                None => groups.push(Group {
                    members: vec![idx],
                    center_sum: center,
                }),
            }
        }

        // Columns follow the column direction; rows always run top to bottom
        groups.sort_by(|a, b| match (vertical, direction.columns) {
            (true, ColumnDirection::RightToLeft) => b.mean().total_cmp(&a.mean()),
            _ => a.mean().total_cmp(&b.mean()),
        });

        let mut ordered = Vec::with_capacity(kept.len());
        for group in &mut groups {
            group.members.sort_by(|&a, &b| {
                let (ra, rb) = (kept[a], kept[b]);
                let primary = if vertical {
                    ra.detection.y.total_cmp(&rb.detection.y)
                } else {
                    let (ax, bx) = (ra.detection.center().0, rb.detection.center().0);
                    match direction.columns {
                        ColumnDirection::LeftToRight => ax.total_cmp(&bx),
                        ColumnDirection::RightToLeft => bx.total_cmp(&ax),
                    }
                };
                primary.then_with(|| tie_break(ra, rb))
            });
            ordered.extend(group.members.iter().map(|&i| kept[i]));
        }

        debug!(
            "Reading order: {} regions in {} {} ({:?})",
            ordered.len(),
            groups.len(),
            if vertical { "columns" } else { "rows" },
            direction.columns
        );

        ordered
            .into_iter()
            .enumerate()
            .map(|(i, region)| region.clone().with_order(i + 1))
            .collect()
    }

    /// Flag suspicious neighbors using the configured thresholds
    pub fn validate(&self, blocks: &[OrderedTextBlock]) -> Vec<OrderIssue> {
        validate_order(blocks, self.settings.jump_threshold, self.settings.overlap_threshold)
    }
}

/// Deterministic last-resort ordering between regions
fn tie_break(a: &RecognizedRegion, b: &RecognizedRegion) -> Ordering {
    a.detection
        .x
        .total_cmp(&b.detection.x)
        .then_with(|| a.detection.y.total_cmp(&b.detection.y))
        .then_with(|| a.detection.area().total_cmp(&b.detection.area()))
        .then_with(|| a.text.cmp(&b.text))
}

/// Estimate reading mode and column direction from region geometry
pub fn detect_direction<R: Borrow<RecognizedRegion>>(regions: &[R]) -> ReadingDirection {
    if regions.len() < 2 {
        return ReadingDirection::default();
    }
    let regions: Vec<&RecognizedRegion> = regions.iter().map(|r| r.borrow()).collect();

    let centers: Vec<(f32, f32)> = regions.iter().map(|r| r.detection.center()).collect();
    let var_x = variance(centers.iter().map(|c| c.0));
    let var_y = variance(centers.iter().map(|c| c.1));
    let tall = regions
        .iter()
        .filter(|r| r.detection.height > r.detection.width)
        .count();

    let mode = if var_x >= var_y || tall * 2 > regions.len() {
        ReadingMode::Vertical
    } else {
        ReadingMode::Horizontal
    };

    let score = adjacency_score(&regions, mode);
    let columns = if score < LEFT_TO_RIGHT_SCORE {
        ColumnDirection::LeftToRight
    } else {
        ColumnDirection::RightToLeft
    };

    debug!(
        "Direction estimate: var_x {:.1}, var_y {:.1}, adjacency {:.2} -> {:?}/{:?}",
        var_x, var_y, score, mode, columns
    );

    ReadingDirection { mode, columns }
}

/// Over near-horizontal neighbor pairs: +1 when the right-hand box is longer
/// along the reading axis, -1 when the left-hand one is, averaged.
///
/// A page usually opens with full-length lines and ends with a short one, so
/// the longer side of a pair tends to be where reading starts.
fn adjacency_score(regions: &[&RecognizedRegion], mode: ReadingMode) -> f32 {
    let length = |r: &RecognizedRegion| match mode {
        ReadingMode::Vertical => r.detection.height,
        ReadingMode::Horizontal => r.detection.width,
    };

    let mut total = 0.0f32;
    let mut pairs = 0usize;

    for (i, a) in regions.iter().enumerate() {
        for b in regions.iter().skip(i + 1) {
            let (ax, ay) = a.detection.center();
            let (bx, by) = b.detection.center();
            if (ay - by).abs() >= NEAR_HORIZONTAL_DY || ax == bx {
                continue;
            }

            let (left, right) = if ax < bx { (a, b) } else { (b, a) };
            let (ll, rl) = (length(left), length(right));
            pairs += 1;
            if rl > ll {
                total += 1.0;
            } else if ll > rl {
                total -= 1.0;
            }
        }
    }

    if pairs == 0 {
        return 0.0;
    }
    total / pairs as f32
}

fn variance(values: impl Iterator<Item = f32> + Clone) -> f32 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f32>() / n as f32;
    values.map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32
}

/// Flag adjacent blocks whose centers jump more than `jump_threshold` on
/// either axis, or whose IoU exceeds `overlap_threshold`
pub fn validate_order(
    blocks: &[OrderedTextBlock],
    jump_threshold: f32,
    overlap_threshold: f32,
) -> Vec<OrderIssue> {
    let mut issues = Vec::new();

    for pair in blocks.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let (ax, ay) = a.center();
        let (bx, by) = b.center();
        let dx = (bx - ax).abs();
        let dy = (by - ay).abs();

        if dx > jump_threshold || dy > jump_threshold {
            issues.push(OrderIssue::LargeJump {
                from: a.reading_order,
                to: b.reading_order,
                dx,
                dy,
            });
        }

        let ratio = intersection_over_union(&a.bounds(), &b.bounds());
        if ratio > overlap_threshold {
            issues.push(OrderIssue::Overlap {
                from: a.reading_order,
                to: b.reading_order,
                ratio,
            });
        }
    }

    issues
}
