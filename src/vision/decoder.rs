//! Greedy sequence decoding for the line recognizer
//!
//! The recognizer emits a `[sequence_length, vocabulary_size]` score matrix.
//! Index 0 ends the sequence, indices 1-3 are start/padding/unknown control
//! symbols, and any other index `i` names entry `i - 1` of the character
//! table (so the first three table entries sit under the control symbols and
//! are never emitted).

use anyhow::{bail, Context, Result};
use ndarray::{ArrayView1, ArrayView2, Axis, Ix2, Ix3};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::models::NamedOutputs;

/// End-of-sequence symbol
pub const END_OF_SEQUENCE: usize = 0;
/// Start, padding and unknown symbols
pub const CONTROL_SYMBOLS: [usize; 3] = [1, 2, 3];

/// Character table mapping class ids to symbols
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vocabulary {
    symbols: Vec<String>,
}

impl Vocabulary {
    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a character table: one symbol per line, blank lines ignored
    pub fn from_text(content: &str) -> Self {
        Self::from_symbols(
            content
                .lines()
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.is_empty()),
        )
    }

    /// Load a character table file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read character table {:?}", path))?;
        Ok(Self::from_text(&content))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbol for a zero-based class id
    pub fn symbol(&self, class_id: usize) -> Option<&str> {
        self.symbols.get(class_id).map(String::as_str)
    }
}

/// Decoded line text
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedText {
    pub text: String,
    pub confidence: f32,
}

impl DecodedText {
    /// No text, zero confidence
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
        }
    }
}

/// Greedy (argmax) decoder over recognizer scores
#[derive(Debug, Clone)]
pub struct SequenceDecoder {
    vocabulary: Arc<Vocabulary>,
    placeholder_confidence: f32,
}

impl SequenceDecoder {
    pub fn new(vocabulary: Arc<Vocabulary>, placeholder_confidence: f32) -> Self {
        Self {
            vocabulary,
            placeholder_confidence,
        }
    }

    /// Decode the recognizer's named outputs
    pub fn decode_outputs(&self, outputs: &NamedOutputs) -> Result<DecodedText> {
        let scores = score_matrix(outputs)?;
        Ok(self.decode(scores))
    }

    /// Decode one `[sequence_length, vocabulary_size]` score matrix
    pub fn decode(&self, scores: ArrayView2<'_, f32>) -> DecodedText {
        let mut class_ids = Vec::new();
        let mut probabilities = Vec::new();

        for row in scores.axis_iter(Axis(0)) {
            let Some((index, _)) = argmax(row) else {
                continue;
            };

            if index == END_OF_SEQUENCE {
                break;
            }
            if CONTROL_SYMBOLS.contains(&index) {
                continue;
            }

            class_ids.push(index - 1);
            probabilities.push(selected_probability(row, index));
        }

        let text: String = collapse_repeats(&class_ids)
            .into_iter()
            .filter_map(|id| {
                let symbol = self.vocabulary.symbol(id);
                if symbol.is_none() {
                    debug!("Class id {} is outside the character table", id);
                }
                symbol
            })
            .collect();
        let text = text.trim().to_string();

        if text.is_empty() {
            return DecodedText::empty();
        }

        let mean = probabilities.iter().sum::<f32>() / probabilities.len() as f32;
        let confidence = if mean.is_finite() {
            mean.clamp(0.0, 1.0)
        } else {
            self.placeholder_confidence
        };

        DecodedText { text, confidence }
    }
}

/// Drop immediately repeated ids, keeping order
pub fn collapse_repeats(ids: &[usize]) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::with_capacity(ids.len());
    for &id in ids {
        if out.last() != Some(&id) {
            out.push(id);
        }
    }
    out
}

/// Pull the score matrix out of the recognizer outputs.
///
/// Accepts `[1, L, V]` or `[L, V]`; with several outputs the first one of a
/// usable rank in name order is taken.
fn score_matrix(outputs: &NamedOutputs) -> Result<ArrayView2<'_, f32>> {
    let mut names: Vec<&String> = outputs.keys().collect();
    names.sort();

    for name in names {
        let array = &outputs[name];
        match array.ndim() {
            3 if array.shape()[0] == 1 => {
                let view = array
                    .view()
                    .into_dimensionality::<Ix3>()
                    .context("Recognizer output is not rank 3")?;
                return Ok(view.index_axis_move(Axis(0), 0));
            }
            2 => {
                return array
                    .view()
                    .into_dimensionality::<Ix2>()
                    .context("Recognizer output is not rank 2");
            }
            _ => debug!("Skipping recognizer output '{}' with shape {:?}", name, array.shape()),
        }
    }

    bail!("No recognizer output with shape [1, L, V] or [L, V]")
}

fn argmax(row: ArrayView1<'_, f32>) -> Option<(usize, f32)> {
    row.iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
}

/// Probability of the chosen symbol: the row itself if it is already a
/// distribution, its softmax otherwise
fn selected_probability(row: ArrayView1<'_, f32>, index: usize) -> f32 {
    let sum: f32 = row.sum();
    let is_distribution = row.iter().all(|&v| v >= 0.0) && (sum - 1.0).abs() < 1e-3;
    if is_distribution {
        return row[index];
    }

    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let denom: f32 = row.iter().map(|&v| (v - max).exp()).sum();
    (row[index] - max).exp() / denom
}
