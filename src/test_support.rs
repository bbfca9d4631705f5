//! Fake inference engines and model providers for unit tests

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::Receiver;
use ndarray::{Array2, Array3};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::vision::{InferenceEngine, ModelProvider, ModelSet, NamedOutputs, Vocabulary};

/// Recognizer vocabulary width used by `recognizer_outputs`
pub(crate) const TEST_VOCAB_SIZE: usize = 8;

/// Character table where network indices 4, 5, 6 decode to 一, 二, 三
pub(crate) fn test_vocabulary() -> Vocabulary {
    Vocabulary::from_symbols(["<s>", "<pad>", "<unk>", "一", "二", "三", "四"])
}

/// Detector output `[1, N, 5]` from `(x1, y1, x2, y2, score)` rows
pub(crate) fn detector_outputs(boxes: &[(f32, f32, f32, f32, f32)]) -> NamedOutputs {
    let mut dets = Array3::<f32>::zeros((1, boxes.len(), 5));
    for (i, &(x1, y1, x2, y2, score)) in boxes.iter().enumerate() {
        for (k, v) in [x1, y1, x2, y2, score].into_iter().enumerate() {
            dets[[0, i, k]] = v;
        }
    }
    let mut outputs = NamedOutputs::new();
    outputs.insert("output".to_string(), dets.into_dyn());
    outputs
}

/// Recognizer logits `[1, L, V]` selecting the given network indices
pub(crate) fn recognizer_outputs(indices: &[usize]) -> NamedOutputs {
    let mut logits = Array2::<f32>::zeros((indices.len(), TEST_VOCAB_SIZE));
    for (pos, &idx) in indices.iter().enumerate() {
        logits[[pos, idx]] = 10.0;
    }
    let mut outputs = NamedOutputs::new();
    outputs.insert("logits".to_string(), logits.insert_axis(ndarray::Axis(0)).into_dyn());
    outputs
}

/// Engine that replays scripted results, cycling when it runs out
pub(crate) struct ScriptedEngine {
    script: Vec<Result<NamedOutputs, String>>,
    next: usize,
    /// Each run waits for one token when set
    gate: Option<Receiver<()>>,
    calls: Arc<AtomicUsize>,
    /// Runs left that panic instead of answering; shared across reloads
    panics: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub(crate) fn new(script: Vec<Result<NamedOutputs, String>>) -> Self {
        Self {
            script,
            next: 0,
            gate: None,
            calls: Arc::new(AtomicUsize::new(0)),
            panics: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn gated(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn counting(mut self, calls: Arc<AtomicUsize>) -> Self {
        self.calls = calls;
        self
    }

    pub(crate) fn panicking(mut self, panics: Arc<AtomicUsize>) -> Self {
        self.panics = panics;
        self
    }
}

impl InferenceEngine for ScriptedEngine {
    fn run(&mut self, _input: ndarray::Array4<f32>) -> Result<NamedOutputs> {
        if let Some(gate) = &self.gate {
            gate.recv().map_err(|_| anyhow!("gate closed"))?;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let armed = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            panic!("engine blew up");
        }

        if self.script.is_empty() {
            bail!("empty script");
        }
        let step = self.script[self.next % self.script.len()].clone();
        self.next += 1;
        step.map_err(|e| anyhow!(e))
    }
}

/// Provider building fresh scripted engines for every worker context
pub(crate) struct FakeProvider {
    pub detector: Vec<Result<NamedOutputs, String>>,
    pub recognizer: Vec<Result<NamedOutputs, String>>,
    pub gate: Option<Receiver<()>>,
    pub fail_with: Option<String>,
    pub loads: Arc<AtomicUsize>,
    pub detector_calls: Arc<AtomicUsize>,
    /// Detector runs that panic before the script resumes
    pub detector_panics: Arc<AtomicUsize>,
}

impl FakeProvider {
    /// One region recognized as 一
    pub(crate) fn single_region() -> Self {
        Self {
            detector: vec![Ok(detector_outputs(&[(0.0, 0.0, 40.0, 40.0, 0.9)]))],
            recognizer: vec![Ok(recognizer_outputs(&[4]))],
            gate: None,
            fail_with: None,
            loads: Arc::new(AtomicUsize::new(0)),
            detector_calls: Arc::new(AtomicUsize::new(0)),
            detector_panics: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn gated(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn failing(mut self, error: &str) -> Self {
        self.fail_with = Some(error.to_string());
        self
    }

    /// Make the first `count` detector runs panic
    pub(crate) fn panicking(self, count: usize) -> Self {
        self.detector_panics.store(count, Ordering::SeqCst);
        self
    }
}

impl ModelProvider for FakeProvider {
    fn load(&self) -> Result<ModelSet> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_with {
            bail!("{}", error);
        }

        let mut detector =
            ScriptedEngine::new(self.detector.clone())
            .counting(self.detector_calls.clone())
            .panicking(self.detector_panics.clone());
        if let Some(gate) = &self.gate {
            detector = detector.gated(gate.clone());
        }

        Ok(ModelSet {
            detector: Box::new(detector),
            recognizer: Box::new(ScriptedEngine::new(self.recognizer.clone())),
            vocabulary: Arc::new(test_vocabulary()),
        })
    }
}
