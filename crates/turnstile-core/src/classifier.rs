//! Anti-spoof classifiers via ONNX Runtime.
//!
//! Each classifier takes a model-sized BGR patch and yields a softmax
//! distribution over [fake, real, other].

use crate::cropper::Crop;
use crate::model_spec::ModelSpec;
use crate::types::{PredictionVector, NUM_SPOOF_LABELS};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0} (place anti-spoof models in the spoof model directory)")]
    ModelNotFound(String),
    #[error("crop is {actual_w}x{actual_h}, model expects {expected_w}x{expected_h}")]
    InputSizeMismatch {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("session lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One anti-spoof model.
///
/// Implementations must be callable from several threads; the fusion step may
/// run ensemble members concurrently.
pub trait SpoofClassifier: Send + Sync {
    fn predict(&self, crop: &Crop) -> Result<PredictionVector, ClassifierError>;
}

/// MiniFASNet-family classifier backed by an ONNX session.
pub struct OnnxSpoofClassifier {
    session: Mutex<Session>,
    spec: ModelSpec,
}

impl OnnxSpoofClassifier {
    /// Load the ONNX model at `model_path` for the input geometry in `spec`.
    pub fn load(model_path: &Path, spec: ModelSpec) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            kind = %spec.model_kind,
            input = %format!("{}x{}", spec.height_input, spec.width_input),
            scale = ?spec.scale,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded anti-spoof model"
        );

        Ok(Self {
            session: Mutex::new(session),
            spec,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Patch → NCHW float tensor in BGR channel order, raw 0–255 values.
    fn preprocess(crop: &Crop) -> Array4<f32> {
        let (w, h) = crop.dimensions();
        let (w, h) = (w as usize, h as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

        for (x, y, pixel) in crop.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = b as f32;
            tensor[[0, 1, y, x]] = g as f32;
            tensor[[0, 2, y, x]] = r as f32;
        }

        tensor
    }
}

impl SpoofClassifier for OnnxSpoofClassifier {
    fn predict(&self, crop: &Crop) -> Result<PredictionVector, ClassifierError> {
        let (w, h) = crop.dimensions();
        if w != self.spec.width_input || h != self.spec.height_input {
            return Err(ClassifierError::InputSizeMismatch {
                expected_w: self.spec.width_input,
                expected_h: self.spec.height_input,
                actual_w: w,
                actual_h: h,
            });
        }

        let input = Self::preprocess(crop);
        let mut session = self.session.lock().map_err(|_| ClassifierError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("logits: {e}")))?;

        if logits.len() != NUM_SPOOF_LABELS {
            return Err(ClassifierError::InferenceFailed(format!(
                "expected {NUM_SPOOF_LABELS} class scores, got {}",
                logits.len()
            )));
        }

        Ok(softmax([logits[0], logits[1], logits[2]]))
    }
}

/// Numerically stable softmax over the three class logits.
fn softmax(logits: [f32; NUM_SPOOF_LABELS]) -> PredictionVector {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps = logits.map(|l| (l - max).exp());
    let sum: f32 = exps.iter().sum();
    PredictionVector(exps.map(|e| e / sum))
}

/// Process-wide anti-spoof model cache, keyed by model identifier.
///
/// Every model is loaded once at startup and shared across requests.
#[derive(Default)]
pub struct ModelCache {
    models: HashMap<String, Arc<dyn SpoofClassifier>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every model in `specs` from `dir`. Any failure aborts startup.
    pub fn load_all(dir: &Path, specs: &[ModelSpec]) -> Result<Self, ClassifierError> {
        let mut cache = Self::new();
        for spec in specs {
            let classifier = OnnxSpoofClassifier::load(&dir.join(&spec.identifier), spec.clone())?;
            cache.insert(&spec.identifier, Arc::new(classifier));
        }
        Ok(cache)
    }

    pub fn insert(&mut self, identifier: &str, classifier: Arc<dyn SpoofClassifier>) {
        self.models.insert(identifier.to_string(), classifier);
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn SpoofClassifier>> {
        self.models.get(identifier).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
