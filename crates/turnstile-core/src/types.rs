use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

/// Number of anti-spoof classes: fake, real, other.
pub const NUM_SPOOF_LABELS: usize = 3;

/// Integer pixel rectangle locating a face within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// A box with non-positive width or height cannot be classified.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// A face detection with sub-pixel geometry and optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceDetection {
    /// Integer box covering the detection: floor of the left/top edges,
    /// inclusive right/bottom edges.
    pub fn bbox(&self) -> BoundingBox {
        let left = self.x.floor() as i32;
        let top = self.y.floor() as i32;
        let right = (self.x + self.width).floor() as i32;
        let bottom = (self.y + self.height).floor() as i32;
        BoundingBox::new(left, top, right - left + 1, bottom - top + 1)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled identity as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: i64,
    pub identity: String,
    pub embedding: Embedding,
}

/// Anti-spoof class labels, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoofLabel {
    Fake = 0,
    Real = 1,
    Other = 2,
}

impl SpoofLabel {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Fake),
            1 => Some(Self::Real),
            2 => Some(Self::Other),
            _ => None,
        }
    }
}

/// Per-class scores over [fake, real, other].
///
/// Ensemble outputs are summed element-wise and never renormalized.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PredictionVector(pub [f32; NUM_SPOOF_LABELS]);

impl PredictionVector {
    pub fn zeros() -> Self {
        Self([0.0; NUM_SPOOF_LABELS])
    }

    pub fn scores(&self) -> &[f32; NUM_SPOOF_LABELS] {
        &self.0
    }

    /// Index of the highest score. Ties resolve to the lowest index.
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, &score) in self.0.iter().enumerate().skip(1) {
            if score > self.0[best] {
                best = i;
            }
        }
        best
    }
}

impl AddAssign for PredictionVector {
    fn add_assign(&mut self, rhs: Self) {
        for (acc, v) in self.0.iter_mut().zip(rhs.0) {
            *acc += v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Live,
    Spoof,
}

/// Fused anti-spoof decision for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub liveness: Liveness,
    /// Winning class index (1 = real).
    pub label: usize,
    /// Winning summed score divided by the fixed confidence divisor.
    pub confidence: f32,
    /// Element-wise sum over every contributing model.
    pub scores: PredictionVector,
    /// Models that contributed to `scores`.
    pub models_used: usize,
}

impl LivenessVerdict {
    /// Decide from summed scores: arg-max, then LIVE iff the winner is the real class.
    pub fn from_scores(scores: PredictionVector, divisor: f32, models_used: usize) -> Self {
        let label = scores.argmax();
        let liveness = if label == SpoofLabel::Real as usize {
            Liveness::Live
        } else {
            Liveness::Spoof
        };
        Self {
            liveness,
            label,
            confidence: scores.0[label] / divisor,
            scores,
            models_used,
        }
    }

    pub fn is_live(&self) -> bool {
        self.liveness == Liveness::Live
    }
}

/// Direction of an access event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    In,
    Out,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
