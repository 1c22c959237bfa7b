//! turnstile-core: face access-control engine.
//!
//! Anti-spoof ensemble fusion over MiniFASNet-style classifiers, SCRFD face
//! detection, ArcFace embeddings and first-match gallery search, all running
//! on ONNX Runtime for CPU inference.

pub mod access;
pub mod alignment;
pub mod classifier;
pub mod cropper;
pub mod detector;
pub mod frame;
pub mod gallery;
pub mod liveness;
pub mod locator;
pub mod matcher;
pub mod model_spec;
pub mod recognizer;
pub mod types;

pub use access::{AccessConfig, AccessControl, AccessError, AccessOutcome, EnrollOutcome};
pub use classifier::{ModelCache, OnnxSpoofClassifier, SpoofClassifier};
pub use gallery::{EventLog, GalleryError, GalleryStore};
pub use liveness::{FusionConfig, LivenessError, LivenessFusion};
pub use locator::{FaceLocator, OnnxFaceLocator};
pub use matcher::{FirstMatch, MatchOutcome, Matcher};
pub use model_spec::ModelSpec;
pub use types::{
    AccessAction, BoundingBox, Embedding, FaceDetection, GalleryEntry, Liveness, LivenessVerdict,
    PredictionVector,
};
