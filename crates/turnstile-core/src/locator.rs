//! Face location and embedding glue.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Embedding, FaceDetection};
use image::RgbImage;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model lock poisoned")]
    Poisoned,
}

/// Finds the face to act on and turns it into an embedding.
pub trait FaceLocator: Send + Sync {
    /// The most confident face in the frame, if any.
    fn locate(&self, image: &RgbImage) -> Result<Option<FaceDetection>, LocatorError>;

    fn embed(&self, image: &RgbImage, face: &FaceDetection) -> Result<Embedding, LocatorError>;
}

/// SCRFD detection plus ArcFace embedding.
pub struct OnnxFaceLocator {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxFaceLocator {
    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, LocatorError> {
        Ok(Self {
            detector: Mutex::new(FaceDetector::load(detector_path)?),
            recognizer: Mutex::new(FaceRecognizer::load(recognizer_path)?),
        })
    }
}

impl FaceLocator for OnnxFaceLocator {
    fn locate(&self, image: &RgbImage) -> Result<Option<FaceDetection>, LocatorError> {
        let mut detector = self.detector.lock().map_err(|_| LocatorError::Poisoned)?;
        let faces = detector.detect(image)?;
        tracing::debug!(count = faces.len(), "faces detected");
        Ok(faces.into_iter().next())
    }

    fn embed(&self, image: &RgbImage, face: &FaceDetection) -> Result<Embedding, LocatorError> {
        let mut recognizer = self.recognizer.lock().map_err(|_| LocatorError::Poisoned)?;
        Ok(recognizer.extract(image, face)?)
    }
}
