//! Access-control orchestration: liveness, identification, event logging.
//!
//! Model inference and storage calls are blocking, so they run on tokio's
//! blocking pool; the async methods are safe to call from request handlers.

use crate::frame::{self, FrameError};
use crate::gallery::{EventLog, GalleryError, GalleryStore};
use crate::liveness::{LivenessError, LivenessFusion};
use crate::locator::{FaceLocator, LocatorError};
use crate::matcher::{FirstMatch, MatchOutcome, Matcher, DEFAULT_TOLERANCE};
use crate::types::{AccessAction, FaceDetection, LivenessVerdict};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("input rejected: {0}")]
    InputRejected(String),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("liveness: {0}")]
    Liveness(#[from] LivenessError),
    #[error("face locator: {0}")]
    Locator(#[from] LocatorError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Result of a pass attempt. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessOutcome {
    Granted { identity: String, action: AccessAction },
    SpoofRejected(LivenessVerdict),
    NoFaceDetected,
    UnknownIdentity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Enrolled { id: i64, identity: String },
    NoFaceDetected,
}

#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Maximum embedding distance for a positive match.
    pub tolerance: f32,
    /// Resize non-3:4 frames before the aspect gate.
    pub conform_aspect: bool,
    /// Run ensemble members on the blocking pool in parallel.
    pub concurrent: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            conform_aspect: true,
            concurrent: false,
        }
    }
}

pub struct AccessControl {
    locator: Arc<dyn FaceLocator>,
    fusion: Arc<LivenessFusion>,
    gallery: Arc<dyn GalleryStore>,
    events: Arc<dyn EventLog>,
    config: AccessConfig,
}

async fn blocking<T, F>(f: F) -> Result<T, AccessError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AccessError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AccessError::Worker(e.to_string()))?
}

impl AccessControl {
    pub fn new(
        locator: Arc<dyn FaceLocator>,
        fusion: LivenessFusion,
        gallery: Arc<dyn GalleryStore>,
        events: Arc<dyn EventLog>,
        config: AccessConfig,
    ) -> Self {
        Self {
            locator,
            fusion: Arc::new(fusion),
            gallery,
            events,
            config,
        }
    }

    pub fn fusion(&self) -> &LivenessFusion {
        &self.fusion
    }

    /// Admit a person in or out.
    ///
    /// Order: decode, conform, 3:4 gate, locate, liveness, embed, match, log.
    /// Nothing past a failed step runs.
    pub async fn pass(
        &self,
        image_bytes: &[u8],
        action: AccessAction,
    ) -> Result<AccessOutcome, AccessError> {
        let image = Arc::new(self.admit_frame(image_bytes)?);

        let Some(face) = self.locate(&image).await? else {
            tracing::info!(%action, "access denied: no face detected");
            return Ok(AccessOutcome::NoFaceDetected);
        };

        let verdict = match self.liveness(&image, &face).await {
            Ok(v) => v,
            Err(AccessError::Liveness(LivenessError::NoFaceDetected)) => {
                return Ok(AccessOutcome::NoFaceDetected)
            }
            Err(e) => return Err(e),
        };
        if !verdict.is_live() {
            tracing::info!(%action, score = verdict.confidence, "access denied: spoof");
            return Ok(AccessOutcome::SpoofRejected(verdict));
        }

        let locator = Arc::clone(&self.locator);
        let gallery = Arc::clone(&self.gallery);
        let probe_image = Arc::clone(&image);
        let (probe, entries) = blocking(move || {
            let probe = locator.embed(&probe_image, &face)?;
            let entries = gallery.enumerate()?;
            Ok((probe, entries))
        })
        .await?;

        let entry = match FirstMatch.find(&probe, &entries, self.config.tolerance) {
            MatchOutcome::Identified { entry, distance } => {
                tracing::debug!(identity = %entry.identity, distance, "gallery match");
                entry.clone()
            }
            MatchOutcome::Unknown => {
                tracing::info!(%action, gallery = entries.len(), "access denied: unknown identity");
                return Ok(AccessOutcome::UnknownIdentity);
            }
        };

        let events = Arc::clone(&self.events);
        let logged = entry.clone();
        if let Err(e) = blocking(move || Ok(events.record(&logged, action)?)).await {
            tracing::warn!(identity = %entry.identity, %action, error = %e, "failed to record access event");
        }

        tracing::info!(identity = %entry.identity, %action, "access granted");
        Ok(AccessOutcome::Granted {
            identity: entry.identity,
            action,
        })
    }

    /// Enroll an identity from one frame. No liveness check is made.
    pub async fn enroll(
        &self,
        identity: &str,
        image_bytes: &[u8],
    ) -> Result<EnrollOutcome, AccessError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(AccessError::InputRejected("identity must not be empty".into()));
        }
        let image = Arc::new(frame::decode_frame(image_bytes)?);

        let Some(face) = self.locate(&image).await? else {
            tracing::info!(identity, "enrollment refused: no face detected");
            return Ok(EnrollOutcome::NoFaceDetected);
        };

        let locator = Arc::clone(&self.locator);
        let gallery = Arc::clone(&self.gallery);
        let name = identity.to_string();
        let id = blocking(move || {
            let embedding = locator.embed(&image, &face)?;
            let reference = frame::encode_reference_jpeg(&image)?;
            Ok(gallery.append(&name, &embedding, Some(&reference))?)
        })
        .await?;

        tracing::info!(id, identity, "identity enrolled");
        Ok(EnrollOutcome::Enrolled {
            id,
            identity: identity.to_string(),
        })
    }

    /// Liveness only, no identification.
    pub async fn check_liveness(&self, image_bytes: &[u8]) -> Result<LivenessVerdict, AccessError> {
        let image = Arc::new(self.admit_frame(image_bytes)?);
        let face = self.locate(&image).await?.ok_or(AccessError::NoFaceDetected)?;
        match self.liveness(&image, &face).await {
            Err(AccessError::Liveness(LivenessError::NoFaceDetected)) => {
                Err(AccessError::NoFaceDetected)
            }
            other => other,
        }
    }

    fn admit_frame(&self, image_bytes: &[u8]) -> Result<RgbImage, AccessError> {
        let mut image = frame::decode_frame(image_bytes)?;
        if self.config.conform_aspect {
            image = frame::conform_aspect(image);
        }
        self.fusion.check_image(&image).map_err(|e| match e {
            LivenessError::InputRejected { .. } => AccessError::InputRejected(e.to_string()),
            other => AccessError::Liveness(other),
        })?;
        Ok(image)
    }

    async fn locate(&self, image: &Arc<RgbImage>) -> Result<Option<FaceDetection>, AccessError> {
        let locator = Arc::clone(&self.locator);
        let image = Arc::clone(image);
        blocking(move || Ok(locator.locate(&image)?)).await
    }

    async fn liveness(
        &self,
        image: &Arc<RgbImage>,
        face: &FaceDetection,
    ) -> Result<LivenessVerdict, AccessError> {
        let bbox = face.bbox();
        if self.config.concurrent {
            return Ok(self
                .fusion
                .evaluate_concurrent(Arc::clone(image), Some(&bbox))
                .await?);
        }
        let fusion = Arc::clone(&self.fusion);
        let image = Arc::clone(image);
        blocking(move || Ok(fusion.evaluate(&image, Some(&bbox))?)).await
    }
}
