//! Anti-spoof ensemble fusion.
//!
//! Every ensemble member classifies its own patch of the face; the
//! per-class scores are summed and the arg-max decides. LIVE iff the winner
//! is the real class.

use crate::classifier::{ClassifierError, ModelCache, SpoofClassifier};
use crate::cropper::{CropError, PatchCropper};
use crate::frame;
use crate::model_spec::ModelSpec;
use crate::types::{BoundingBox, LivenessVerdict, PredictionVector};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fixed confidence normalization, tuned for the two-model ensemble.
///
/// Independent of the ensemble size.
pub const DEFAULT_CONFIDENCE_DIVISOR: f32 = 2.0;

/// Default per-model inference budget for concurrent evaluation.
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("frame is {width}x{height}; width/height must be 3/4")]
    InputRejected { width: u32, height: u32 },
    #[error("no face detected")]
    NoFaceDetected,
    #[error("anti-spoof model unavailable: {0}")]
    ModelUnavailable(String),
}

/// Why a member's prediction was left out of the sum.
#[derive(Error, Debug)]
enum MemberFailure {
    #[error("crop: {0}")]
    Crop(#[from] CropError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("worker: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Reject frames that are not exactly 3:4 (width/height).
    pub check_image: bool,
    pub confidence_divisor: f32,
    /// Shared deadline for every member in `evaluate_concurrent`.
    pub model_timeout: Duration,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            check_image: true,
            confidence_divisor: DEFAULT_CONFIDENCE_DIVISOR,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

/// One ensemble member: its input geometry and its loaded model.
#[derive(Clone)]
pub struct EnsembleMember {
    pub spec: ModelSpec,
    pub classifier: Arc<dyn SpoofClassifier>,
}

impl EnsembleMember {
    fn run(&self, image: &RgbImage, bbox: &BoundingBox) -> Result<PredictionVector, MemberFailure> {
        let crop = PatchCropper.crop(
            image,
            bbox,
            self.spec.scale,
            self.spec.width_input,
            self.spec.height_input,
            self.spec.crops(),
        )?;
        Ok(self.classifier.predict(&crop)?)
    }
}

/// Fuses an immutable, explicitly configured ensemble into one verdict.
#[derive(Clone)]
pub struct LivenessFusion {
    members: Vec<EnsembleMember>,
    config: FusionConfig,
}

impl LivenessFusion {
    pub fn new(members: Vec<EnsembleMember>, config: FusionConfig) -> Self {
        Self { members, config }
    }

    /// Build the ensemble from parsed specs and a loaded model cache.
    ///
    /// A model with no cache entry is a startup failure.
    pub fn from_cache(
        specs: &[ModelSpec],
        cache: &ModelCache,
        config: FusionConfig,
    ) -> Result<Self, LivenessError> {
        let members = specs
            .iter()
            .map(|spec| {
                cache
                    .get(&spec.identifier)
                    .map(|classifier| EnsembleMember {
                        spec: spec.clone(),
                        classifier,
                    })
                    .ok_or_else(|| LivenessError::ModelUnavailable(spec.identifier.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(members, config))
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// The 3:4 gate. Passes everything when `check_image` is off.
    pub fn check_image(&self, image: &RgbImage) -> Result<(), LivenessError> {
        if self.config.check_image && !frame::is_portrait_3_4(image.width(), image.height()) {
            tracing::warn!(
                width = image.width(),
                height = image.height(),
                "frame rejected: width/height must be 3/4"
            );
            return Err(LivenessError::InputRejected {
                width: image.width(),
                height: image.height(),
            });
        }
        Ok(())
    }

    /// Crop, classify and fuse every member sequentially.
    pub fn evaluate(
        &self,
        image: &RgbImage,
        bbox: Option<&BoundingBox>,
    ) -> Result<LivenessVerdict, LivenessError> {
        let bbox = self.admit(image, bbox)?;
        let start = Instant::now();

        let results: Vec<_> = self
            .members
            .iter()
            .map(|member| {
                let t = Instant::now();
                let result = member.run(image, bbox);
                tracing::debug!(
                    model = %member.spec.identifier,
                    elapsed_ms = t.elapsed().as_millis() as u64,
                    "anti-spoof member finished"
                );
                result
            })
            .collect();

        self.fuse(results, start.elapsed())
    }

    /// Like [`evaluate`](Self::evaluate), with members on the blocking pool.
    ///
    /// All members share one deadline; a member that misses it is excluded.
    /// Results are merged in ensemble order, so completion order never
    /// affects the verdict.
    pub async fn evaluate_concurrent(
        &self,
        image: Arc<RgbImage>,
        bbox: Option<&BoundingBox>,
    ) -> Result<LivenessVerdict, LivenessError> {
        let bbox = *self.admit(&image, bbox)?;
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.model_timeout;

        let handles: Vec<_> = self
            .members
            .iter()
            .cloned()
            .map(|member| {
                let image = Arc::clone(&image);
                tokio::task::spawn_blocking(move || member.run(&image, &bbox))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(r)) => r,
                Ok(Err(join_err)) => Err(MemberFailure::Worker(join_err.to_string())),
                Err(_) => Err(MemberFailure::Worker(format!(
                    "timed out after {:?}",
                    self.config.model_timeout
                ))),
            };
            results.push(result);
        }

        self.fuse(results, start.elapsed())
    }

    /// Gate checks shared by both evaluation paths. No model runs on failure.
    fn admit<'b>(
        &self,
        image: &RgbImage,
        bbox: Option<&'b BoundingBox>,
    ) -> Result<&'b BoundingBox, LivenessError> {
        self.check_image(image)?;
        let bbox = match bbox {
            Some(b) if b.is_valid() => b,
            _ => return Err(LivenessError::NoFaceDetected),
        };
        if self.members.is_empty() {
            return Err(LivenessError::ModelUnavailable("ensemble is empty".into()));
        }
        Ok(bbox)
    }

    /// Sum contributing predictions in ensemble order and decide.
    fn fuse(
        &self,
        results: Vec<Result<PredictionVector, MemberFailure>>,
        elapsed: Duration,
    ) -> Result<LivenessVerdict, LivenessError> {
        let mut total = PredictionVector::zeros();
        let mut used = 0usize;

        for (member, result) in self.members.iter().zip(results) {
            match result {
                Ok(p) => {
                    tracing::debug!(model = %member.spec.identifier, scores = ?p.scores(), "member prediction");
                    total += p;
                    used += 1;
                }
                Err(e) => {
                    tracing::warn!(model = %member.spec.identifier, error = %e, "member excluded from fusion");
                }
            }
        }

        if used == 0 {
            return Err(LivenessError::ModelUnavailable(
                "no ensemble member produced a prediction".into(),
            ));
        }

        let verdict = LivenessVerdict::from_scores(total, self.config.confidence_divisor, used);
        tracing::info!(
            label = verdict.label,
            score = verdict.confidence,
            live = verdict.is_live(),
            models = used,
            elapsed_ms = elapsed.as_millis() as u64,
            "liveness decided"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cropper::Crop;
    use crate::types::Liveness;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        output: PredictionVector,
        calls: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    impl SpoofClassifier for Counting {
        fn predict(&self, _crop: &Crop) -> Result<PredictionVector, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                std::thread::sleep(d);
            }
            Ok(self.output)
        }
    }

    struct Failing;

    impl SpoofClassifier for Failing {
        fn predict(&self, _crop: &Crop) -> Result<PredictionVector, ClassifierError> {
            Err(ClassifierError::InferenceFailed("boom".into()))
        }
    }

    fn member(name: &str, output: [f32; 3], calls: &Arc<AtomicUsize>) -> EnsembleMember {
        EnsembleMember {
            spec: ModelSpec::parse(name).unwrap(),
            classifier: Arc::new(Counting {
                output: PredictionVector(output),
                calls: Arc::clone(calls),
                delay: None,
            }),
        }
    }

    fn portrait() -> RgbImage {
        RgbImage::new(300, 400)
    }

    fn face() -> BoundingBox {
        BoundingBox::new(100, 120, 90, 110)
    }

    #[test]
    fn test_two_models_confidence_formula() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![
                member("2.7_80x80_MiniFASNetV2.onnx", [0.0, 2.0, 0.0], &calls),
                member("4_0_0_80x80_MiniFASNetV1SE.onnx", [0.0, 2.0, 0.0], &calls),
            ],
            FusionConfig::default(),
        );
        let v = fusion.evaluate(&portrait(), Some(&face())).unwrap();
        assert_eq!(v.scores, PredictionVector([0.0, 4.0, 0.0]));
        assert_eq!(v.label, 1);
        assert!((v.confidence - 2.0).abs() < 1e-6);
        assert_eq!(v.liveness, Liveness::Live);
        assert_eq!(v.models_used, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tie_between_fake_and_real_is_spoof() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![
                member("2.7_80x80_MiniFASNetV2.onnx", [0.9, 0.1, 0.0], &calls),
                member("org_1_80x80_MiniFASNetV1SE.onnx", [0.1, 0.9, 0.0], &calls),
            ],
            FusionConfig::default(),
        );
        let v = fusion.evaluate(&portrait(), Some(&face())).unwrap();
        assert_eq!(v.label, 0);
        assert_eq!(v.liveness, Liveness::Spoof);
    }

    #[test]
    fn test_divisor_is_fixed_not_model_count() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![
                member("2.7_80x80_A.onnx", [0.0, 1.0, 0.0], &calls),
                member("2.7_80x80_B.onnx", [0.0, 1.0, 0.0], &calls),
                member("2.7_80x80_C.onnx", [0.0, 1.0, 0.0], &calls),
            ],
            FusionConfig::default(),
        );
        let v = fusion.evaluate(&portrait(), Some(&face())).unwrap();
        assert!((v.confidence - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_aspect_runs_no_classifier() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![member("2.7_80x80_MiniFASNetV2.onnx", [0.0, 1.0, 0.0], &calls)],
            FusionConfig::default(),
        );
        for (w, h) in [(400, 300), (301, 400), (300, 401), (640, 480), (100, 100)] {
            let err = fusion.evaluate(&RgbImage::new(w, h), Some(&face())).unwrap_err();
            assert!(matches!(err, LivenessError::InputRejected { .. }), "{w}x{h}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_check_image_disabled_admits_any_aspect() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = FusionConfig { check_image: false, ..FusionConfig::default() };
        let fusion = LivenessFusion::new(
            vec![member("2.7_80x80_MiniFASNetV2.onnx", [0.0, 1.0, 0.0], &calls)],
            config,
        );
        assert!(fusion.evaluate(&RgbImage::new(640, 480), Some(&face())).is_ok());
    }

    #[test]
    fn test_invalid_box_runs_no_classifier() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![member("2.7_80x80_MiniFASNetV2.onnx", [0.0, 1.0, 0.0], &calls)],
            FusionConfig::default(),
        );
        for bbox in [
            None,
            Some(BoundingBox::new(10, 10, 0, 50)),
            Some(BoundingBox::new(10, 10, 50, -1)),
        ] {
            let err = fusion.evaluate(&portrait(), bbox.as_ref()).unwrap_err();
            assert!(matches!(err, LivenessError::NoFaceDetected));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_ensemble_fails_closed() {
        let fusion = LivenessFusion::new(vec![], FusionConfig::default());
        let err = fusion.evaluate(&portrait(), Some(&face())).unwrap_err();
        assert!(matches!(err, LivenessError::ModelUnavailable(_)));
    }

    #[test]
    fn test_failed_member_excluded_from_sum() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![
                EnsembleMember {
                    spec: ModelSpec::parse("2.7_80x80_Broken.onnx").unwrap(),
                    classifier: Arc::new(Failing),
                },
                member("4_0_0_80x80_MiniFASNetV1SE.onnx", [0.2, 0.7, 0.1], &calls),
            ],
            FusionConfig::default(),
        );
        let v = fusion.evaluate(&portrait(), Some(&face())).unwrap();
        assert_eq!(v.models_used, 1);
        assert_eq!(v.scores, PredictionVector([0.2, 0.7, 0.1]));
        assert!((v.confidence - 0.35).abs() < 1e-6);
    }

    #[test]
    fn test_all_members_failing_fails_closed() {
        let fusion = LivenessFusion::new(
            vec![EnsembleMember {
                spec: ModelSpec::parse("2.7_80x80_Broken.onnx").unwrap(),
                classifier: Arc::new(Failing),
            }],
            FusionConfig::default(),
        );
        let err = fusion.evaluate(&portrait(), Some(&face())).unwrap_err();
        assert!(matches!(err, LivenessError::ModelUnavailable(_)));
    }

    #[test]
    fn test_degenerate_crop_excluded() {
        // Box entirely outside the frame: every crop degenerates, nothing is classified.
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![member("2.7_80x80_MiniFASNetV2.onnx", [0.0, 1.0, 0.0], &calls)],
            FusionConfig::default(),
        );
        let outside = BoundingBox::new(1000, 1000, 50, 50);
        let err = fusion.evaluate(&portrait(), Some(&outside)).unwrap_err();
        assert!(matches!(err, LivenessError::ModelUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_from_cache_requires_every_model() {
        let mut cache = ModelCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let present = member("2.7_80x80_MiniFASNetV2.onnx", [0.0, 1.0, 0.0], &calls);
        cache.insert(&present.spec.identifier, present.classifier.clone());

        let specs = vec![
            present.spec.clone(),
            ModelSpec::parse("4_0_0_80x80_MiniFASNetV1SE.onnx").unwrap(),
        ];
        let err = LivenessFusion::from_cache(&specs, &cache, FusionConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, LivenessError::ModelUnavailable(id) if id.contains("MiniFASNetV1SE")));

        let ok = LivenessFusion::from_cache(&specs[..1], &cache, FusionConfig::default()).unwrap();
        assert_eq!(ok.members().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_matches_sequential() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![
                member("2.7_80x80_MiniFASNetV2.onnx", [0.1, 0.8, 0.1], &calls),
                member("4_0_0_80x80_MiniFASNetV1SE.onnx", [0.3, 0.6, 0.1], &calls),
            ],
            FusionConfig::default(),
        );
        let image = Arc::new(portrait());
        let seq = fusion.evaluate(&image, Some(&face())).unwrap();
        let con = fusion.evaluate_concurrent(Arc::clone(&image), Some(&face())).await.unwrap();
        assert_eq!(seq.scores, con.scores);
        assert_eq!(seq.label, con.label);
        assert_eq!(seq.confidence, con.confidence);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_timed_out_member_excluded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = EnsembleMember {
            spec: ModelSpec::parse("2.7_80x80_Slow.onnx").unwrap(),
            classifier: Arc::new(Counting {
                output: PredictionVector([5.0, 0.0, 0.0]),
                calls: Arc::clone(&calls),
                delay: Some(Duration::from_millis(500)),
            }),
        };
        let fast = member("4_0_0_80x80_Fast.onnx", [0.0, 0.9, 0.1], &calls);
        let config = FusionConfig {
            model_timeout: Duration::from_millis(50),
            ..FusionConfig::default()
        };
        let fusion = LivenessFusion::new(vec![slow, fast], config);

        let v = fusion
            .evaluate_concurrent(Arc::new(portrait()), Some(&face()))
            .await
            .unwrap();
        assert_eq!(v.models_used, 1);
        assert_eq!(v.scores, PredictionVector([0.0, 0.9, 0.1]));
        assert!(v.is_live());
    }

    #[tokio::test]
    async fn test_concurrent_gates_before_spawning() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fusion = LivenessFusion::new(
            vec![member("2.7_80x80_MiniFASNetV2.onnx", [0.0, 1.0, 0.0], &calls)],
            FusionConfig::default(),
        );
        let err = fusion
            .evaluate_concurrent(Arc::new(RgbImage::new(640, 480)), Some(&face()))
            .await
            .unwrap_err();
        assert!(matches!(err, LivenessError::InputRejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
