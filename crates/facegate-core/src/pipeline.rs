//! The per-capture pipeline: decode, locate, extract, assess, and compare
//! against a stored template.

use crate::cascade::{CascadeDetector, CascadeModel, CascadeParams};
use crate::decode::{CapturedImage, DecodeError, ImageInput};
use crate::detector::{DetectorError, FaceDetector, ScrfdDetector, SCRFD_DEFAULT_CONFIDENCE};
use crate::eyes::DarkBlobEyeDetector;
use crate::features::{self, Extraction};
use crate::gate::{self, SecurityChecks};
use crate::locator::{FaceLocator, LocatorConfig};
use crate::matcher::{self, MatchDecision, MatchScores};
use crate::policy::{DetectorSet, Policy};
use crate::quality::{QualityAssessor, QualityReport, QualityWeights};
use crate::template::Template;
use crate::types::FaceRegion;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the SeetaFace frontal cascade inside the model directory.
pub const CASCADE_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";
/// File name of the SCRFD detector inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no face detected")]
    NoFace,
}

/// Everything learned from one capture.
#[derive(Debug, Clone)]
pub struct CaptureAnalysis {
    pub image: CapturedImage,
    pub face: FaceRegion,
    pub extraction: Extraction,
    pub quality: QualityReport,
}

pub struct Pipeline {
    locator: FaceLocator,
    assessor: QualityAssessor,
}

impl Pipeline {
    pub fn new(locator: FaceLocator, assessor: QualityAssessor) -> Self {
        Self { locator, assessor }
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.locator.detector_names()
    }

    pub fn analyze(&mut self, input: &ImageInput) -> Result<CaptureAnalysis, PipelineError> {
        let image = input.decode()?;
        self.analyze_image(image)
    }

    pub fn analyze_image(&mut self, image: CapturedImage) -> Result<CaptureAnalysis, PipelineError> {
        let face = self.locator.locate(&image.raster).ok_or(PipelineError::NoFace)?;
        let extraction = features::extract(&image.raster, &face);
        let quality = self.assessor.assess(&image.raster, &face);

        tracing::debug!(
            width = face.width(),
            height = face.height(),
            quality = quality.overall,
            degraded = extraction.is_degraded(),
            "capture analyzed"
        );

        Ok(CaptureAnalysis {
            image,
            face,
            extraction,
            quality,
        })
    }
}

/// Builds one [`Pipeline`] per worker thread.
///
/// Detectors hold mutable inference state, so every worker owns its own
/// instances; the factory only carries what they are built from.
pub trait PipelineFactory: Send + Sync {
    fn build(&self) -> Result<Pipeline, DetectorError>;
}

/// Factory backed by model files on disk.
pub struct ModelPipelineFactory {
    cascade: CascadeModel,
    cascade_params: CascadeParams,
    scrfd_path: Option<PathBuf>,
    scrfd_confidence: f32,
    locator: LocatorConfig,
    weights: QualityWeights,
}

impl ModelPipelineFactory {
    /// Read and validate the models `detectors` needs from `model_dir`.
    pub fn load(
        model_dir: &Path,
        detectors: DetectorSet,
        locator: LocatorConfig,
        weights: QualityWeights,
    ) -> Result<Self, DetectorError> {
        let cascade = CascadeModel::from_file(&model_dir.join(CASCADE_MODEL_FILE))?;
        let scrfd_path = if detectors.uses_scrfd() {
            let path = model_dir.join(SCRFD_MODEL_FILE);
            if !path.exists() {
                return Err(DetectorError::ModelNotFound(path.display().to_string()));
            }
            Some(path)
        } else {
            None
        };
        Ok(Self {
            cascade,
            cascade_params: CascadeParams::default(),
            scrfd_path,
            scrfd_confidence: SCRFD_DEFAULT_CONFIDENCE,
            locator,
            weights,
        })
    }
}

impl PipelineFactory for ModelPipelineFactory {
    fn build(&self) -> Result<Pipeline, DetectorError> {
        let mut detectors: Vec<Box<dyn FaceDetector>> =
            vec![Box::new(CascadeDetector::new(&self.cascade, &self.cascade_params)?)];
        if let Some(path) = &self.scrfd_path {
            detectors.push(Box::new(ScrfdDetector::load(path, self.scrfd_confidence)?));
        }
        Ok(Pipeline::new(
            FaceLocator::new(detectors, self.locator.clone()),
            QualityAssessor::new(self.weights.clone(), Box::new(DarkBlobEyeDetector::default())),
        ))
    }
}

/// Result of comparing an analyzed capture with a template.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub scores: MatchScores,
    pub decision: MatchDecision,
    pub checks: SecurityChecks,
}

impl Verdict {
    /// Match decision and security gate both passed.
    pub fn success(&self) -> bool {
        self.decision.matched && self.checks.overall_security
    }
}

/// Compare `analysis` with `template` under `policy`, using the profile's
/// own decision `threshold`.
///
/// Returns `None` when the capture has no usable descriptor.
pub fn compare(analysis: &CaptureAnalysis, template: &Template, policy: &Policy, threshold: f32) -> Option<Verdict> {
    let descriptor = analysis.extraction.descriptor()?;
    let scores = policy.metric_set().compare(descriptor, &template.descriptor);
    let decision = matcher::decide(&scores, &analysis.quality, policy, threshold);
    let checks = gate::evaluate(
        policy,
        &analysis.image,
        &analysis.face,
        &analysis.quality,
        &scores,
        decision.confidence,
    );
    Some(Verdict { scores, decision, checks })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_flat_image_has_no_face() {
        let mut pipeline = stub_pipeline();
        let err = pipeline.analyze(&ImageInput::Bytes(flat_png([200, 200, 200]))).unwrap_err();
        assert!(matches!(err, PipelineError::NoFace));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let mut pipeline = stub_pipeline();
        let err = pipeline.analyze(&ImageInput::Bytes(b"nope".to_vec())).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_analyze_face() {
        let mut pipeline = stub_pipeline();
        let analysis = pipeline.analyze(&ImageInput::Bytes(face_png(1))).unwrap();
        assert_eq!(analysis.face, FaceRegion::from_xywh(80, 80, 160, 160));
        assert!(analysis.extraction.descriptor().is_some());
        assert!((0.0..=1.0).contains(&analysis.quality.overall));
        assert_eq!(pipeline.detector_names(), vec!["content"]);
    }

    #[test]
    fn test_self_template_scores_at_least_stranger() {
        let mut pipeline = stub_pipeline();
        let own: Vec<_> = [1, 1]
            .iter()
            .map(|&s| pipeline.analyze(&ImageInput::Bytes(face_png(s))).unwrap())
            .collect();
        let stranger = pipeline.analyze(&ImageInput::Bytes(face_png(9))).unwrap();
        let template = Template::aggregate(&[
            own[0].extraction.descriptor().unwrap().clone(),
            own[1].extraction.descriptor().unwrap().clone(),
        ])
        .unwrap();

        let policy = Policy::standard();
        let mine = compare(&own[0], &template, &policy, 0.6).unwrap();
        let theirs = compare(&stranger, &template, &policy, 0.6).unwrap();
        assert!(mine.scores.method_confidence >= theirs.scores.method_confidence);
        assert!(mine.scores.distance > 0.99);
    }
}
