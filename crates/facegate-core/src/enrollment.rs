//! Selection of enrollment captures and template construction.

use crate::features::{Extraction, FeatureDescriptor};
use crate::pipeline::{CaptureAnalysis, PipelineError};
use crate::policy::Policy;
use crate::template::{Template, MIN_CAPTURES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollmentError {
    #[error("{accepted} captures accepted, {required} required")]
    InsufficientCaptures { accepted: usize, required: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    DecodeError,
    NoFaceDetected,
    ExtractionFailed,
    LowQuality,
}

impl From<&PipelineError> for RejectionReason {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::Decode(_) => RejectionReason::DecodeError,
            PipelineError::NoFace => RejectionReason::NoFaceDetected,
        }
    }
}

/// Why one submitted image was not used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRejection {
    /// Position of the image in the submitted list.
    pub index: usize,
    pub reason: RejectionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentPolicy {
    pub min_captures: usize,
    /// Captures must score strictly above this overall quality.
    pub quality_floor: f32,
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self {
            min_captures: MIN_CAPTURES,
            quality_floor: 0.7,
        }
    }
}

impl From<&Policy> for EnrollmentPolicy {
    fn from(policy: &Policy) -> Self {
        Self {
            quality_floor: policy.enroll_quality_floor,
            ..Self::default()
        }
    }
}

/// Accepted descriptors and per-capture rejections, in submission order.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub accepted: Vec<FeatureDescriptor>,
    pub rejections: Vec<CaptureRejection>,
}

impl EnrollmentPolicy {
    /// Accept or reject a single analyzed capture.
    pub fn screen(&self, index: usize, analysis: CaptureAnalysis) -> Result<FeatureDescriptor, CaptureRejection> {
        let quality = analysis.quality.overall;
        let reject = |reason| CaptureRejection { index, reason, quality: Some(quality) };

        if quality <= self.quality_floor {
            return Err(reject(RejectionReason::LowQuality));
        }
        match analysis.extraction {
            Extraction::Failed(_) => Err(reject(RejectionReason::ExtractionFailed)),
            extraction => extraction
                .into_descriptor()
                .ok_or_else(|| reject(RejectionReason::ExtractionFailed)),
        }
    }

    pub fn select<I>(&self, outcomes: I) -> Selection
    where
        I: IntoIterator<Item = Result<CaptureAnalysis, RejectionReason>>,
    {
        let mut selection = Selection::default();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let screened = match outcome {
                Ok(analysis) => self.screen(index, analysis),
                Err(reason) => Err(CaptureRejection { index, reason, quality: None }),
            };
            match screened {
                Ok(descriptor) => selection.accepted.push(descriptor),
                Err(rejection) => {
                    tracing::debug!(index, reason = ?rejection.reason, quality = ?rejection.quality, "enrollment capture rejected");
                    selection.rejections.push(rejection);
                }
            }
        }
        selection
    }

    /// Aggregate the accepted captures into a template.
    pub fn build(&self, selection: &Selection) -> Result<Template, EnrollmentError> {
        let required = self.min_captures.max(MIN_CAPTURES);
        if selection.accepted.len() < required {
            return Err(EnrollmentError::InsufficientCaptures {
                accepted: selection.accepted.len(),
                required,
            });
        }
        Template::aggregate(&selection.accepted).map_err(|_| EnrollmentError::InsufficientCaptures {
            accepted: selection.accepted.len(),
            required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::CapturedImage;
    use crate::features::{FeatureError, HISTOGRAM_BINS, MOMENT_COUNT, TEXTURE_BINS};
    use crate::quality::QualityReport;
    use crate::types::FaceRegion;
    use image::RgbImage;

    fn descriptor(v: f32) -> FeatureDescriptor {
        FeatureDescriptor {
            histogram: [v; HISTOGRAM_BINS],
            texture: [v; TEXTURE_BINS],
            moments: [v * 1e-3; MOMENT_COUNT],
            edge_density: 0.1,
            color_mean: None,
            gradient_mean: [v, v],
        }
    }

    fn analysis(quality: f32, extraction: Extraction) -> CaptureAnalysis {
        CaptureAnalysis {
            image: CapturedImage::from_raster(RgbImage::new(4, 4)),
            face: FaceRegion::from_xywh(0, 0, 4, 4),
            extraction,
            quality: QualityReport { overall: quality, ..QualityReport::default() },
        }
    }

    #[test]
    fn test_two_good_captures_enroll() {
        let policy = EnrollmentPolicy::default();
        let selection = policy.select(vec![
            Ok(analysis(0.8, Extraction::Complete(descriptor(1.0)))),
            Ok(analysis(0.85, Extraction::Complete(descriptor(3.0)))),
        ]);
        assert!(selection.rejections.is_empty());
        let template = policy.build(&selection).unwrap();
        assert_eq!(template.capture_count, 2);
        assert_eq!(template.descriptor.histogram[0], 2.0);
    }

    #[test]
    fn test_poor_captures_insufficient() {
        let policy = EnrollmentPolicy::default();
        let selection = policy.select(vec![
            Ok(analysis(0.2, Extraction::Complete(descriptor(1.0)))),
            Ok(analysis(0.25, Extraction::Complete(descriptor(2.0)))),
        ]);
        assert_eq!(selection.rejections.len(), 2);
        assert!(selection.rejections.iter().all(|r| r.reason == RejectionReason::LowQuality));
        assert_eq!(
            policy.build(&selection),
            Err(EnrollmentError::InsufficientCaptures { accepted: 0, required: 2 })
        );
    }

    #[test]
    fn test_floor_is_strict() {
        let policy = EnrollmentPolicy::default();
        let rejected = policy.screen(0, analysis(0.7, Extraction::Complete(descriptor(1.0))));
        assert_eq!(rejected.unwrap_err().reason, RejectionReason::LowQuality);
        assert!(policy.screen(0, analysis(0.7001, Extraction::Complete(descriptor(1.0)))).is_ok());
    }

    #[test]
    fn test_mixed_outcomes_keep_indices() {
        let policy = EnrollmentPolicy::default();
        let selection = policy.select(vec![
            Err(RejectionReason::NoFaceDetected),
            Ok(analysis(0.9, Extraction::Failed(FeatureError::EmptyCrop))),
            Ok(analysis(
                0.9,
                Extraction::Degraded { descriptor: descriptor(1.0), reasons: vec![FeatureError::ZeroMass] },
            )),
            Err(RejectionReason::DecodeError),
            Ok(analysis(0.95, Extraction::Complete(descriptor(2.0)))),
        ]);
        assert_eq!(selection.accepted.len(), 2);
        let reasons: Vec<_> = selection.rejections.iter().map(|r| (r.index, r.reason)).collect();
        assert_eq!(
            reasons,
            vec![
                (0, RejectionReason::NoFaceDetected),
                (1, RejectionReason::ExtractionFailed),
                (3, RejectionReason::DecodeError),
            ]
        );
        assert!(policy.build(&selection).is_ok());
    }

    #[test]
    fn test_policy_from_assurance() {
        let mut policy = Policy::standard();
        policy.enroll_quality_floor = 0.75;
        assert_eq!(EnrollmentPolicy::from(&policy).quality_floor, 0.75);
    }
}
