//! Security gate: independent checks that must all pass before a match is
//! accepted.

use crate::decode::CapturedImage;
use crate::locator::within_bounds;
use crate::matcher::MatchScores;
use crate::policy::Policy;
use crate::quality::QualityReport;
use crate::types::FaceRegion;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    Maximum,
    High,
    Medium,
    Low,
    Critical,
}

impl SecurityLevel {
    /// Grade a verification by its confidence and the fraction of passed checks.
    pub fn classify(confidence: f32, security_score: f32) -> Self {
        if confidence > 0.95 && security_score > 0.9 {
            SecurityLevel::Maximum
        } else if confidence > 0.9 && security_score > 0.8 {
            SecurityLevel::High
        } else if confidence > 0.8 && security_score > 0.7 {
            SecurityLevel::Medium
        } else if confidence > 0.6 {
            SecurityLevel::Low
        } else {
            SecurityLevel::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityChecks {
    pub image_quality: bool,
    pub liveness_detection: bool,
    pub face_size: bool,
    pub eye_detection: bool,
    pub symmetry_check: bool,
    pub multiple_method_consensus: bool,
    pub image_authenticity: bool,
    /// All of the above.
    pub overall_security: bool,
    /// Fraction of checks passed.
    pub security_score: f32,
    pub security_level: SecurityLevel,
}

impl SecurityChecks {
    fn named(&self) -> [(&'static str, bool); 7] {
        [
            ("image_quality", self.image_quality),
            ("liveness_detection", self.liveness_detection),
            ("face_size", self.face_size),
            ("eye_detection", self.eye_detection),
            ("symmetry_check", self.symmetry_check),
            ("multiple_method_consensus", self.multiple_method_consensus),
            ("image_authenticity", self.image_authenticity),
        ]
    }

    pub fn failed(&self) -> Vec<&'static str> {
        self.named().iter().filter(|(_, ok)| !ok).map(|(name, _)| *name).collect()
    }
}

/// Placeholder authenticity check: the capture came from a recognised
/// container and is at least as large as the smallest acceptable face.
pub fn image_authentic(image: &CapturedImage, min_face: u32) -> bool {
    image.format.is_some() && image.width() >= min_face && image.height() >= min_face
}

pub fn evaluate(
    policy: &Policy,
    image: &CapturedImage,
    face: &FaceRegion,
    quality: &QualityReport,
    scores: &MatchScores,
    confidence: f32,
) -> SecurityChecks {
    let mut checks = SecurityChecks {
        image_quality: quality.overall >= policy.verify_quality_floor,
        liveness_detection: quality.liveness >= policy.liveness_floor,
        face_size: within_bounds(face, policy.min_face, policy.max_face),
        eye_detection: quality.eyes >= policy.eye_floor,
        symmetry_check: quality.symmetry >= policy.symmetry_floor,
        multiple_method_consensus: scores.spread() <= policy.consensus_tolerance,
        image_authenticity: image_authentic(image, policy.min_face),
        overall_security: false,
        security_score: 0.0,
        security_level: SecurityLevel::Critical,
    };

    let named = checks.named();
    let passed = named.iter().filter(|(_, ok)| *ok).count();
    checks.overall_security = passed == named.len();
    checks.security_score = passed as f32 / named.len() as f32;
    checks.security_level = SecurityLevel::classify(confidence, checks.security_score);

    if !checks.overall_security {
        tracing::debug!(failed = ?checks.failed(), score = checks.security_score, "security checks failed");
    }
    checks
}
