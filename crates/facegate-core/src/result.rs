//! Caller-facing verification and enrollment results.

use crate::enrollment::CaptureRejection;
use crate::gate::SecurityChecks;
use crate::matcher::{MatchFailure, MatchScores};
use crate::pipeline::Verdict;
use crate::quality::QualityReport;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Matched,
    Rejected,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    Automatic,
    /// Approved by an operator without biometric comparison.
    ManualOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorStatus {
    Complete,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DecodeError,
    NoFaceDetected,
    LowQuality,
    ProfileNotFound,
    ProfileInactive,
    InsufficientReferenceImages,
    TemplateCorrupt,
    InternalError,
    NotVerified,
    SecurityCheckFailed,
    Timeout,
    EngineBusy,
}

impl ErrorCode {
    pub fn outcome(&self) -> Outcome {
        match self {
            ErrorCode::TemplateCorrupt | ErrorCode::InternalError | ErrorCode::Timeout | ErrorCode::EngineBusy => {
                Outcome::Errored
            }
            _ => Outcome::Rejected,
        }
    }

    /// What the person at the camera, or the operator, should do next.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::DecodeError => "The image could not be read. Capture a new photo and try again.",
            ErrorCode::NoFaceDetected => "No face detected. Face the camera directly in good lighting.",
            ErrorCode::LowQuality => "Image quality too low. Improve lighting and hold still.",
            ErrorCode::ProfileNotFound => "No facial profile is enrolled for this person. Enrollment is required.",
            ErrorCode::ProfileInactive => "The facial profile is deactivated. Contact an administrator.",
            ErrorCode::InsufficientReferenceImages => {
                "At least two good-quality images are required. Capture more images and retry enrollment."
            }
            ErrorCode::TemplateCorrupt => "The stored facial profile is unreadable. Re-enrollment is required.",
            ErrorCode::InternalError => "Verification failed due to an internal error. Try again.",
            ErrorCode::NotVerified => "Face not verified: confidence too low.",
            ErrorCode::SecurityCheckFailed => "Face matched but security checks failed. Try again facing the camera.",
            ErrorCode::Timeout => "Verification timed out. Try again.",
            ErrorCode::EngineBusy => "The verification service is busy. Try again shortly.",
        }
    }

    pub fn requires_enrollment(&self) -> bool {
        matches!(self, ErrorCode::ProfileNotFound | ErrorCode::TemplateCorrupt)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub outcome: Outcome,
    pub mode: VerificationMode,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<MatchScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_checks: Option<SecurityChecks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<DescriptorStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub requires_enrollment: bool,
}

impl VerificationResult {
    /// Short-circuit result with zero confidence.
    pub fn failure(code: ErrorCode) -> Self {
        Self {
            success: false,
            outcome: code.outcome(),
            mode: VerificationMode::Automatic,
            confidence: 0.0,
            scores: None,
            quality: None,
            security_checks: None,
            descriptor: None,
            error: Some(code),
            message: Some(code.message().to_string()),
            requires_enrollment: code.requires_enrollment(),
        }
    }

    /// Zero-confidence failure that still reports the capture's quality.
    pub fn failure_with_quality(code: ErrorCode, quality: QualityReport) -> Self {
        Self {
            quality: Some(quality),
            ..Self::failure(code)
        }
    }

    /// Full result of an automatic comparison.
    pub fn from_verdict(verdict: Verdict, quality: QualityReport, degraded: bool) -> Self {
        let success = verdict.success();
        let error = if success {
            None
        } else if let Some(failure) = verdict.decision.failure {
            Some(match failure {
                MatchFailure::LowQuality => ErrorCode::LowQuality,
                _ => ErrorCode::NotVerified,
            })
        } else {
            Some(ErrorCode::SecurityCheckFailed)
        };

        let message = match (error, verdict.decision.failure) {
            (None, _) => format!("Face verified ({:.1}% confidence).", verdict.decision.confidence * 100.0),
            (Some(ErrorCode::NotVerified), Some(MatchFailure::DistanceFloor)) => {
                "Face not verified: features differ from the enrolled profile.".to_string()
            }
            (Some(ErrorCode::NotVerified), Some(MatchFailure::CosineFloor)) => {
                "Face not verified: feature similarity below the required level.".to_string()
            }
            (Some(ErrorCode::SecurityCheckFailed), _) => {
                format!("{} Failed: {}.", ErrorCode::SecurityCheckFailed.message(), verdict.checks.failed().join(", "))
            }
            (Some(code), _) => code.message().to_string(),
        };

        Self {
            success,
            outcome: if success { Outcome::Matched } else { Outcome::Rejected },
            mode: VerificationMode::Automatic,
            confidence: verdict.decision.confidence,
            scores: Some(verdict.scores),
            quality: Some(quality),
            security_checks: Some(verdict.checks),
            descriptor: Some(if degraded { DescriptorStatus::Degraded } else { DescriptorStatus::Complete }),
            error,
            message: Some(message),
            requires_enrollment: false,
        }
    }

    /// Operator approval that bypassed biometric comparison.
    pub fn manual_override(operator: &str) -> Self {
        Self {
            success: true,
            outcome: Outcome::Matched,
            mode: VerificationMode::ManualOverride,
            confidence: 0.0,
            scores: None,
            quality: None,
            security_checks: None,
            descriptor: None,
            error: None,
            message: Some(format!("Manually approved by {operator}.")),
            requires_enrollment: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    pub accepted_capture_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    /// A new profile was created rather than an existing template replaced.
    pub created: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<CaptureRejection>,
}

impl EnrollmentResult {
    pub fn failure(code: ErrorCode, accepted: usize, rejections: Vec<CaptureRejection>) -> Self {
        Self {
            success: false,
            message: Some(code.message().to_string()),
            error: Some(code),
            accepted_capture_count: accepted,
            profile_id: None,
            created: false,
            rejections,
        }
    }

    pub fn enrolled(profile_id: String, created: bool, accepted: usize, rejections: Vec<CaptureRejection>) -> Self {
        let verb = if created { "created" } else { "updated" };
        Self {
            success: true,
            message: Some(format!("Facial profile {verb} from {accepted} images.")),
            error: None,
            accepted_capture_count: accepted,
            profile_id: Some(profile_id),
            created,
            rejections,
        }
    }
}
