//! Assurance profiles: the decision knobs shared by matching, enrollment and
//! the security gate.

use crate::matcher::MetricSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f32 },
    #[error("face size bounds invalid: min {min} > max {max}")]
    FaceBounds { min: u32, max: u32 },
    #[error("unknown assurance level `{0}` (expected `standard` or `high`)")]
    UnknownLevel(String),
    #[error("unknown detector set `{0}` (expected `cascade` or `cascade+scrfd`)")]
    UnknownDetectors(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuranceLevel {
    #[default]
    Standard,
    High,
}

impl fmt::Display for AssuranceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssuranceLevel::Standard => "standard",
            AssuranceLevel::High => "high",
        })
    }
}

impl FromStr for AssuranceLevel {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(AssuranceLevel::Standard),
            "high" => Ok(AssuranceLevel::High),
            other => Err(PolicyError::UnknownLevel(other.to_string())),
        }
    }
}

/// Which face detectors run in the locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorSet {
    #[serde(rename = "cascade")]
    Cascade,
    #[serde(rename = "cascade+scrfd")]
    CascadeScrfd,
}

impl DetectorSet {
    pub fn uses_scrfd(&self) -> bool {
        matches!(self, DetectorSet::CascadeScrfd)
    }
}

impl fmt::Display for DetectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorSet::Cascade => "cascade",
            DetectorSet::CascadeScrfd => "cascade+scrfd",
        })
    }
}

impl FromStr for DetectorSet {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cascade" => Ok(DetectorSet::Cascade),
            "cascade+scrfd" => Ok(DetectorSet::CascadeScrfd),
            other => Err(PolicyError::UnknownDetectors(other.to_string())),
        }
    }
}

/// Decision thresholds for one assurance level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub level: AssuranceLevel,
    /// Threshold assigned to newly enrolled profiles.
    pub default_threshold: f32,
    /// Captures must score strictly above this to be enrolled.
    pub enroll_quality_floor: f32,
    pub verify_quality_floor: f32,
    pub liveness_floor: f32,
    pub symmetry_floor: f32,
    pub eye_floor: f32,
    pub distance_floor: f32,
    pub cosine_floor: Option<f32>,
    /// Largest allowed spread between individual metric scores.
    pub consensus_tolerance: f32,
    pub min_face: u32,
    pub max_face: u32,
    pub detectors: DetectorSet,
}

impl Policy {
    pub fn standard() -> Self {
        Self {
            level: AssuranceLevel::Standard,
            default_threshold: 0.6,
            enroll_quality_floor: 0.7,
            verify_quality_floor: 0.6,
            liveness_floor: 0.5,
            symmetry_floor: 0.6,
            eye_floor: 0.5,
            distance_floor: 0.5,
            cosine_floor: None,
            consensus_tolerance: 0.35,
            min_face: 50,
            max_face: 400,
            detectors: DetectorSet::Cascade,
        }
    }

    pub fn high() -> Self {
        Self {
            level: AssuranceLevel::High,
            default_threshold: 0.8,
            enroll_quality_floor: 0.7,
            verify_quality_floor: 0.7,
            liveness_floor: 0.8,
            symmetry_floor: 0.6,
            eye_floor: 1.0,
            distance_floor: 0.6,
            cosine_floor: Some(0.85),
            consensus_tolerance: 0.25,
            min_face: 80,
            max_face: 500,
            detectors: DetectorSet::CascadeScrfd,
        }
    }

    pub fn for_level(level: AssuranceLevel) -> Self {
        match level {
            AssuranceLevel::Standard => Self::standard(),
            AssuranceLevel::High => Self::high(),
        }
    }

    /// Similarity metrics fused at this level.
    pub fn metric_set(&self) -> MetricSet {
        match self.level {
            AssuranceLevel::Standard => MetricSet::standard(),
            AssuranceLevel::High => MetricSet::high_assurance(),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let unit = [
            ("default_threshold", Some(self.default_threshold)),
            ("enroll_quality_floor", Some(self.enroll_quality_floor)),
            ("verify_quality_floor", Some(self.verify_quality_floor)),
            ("liveness_floor", Some(self.liveness_floor)),
            ("symmetry_floor", Some(self.symmetry_floor)),
            ("eye_floor", Some(self.eye_floor)),
            ("distance_floor", Some(self.distance_floor)),
            ("cosine_floor", self.cosine_floor),
            ("consensus_tolerance", Some(self.consensus_tolerance)),
        ];
        for (name, value) in unit {
            if let Some(value) = value {
                if !(0.0..=1.0).contains(&value) {
                    return Err(PolicyError::OutOfRange { name, value });
                }
            }
        }
        if self.min_face > self.max_face {
            return Err(PolicyError::FaceBounds { min: self.min_face, max: self.max_face });
        }
        Ok(())
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::standard()
    }
}
