//! facegate-core — face verification pipeline.
//!
//! Decodes a capture, locates the face, extracts a handcrafted descriptor,
//! scores image quality, and fuses several similarity metrics against an
//! enrolled template behind a security gate.

pub mod cascade;
pub mod decode;
pub mod detector;
pub mod enhance;
pub mod enrollment;
pub mod eyes;
pub mod features;
pub mod gate;
pub mod locator;
pub mod matcher;
pub mod moments;
pub mod pipeline;
pub mod policy;
pub mod quality;
pub mod result;
pub mod template;
pub mod types;

pub use decode::{CapturedImage, DecodeError, ImageInput};
pub use detector::{DetectorError, FaceDetector};
pub use enrollment::{CaptureRejection, EnrollmentPolicy, RejectionReason};
pub use features::{Extraction, FeatureDescriptor};
pub use gate::{SecurityChecks, SecurityLevel};
pub use matcher::{MatchScores, MetricSet, SimilarityMetric};
pub use pipeline::{CaptureAnalysis, Pipeline, PipelineError, PipelineFactory};
pub use policy::{AssuranceLevel, DetectorSet, Policy};
pub use quality::{QualityReport, QualityWeights};
pub use result::{EnrollmentResult, ErrorCode, Outcome, VerificationMode, VerificationResult};
pub use template::{Template, TemplateError};
pub use types::{Candidate, FaceRegion};
