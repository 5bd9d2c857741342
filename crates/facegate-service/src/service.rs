//! The verification façade: enrollment, verification, profile
//! administration and audited manual overrides.

use crate::config::{Config, ConfigError};
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use crate::store::{OverrideRecord, ProfileInfo, ProfileStore, StoreError};
use facegate_core::pipeline::{self, ModelPipelineFactory};
use facegate_core::template::MIN_CAPTURES;
use facegate_core::{
    AssuranceLevel, CaptureAnalysis, DetectorError, EnrollmentPolicy, EnrollmentResult, ErrorCode, ImageInput,
    PipelineError, Policy, QualityReport, RejectionReason, VerificationResult,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error("no profile enrolled for {0}")]
    ProfileNotFound(String),
    #[error("profile for {0} is deactivated")]
    ProfileInactive(String),
    #[error("{0}")]
    InvalidArgument(String),
}

/// Snapshot of the running service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub profiles: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub assurance: AssuranceLevel,
    pub detectors: Vec<String>,
    pub default_threshold: f32,
}

pub struct BiometricService {
    engine: EngineHandle,
    store: ProfileStore,
    policy: Policy,
    call_timeout: Duration,
}

impl BiometricService {
    /// Validate `config`, load the detector models, start the worker pool
    /// and open the profile store.
    pub async fn open(config: &Config) -> Result<Self, ServiceError> {
        config.validate()?;
        let policy = config.policy();

        let factory = ModelPipelineFactory::load(
            &config.model_dir,
            policy.detectors,
            config.locator(),
            config.quality_weights.clone(),
        )?;
        tracing::info!(model_dir = %config.model_dir.display(), detectors = %policy.detectors, "detector models loaded");

        let engine = spawn_engine(Arc::new(factory), config.workers, config.queue_capacity)?;
        let store = ProfileStore::open(&config.db_path).await?;
        tracing::info!(db = %config.db_path.display(), assurance = %policy.level, "profile store opened");

        Ok(Self::new(engine, store, policy, Duration::from_secs(config.call_timeout_secs)))
    }

    pub fn new(engine: EngineHandle, store: ProfileStore, policy: Policy, call_timeout: Duration) -> Self {
        Self {
            engine,
            store,
            policy,
            call_timeout,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Decide whether `image` shows the person enrolled as `identity`.
    ///
    /// Faults never escape as errors; they come back as `errored` results.
    pub async fn verify(&self, identity: &str, image: ImageInput) -> VerificationResult {
        match tokio::time::timeout(self.call_timeout, self.run_verify(identity, image)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(identity, timeout_secs = self.call_timeout.as_secs_f32(), "verification timed out");
                VerificationResult::failure(ErrorCode::Timeout)
            }
        }
    }

    async fn run_verify(&self, identity: &str, image: ImageInput) -> VerificationResult {
        let record = match self.store.get(identity).await {
            Ok(Some(record)) => record,
            Ok(None) => return VerificationResult::failure(ErrorCode::ProfileNotFound),
            Err(err) => {
                tracing::error!(identity, error = %err, "profile lookup failed");
                return VerificationResult::failure(ErrorCode::InternalError);
            }
        };
        if !record.info.is_active {
            return VerificationResult::failure(ErrorCode::ProfileInactive);
        }

        let template = match self.store.template(&record) {
            Ok(template) => template,
            Err(err) if err.is_corrupt_template() => {
                tracing::warn!(identity, error = %err, "stored template unreadable; flagging for re-enrollment");
                if let Err(err) = self.store.mark_needs_reenrollment(identity).await {
                    tracing::error!(identity, error = %err, "failed to flag profile for re-enrollment");
                }
                return VerificationResult::failure(ErrorCode::TemplateCorrupt);
            }
            Err(err) => {
                tracing::error!(identity, error = %err, "template load failed");
                return VerificationResult::failure(ErrorCode::InternalError);
            }
        };

        let analysis = match self.engine.analyze(image).await {
            Ok(analysis) => analysis,
            Err(EngineError::Pipeline(PipelineError::NoFace)) => {
                return VerificationResult::failure_with_quality(ErrorCode::NoFaceDetected, QualityReport::zero());
            }
            Err(err) => return VerificationResult::failure(engine_error_code(identity, &err)),
        };

        let Some(verdict) = pipeline::compare(&analysis, &template, &self.policy, record.info.threshold) else {
            tracing::warn!(identity, "capture produced no usable descriptor");
            return VerificationResult::failure_with_quality(ErrorCode::InternalError, analysis.quality);
        };
        let result = VerificationResult::from_verdict(verdict, analysis.quality, analysis.extraction.is_degraded());

        if let Err(err) = self.store.record_attempt(identity, result.success).await {
            tracing::error!(identity, error = %err, "failed to record verification attempt");
            return VerificationResult::failure(ErrorCode::InternalError);
        }

        tracing::info!(
            identity,
            success = result.success,
            confidence = result.confidence,
            error = ?result.error,
            degraded = analysis.extraction.is_degraded(),
            "verification completed"
        );
        result
    }

    /// Build a template from `images` and store it for `identity`,
    /// replacing any previous template.
    pub async fn enroll(&self, identity: &str, images: Vec<ImageInput>) -> EnrollmentResult {
        match tokio::time::timeout(self.call_timeout, self.run_enroll(identity, images)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(identity, timeout_secs = self.call_timeout.as_secs_f32(), "enrollment timed out");
                EnrollmentResult::failure(ErrorCode::Timeout, 0, Vec::new())
            }
        }
    }

    async fn run_enroll(&self, identity: &str, images: Vec<ImageInput>) -> EnrollmentResult {
        if images.len() < MIN_CAPTURES {
            return EnrollmentResult::failure(ErrorCode::InsufficientReferenceImages, 0, Vec::new());
        }

        let submitted = images.len();
        let mut outcomes: Vec<Result<CaptureAnalysis, RejectionReason>> = Vec::with_capacity(submitted);
        for analyzed in self.engine.analyze_many(images).await {
            outcomes.push(match analyzed {
                Ok(analysis) => Ok(analysis),
                Err(EngineError::Pipeline(err)) => Err(RejectionReason::from(&err)),
                Err(err) => return EnrollmentResult::failure(engine_error_code(identity, &err), 0, Vec::new()),
            });
        }

        let policy = EnrollmentPolicy::from(&self.policy);
        let selection = policy.select(outcomes);
        let accepted = selection.accepted.len();
        let template = match policy.build(&selection) {
            Ok(template) => template,
            Err(err) => {
                tracing::info!(identity, submitted, accepted, reason = %err, "enrollment rejected");
                return EnrollmentResult::failure(ErrorCode::InsufficientReferenceImages, accepted, selection.rejections);
            }
        };

        match self
            .store
            .upsert_template(identity, &template, self.policy.default_threshold)
            .await
        {
            Ok((profile_id, created)) => {
                tracing::info!(identity, profile_id = %profile_id, created, submitted, accepted, "profile enrolled");
                EnrollmentResult::enrolled(profile_id, created, accepted, selection.rejections)
            }
            Err(err) => {
                tracing::error!(identity, error = %err, "failed to store template");
                EnrollmentResult::failure(ErrorCode::InternalError, accepted, selection.rejections)
            }
        }
    }

    /// Operator approval without biometric comparison, written to the
    /// override audit trail.
    pub async fn manual_override(
        &self,
        identity: &str,
        operator: &str,
        reason: &str,
    ) -> Result<VerificationResult, ServiceError> {
        let (operator, reason) = (operator.trim(), reason.trim());
        if operator.is_empty() || reason.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "manual override requires an operator and a reason".into(),
            ));
        }
        let info = self.profile(identity).await?;
        if !info.is_active {
            return Err(ServiceError::ProfileInactive(identity.to_string()));
        }

        let record = self.store.insert_override(identity, operator, reason).await?;
        tracing::warn!(identity, operator, reason, override_id = %record.id, "manual override approved");
        Ok(VerificationResult::manual_override(operator))
    }

    pub async fn overrides(&self, identity: &str) -> Result<Vec<OverrideRecord>, ServiceError> {
        Ok(self.store.list_overrides(identity).await?)
    }

    pub async fn profile(&self, identity: &str) -> Result<ProfileInfo, ServiceError> {
        self.store
            .profile(identity)
            .await?
            .ok_or_else(|| ServiceError::ProfileNotFound(identity.to_string()))
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileInfo>, ServiceError> {
        Ok(self.store.list().await?)
    }

    pub async fn set_active(&self, identity: &str, active: bool) -> Result<(), ServiceError> {
        if !self.store.set_active(identity, active).await? {
            return Err(ServiceError::ProfileNotFound(identity.to_string()));
        }
        tracing::info!(identity, active, "profile activation changed");
        Ok(())
    }

    pub async fn set_threshold(&self, identity: &str, threshold: f32) -> Result<(), ServiceError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ServiceError::InvalidArgument(format!(
                "threshold must be within [0, 1], got {threshold}"
            )));
        }
        if !self.store.set_threshold(identity, threshold).await? {
            return Err(ServiceError::ProfileNotFound(identity.to_string()));
        }
        tracing::info!(identity, threshold, "profile threshold changed");
        Ok(())
    }

    pub async fn remove_profile(&self, identity: &str) -> Result<(), ServiceError> {
        if !self.store.remove(identity).await? {
            return Err(ServiceError::ProfileNotFound(identity.to_string()));
        }
        tracing::info!(identity, "profile removed");
        Ok(())
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            profiles: self.store.count().await?,
            workers: self.engine.workers(),
            queue_capacity: self.engine.queue_capacity(),
            assurance: self.policy.level,
            detectors: self.engine.detectors().iter().map(|d| d.to_string()).collect(),
            default_threshold: self.policy.default_threshold,
        })
    }
}

fn engine_error_code(identity: &str, err: &EngineError) -> ErrorCode {
    match err {
        EngineError::Pipeline(PipelineError::Decode(_)) => ErrorCode::DecodeError,
        EngineError::Pipeline(PipelineError::NoFace) => ErrorCode::NoFaceDetected,
        EngineError::Busy => {
            tracing::warn!(identity, "engine queue full");
            ErrorCode::EngineBusy
        }
        err => {
            tracing::error!(identity, error = %err, "engine failure");
            ErrorCode::InternalError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use facegate_core::{Outcome, PipelineFactory, VerificationMode};
    use std::path::Path;

    async fn service_with(policy: Policy, factory: Arc<dyn PipelineFactory>, timeout: Duration) -> BiometricService {
        let engine = spawn_engine(factory, 2, 8).unwrap();
        let store = ProfileStore::open(Path::new(":memory:")).await.unwrap();
        BiometricService::new(engine, store, policy, timeout)
    }

    async fn service(policy: Policy) -> BiometricService {
        service_with(policy, Arc::new(StubFactory), Duration::from_secs(30)).await
    }

    fn face(seed: u32) -> ImageInput {
        ImageInput::Bytes(face_png(seed))
    }

    async fn enrolled(identity: &str) -> BiometricService {
        let service = service(lenient_policy()).await;
        let result = service.enroll(identity, vec![face(1), face(1)]).await;
        assert!(result.success, "{result:?}");
        service
    }

    #[tokio::test]
    async fn test_enroll_two_good_captures() {
        let service = service(lenient_policy()).await;
        let result = service.enroll("emp-1", vec![face(1), face(2)]).await;
        assert!(result.success);
        assert!(result.created);
        assert_eq!(result.accepted_capture_count, 2);
        assert!(result.rejections.is_empty());

        let info = service.profile("emp-1").await.unwrap();
        assert!(info.is_active);
        assert_eq!(info.threshold, lenient_policy().default_threshold);
        assert_eq!(info.accepted_captures, 2);
    }

    #[tokio::test]
    async fn test_enroll_poor_captures_rejected() {
        let policy = Policy {
            enroll_quality_floor: 0.99,
            ..lenient_policy()
        };
        let service = service(policy).await;
        let result = service.enroll("emp-1", vec![face(1), face(2)]).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorCode::InsufficientReferenceImages));
        assert_eq!(result.accepted_capture_count, 0);
        assert_eq!(result.rejections.len(), 2);
        assert!(result.rejections.iter().all(|r| r.reason == RejectionReason::LowQuality));
        assert!(matches!(service.profile("emp-1").await, Err(ServiceError::ProfileNotFound(_))));
    }

    #[tokio::test]
    async fn test_enroll_single_image_rejected() {
        let service = service(lenient_policy()).await;
        let result = service.enroll("emp-1", vec![face(1)]).await;
        assert_eq!(result.error, Some(ErrorCode::InsufficientReferenceImages));
        assert_eq!(result.accepted_capture_count, 0);
    }

    #[tokio::test]
    async fn test_enroll_reports_each_rejection() {
        let service = service(lenient_policy()).await;
        let result = service
            .enroll(
                "emp-1",
                vec![face(1), ImageInput::Bytes(flat_png()), ImageInput::Base64("%%".into()), face(2)],
            )
            .await;
        assert!(result.success);
        assert_eq!(result.accepted_capture_count, 2);
        let reasons: Vec<_> = result.rejections.iter().map(|r| (r.index, r.reason)).collect();
        assert_eq!(
            reasons,
            vec![(1, RejectionReason::NoFaceDetected), (2, RejectionReason::DecodeError)]
        );
    }

    #[tokio::test]
    async fn test_reenroll_replaces_template() {
        let service = enrolled("emp-1").await;
        service.verify("emp-1", face(1)).await;
        let first = service.profile("emp-1").await.unwrap();

        let result = service.enroll("emp-1", vec![face(2), face(2), face(2)]).await;
        assert!(result.success);
        assert!(!result.created);
        assert_eq!(result.profile_id.as_deref(), Some(first.id.as_str()));

        let info = service.profile("emp-1").await.unwrap();
        assert_eq!(info.accepted_captures, 3);
        assert_eq!(info.total_attempts, 1);
    }

    #[tokio::test]
    async fn test_verify_matches_enrolled_face() {
        let service = enrolled("emp-1").await;
        let result = service.verify("emp-1", face(1)).await;

        assert!(result.success, "{result:?}");
        assert_eq!(result.outcome, Outcome::Matched);
        assert_eq!(result.mode, VerificationMode::Automatic);
        assert!(result.confidence >= lenient_policy().default_threshold);
        assert!(result.security_checks.as_ref().is_some_and(|c| c.overall_security));
        assert!(result.scores.is_some());

        let info = service.profile("emp-1").await.unwrap();
        assert_eq!(info.total_attempts, 1);
        assert_eq!(info.successful_attempts, 1);
        assert!(info.last_verification.is_some());
    }

    #[tokio::test]
    async fn test_verify_blank_image_has_no_face() {
        let service = enrolled("emp-1").await;
        let result = service.verify("emp-1", ImageInput::Bytes(flat_png())).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorCode::NoFaceDetected));
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.outcome, Outcome::Rejected);
        let quality = result.quality.expect("no-face result carries a zero quality report");
        assert_eq!(quality.overall, 0.0);
        assert!(result.security_checks.is_none());
    }

    async fn enrolled_standard(policy: Policy, captures: Vec<ImageInput>) -> BiometricService {
        let service = service(policy).await;
        let result = service.enroll("emp-1", captures).await;
        assert!(result.success, "{result:?}");
        service
    }

    #[tokio::test]
    async fn test_standard_policy_matches_enrolled_face() {
        let service = enrolled_standard(Policy::standard(), vec![face(1), face(1)]).await;
        let result = service.verify("emp-1", face(1)).await;

        assert!(result.success, "{result:?}");
        assert_eq!(result.outcome, Outcome::Matched);
        assert!(result.confidence >= Policy::standard().default_threshold);
        let quality = result.quality.as_ref().unwrap();
        assert!(quality.overall >= Policy::standard().verify_quality_floor);
        assert_eq!(quality.eyes, 1.0);
        assert!(result.security_checks.as_ref().is_some_and(|c| c.overall_security));
    }

    #[tokio::test]
    async fn test_standard_policy_rejects_low_quality() {
        let policy = Policy {
            verify_quality_floor: 0.95,
            ..Policy::standard()
        };
        let service = enrolled_standard(policy, vec![face(1), face(1)]).await;
        let result = service.verify("emp-1", face(1)).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorCode::LowQuality));
        assert_eq!(result.outcome, Outcome::Rejected);
        let checks = result.security_checks.as_ref().unwrap();
        assert!(!checks.image_quality);
        assert!(!checks.overall_security);

        let info = service.profile("emp-1").await.unwrap();
        assert_eq!(info.total_attempts, 1);
        assert_eq!(info.successful_attempts, 0);
    }

    #[tokio::test]
    async fn test_standard_policy_security_gate_blocks_match() {
        let policy = Policy {
            eye_floor: 1.0,
            enroll_quality_floor: 0.6,
            ..Policy::standard()
        };
        let one_eye = || ImageInput::Bytes(one_eye_png(1));
        let service = enrolled_standard(policy, vec![one_eye(), one_eye()]).await;
        let result = service.verify("emp-1", one_eye()).await;

        assert!(!result.success, "{result:?}");
        assert_eq!(result.error, Some(ErrorCode::SecurityCheckFailed));
        let checks = result.security_checks.as_ref().unwrap();
        assert!(!checks.eye_detection);
        assert!(!checks.overall_security);
        assert!(checks.failed().contains(&"eye_detection"));
        assert!(result.message.as_deref().is_some_and(|m| m.contains("eye_detection")));
    }

    #[tokio::test]
    async fn test_enroll_more_images_than_queue_holds() {
        let service = service(Policy::standard()).await;
        let captures = (0..12).map(|_| face(1)).collect();
        let result = service.enroll("emp-1", captures).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.accepted_capture_count, 12);
    }

    #[tokio::test]
    async fn test_verify_garbage_is_decode_error() {
        let service = enrolled("emp-1").await;
        let result = service.verify("emp-1", ImageInput::Bytes(b"not an image".to_vec())).await;
        assert_eq!(result.error, Some(ErrorCode::DecodeError));
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_verify_inactive_profile() {
        let service = enrolled("emp-1").await;
        service.set_active("emp-1", false).await.unwrap();

        let result = service.verify("emp-1", face(1)).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorCode::ProfileInactive));
        assert_eq!(result.confidence, 0.0);
        assert_eq!(service.profile("emp-1").await.unwrap().total_attempts, 0);
    }

    #[tokio::test]
    async fn test_verify_unknown_identity() {
        let service = service(lenient_policy()).await;
        let result = service.verify("ghost", face(1)).await;
        assert_eq!(result.error, Some(ErrorCode::ProfileNotFound));
        assert!(result.requires_enrollment);
    }

    #[tokio::test]
    async fn test_corrupt_template_flags_reenrollment() {
        let service = enrolled("emp-1").await;
        service.store.overwrite_sealed("emp-1", vec![0x5a; 64]).await;

        let result = service.verify("emp-1", face(1)).await;
        assert_eq!(result.error, Some(ErrorCode::TemplateCorrupt));
        assert_eq!(result.outcome, Outcome::Errored);
        assert!(result.requires_enrollment);
        assert!(service.profile("emp-1").await.unwrap().needs_reenrollment);
    }

    #[tokio::test]
    async fn test_raising_threshold_only_rejects() {
        let service = enrolled("emp-1").await;
        assert!(service.verify("emp-1", face(1)).await.success);

        service.set_threshold("emp-1", 1.0).await.unwrap();
        let result = service.verify("emp-1", face(1)).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorCode::NotVerified));

        let info = service.profile("emp-1").await.unwrap();
        assert_eq!((info.total_attempts, info.successful_attempts), (2, 1));
    }

    #[tokio::test]
    async fn test_verify_times_out() {
        let (factory, gate) = GatedFactory::new();
        let service = service_with(lenient_policy(), Arc::new(factory), Duration::from_millis(50)).await;
        service
            .store
            .upsert_template("emp-1", &stored_template(), 0.5)
            .await
            .unwrap();

        let result = service.verify("emp-1", face(1)).await;
        gate.release(1);
        assert_eq!(result.error, Some(ErrorCode::Timeout));
        assert_eq!(result.outcome, Outcome::Errored);
    }

    fn stored_template() -> facegate_core::Template {
        let mut pipeline = StubFactory.build().unwrap();
        let analysis = pipeline.analyze(&face(1)).unwrap();
        let descriptor = analysis.extraction.descriptor().unwrap().clone();
        facegate_core::Template::aggregate(&[descriptor.clone(), descriptor]).unwrap()
    }

    #[tokio::test]
    async fn test_manual_override_is_audited() {
        let service = enrolled("emp-1").await;

        let err = service.manual_override("emp-1", "ops-1", "  ").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        let err = service.manual_override("ghost", "ops-1", "camera down").await.unwrap_err();
        assert!(matches!(err, ServiceError::ProfileNotFound(_)));

        let result = service.manual_override("emp-1", "ops-1", "camera down").await.unwrap();
        assert!(result.success);
        assert_eq!(result.mode, VerificationMode::ManualOverride);
        assert!(result.security_checks.is_none());

        let trail = service.overrides("emp-1").await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].operator, "ops-1");
        assert_eq!(service.profile("emp-1").await.unwrap().total_attempts, 0);

        service.set_active("emp-1", false).await.unwrap();
        let err = service.manual_override("emp-1", "ops-1", "camera down").await.unwrap_err();
        assert!(matches!(err, ServiceError::ProfileInactive(_)));
    }

    #[tokio::test]
    async fn test_profile_administration() {
        let service = enrolled("emp-1").await;

        let err = service.set_threshold("emp-1", 1.5).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert!(matches!(
            service.set_active("ghost", true).await,
            Err(ServiceError::ProfileNotFound(_))
        ));

        let status = service.status().await.unwrap();
        assert_eq!(status.profiles, 1);
        assert_eq!(status.workers, 2);
        assert_eq!(status.queue_capacity, 8);
        assert_eq!(status.detectors, vec!["stub".to_string()]);
        assert_eq!(status.assurance, AssuranceLevel::Standard);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["assurance"], "standard");

        assert_eq!(service.list_profiles().await.unwrap().len(), 1);
        service.remove_profile("emp-1").await.unwrap();
        assert!(service.list_profiles().await.unwrap().is_empty());
        assert!(matches!(
            service.remove_profile("emp-1").await,
            Err(ServiceError::ProfileNotFound(_))
        ));
    }
}
