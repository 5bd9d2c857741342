//! SeetaFace funnel-structured cascade detector via `rustface`.
//!
//! Fast, CPU-only frontal face detection. The model file is read once at
//! start-up; every worker builds its own detector from the shared bytes.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::{Candidate, FaceRegion};
use image::GrayImage;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

/// Tuning knobs for the cascade.
#[derive(Debug, Clone)]
pub struct CascadeParams {
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: u32,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            min_face_size: 40,
            score_threshold: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
        }
    }
}

/// Raw SeetaFace model bytes, validated and shareable across workers.
#[derive(Clone)]
pub struct CascadeModel {
    bytes: Arc<Vec<u8>>,
}

impl CascadeModel {
    /// Read and validate a SeetaFace model file.
    pub fn from_file(path: &Path) -> Result<Self, DetectorError> {
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)
            .map_err(|e| DetectorError::ModelInvalid(format!("{}: {e}", path.display())))?;
        let model = Self { bytes: Arc::new(bytes) };
        model.parse()?;
        tracing::info!(path = %path.display(), bytes = model.bytes.len(), "loaded cascade model");
        Ok(model)
    }

    fn parse(&self) -> Result<rustface::Model, DetectorError> {
        rustface::read_model(Cursor::new(self.bytes.as_slice()))
            .map_err(|e| DetectorError::ModelInvalid(e.to_string()))
    }
}

/// Cascade detector instance owned by a single worker.
pub struct CascadeDetector {
    inner: Box<dyn rustface::Detector>,
}

impl CascadeDetector {
    pub fn new(model: &CascadeModel, params: &CascadeParams) -> Result<Self, DetectorError> {
        let mut inner = rustface::create_detector_with_model(model.parse()?);
        inner.set_min_face_size(params.min_face_size);
        inner.set_score_thresh(params.score_threshold);
        inner.set_pyramid_scale_factor(params.pyramid_scale_factor);
        inner.set_slide_window_step(params.slide_window_step, params.slide_window_step);
        Ok(Self { inner })
    }
}

impl FaceDetector for CascadeDetector {
    fn name(&self) -> &'static str {
        "cascade"
    }

    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Candidate>, DetectorError> {
        let (width, height) = gray.dimensions();
        let data = rustface::ImageData::new(gray.as_raw(), width, height);
        let faces = self.inner.detect(&data);

        Ok(faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                FaceRegion::from_f32_box(
                    bbox.x() as f32,
                    bbox.y() as f32,
                    bbox.width() as f32,
                    bbox.height() as f32,
                    width,
                    height,
                )
                .map(|region| Candidate {
                    region,
                    confidence: face.score() as f32,
                    source: "cascade",
                })
            })
            .collect())
    }
}
