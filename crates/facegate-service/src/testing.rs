//! Stub pipelines and synthetic captures for the service tests.

use facegate_core::locator::{FaceLocator, LocatorConfig};
use facegate_core::quality::QualityAssessor;
use facegate_core::{Candidate, DetectorError, FaceDetector, FaceRegion, Pipeline, PipelineFactory, Policy};
use image::{GrayImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::{mpsc, Arc, Mutex};
use tokio::sync::mpsc as async_mpsc;

/// Reports the central quarter of any capture that is not one flat color.
pub struct StubDetector;

impl FaceDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Candidate>, DetectorError> {
        Ok(central_face(gray).into_iter().collect())
    }
}

fn central_face(gray: &GrayImage) -> Option<Candidate> {
    let raw = gray.as_raw();
    if raw.iter().all(|&v| v == raw[0]) {
        return None;
    }
    let (w, h) = gray.dimensions();
    Some(Candidate {
        region: FaceRegion::from_xywh(w / 4, h / 4, w / 2, h / 2),
        confidence: 1.0,
        source: "stub",
    })
}

fn pipeline_with(detector: Box<dyn FaceDetector>) -> Pipeline {
    Pipeline::new(
        FaceLocator::new(vec![detector], LocatorConfig::default()),
        QualityAssessor::default(),
    )
}

pub struct StubFactory;

impl PipelineFactory for StubFactory {
    fn build(&self) -> Result<Pipeline, DetectorError> {
        Ok(pipeline_with(Box::new(StubDetector)))
    }
}

pub struct BrokenFactory;

impl PipelineFactory for BrokenFactory {
    fn build(&self) -> Result<Pipeline, DetectorError> {
        Err(DetectorError::ModelNotFound("/nonexistent/det_10g.onnx".into()))
    }
}

/// Holds every detection until the test releases it.
pub struct GatedFactory {
    entered: async_mpsc::UnboundedSender<()>,
    release: Arc<Mutex<mpsc::Receiver<()>>>,
}

pub struct Gate {
    entered: async_mpsc::UnboundedReceiver<()>,
    release: mpsc::Sender<()>,
}

impl GatedFactory {
    pub fn new() -> (Self, Gate) {
        let (entered_tx, entered_rx) = async_mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                entered: entered_tx,
                release: Arc::new(Mutex::new(release_rx)),
            },
            Gate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl Gate {
    /// Wait until a worker is inside a detection.
    pub async fn wait_entered(&mut self) {
        self.entered.recv().await;
    }

    pub fn release(&self, count: usize) {
        for _ in 0..count {
            let _ = self.release.send(());
        }
    }
}

struct GatedDetector {
    entered: async_mpsc::UnboundedSender<()>,
    release: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl FaceDetector for GatedDetector {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Candidate>, DetectorError> {
        let _ = self.entered.send(());
        if let Ok(release) = self.release.lock() {
            let _ = release.recv();
        }
        Ok(central_face(gray).into_iter().collect())
    }
}

impl PipelineFactory for GatedFactory {
    fn build(&self) -> Result<Pipeline, DetectorError> {
        Ok(pipeline_with(Box::new(GatedDetector {
            entered: self.entered.clone(),
            release: Arc::clone(&self.release),
        })))
    }
}

/// Thresholds low enough that any located face passes, so tests exercise
/// orchestration rather than the synthetic image's quality.
pub fn lenient_policy() -> Policy {
    Policy {
        default_threshold: 0.5,
        enroll_quality_floor: 0.0,
        verify_quality_floor: 0.0,
        liveness_floor: 0.0,
        symmetry_floor: 0.0,
        eye_floor: 0.0,
        distance_floor: 0.0,
        consensus_tolerance: 1.0,
        ..Policy::standard()
    }
}

/// A synthetic "face": textured skin-toned patch with two dark eyes.
pub fn face_png(seed: u32) -> Vec<u8> {
    encode_png(&synthetic_face(seed, &[(-30, -20), (30, -20)]))
}

/// Same patch with only the left eye.
pub fn one_eye_png(seed: u32) -> Vec<u8> {
    encode_png(&synthetic_face(seed, &[(-30, -20)]))
}

fn synthetic_face(seed: u32, eyes: &[(i32, i32)]) -> RgbImage {
    RgbImage::from_fn(320, 320, |x, y| {
        let (fx, fy) = (x as i32 - 160, y as i32 - 160);
        if eyes.iter().any(|&(cx, cy)| (fx - cx).pow(2) + (fy - cy).pow(2) <= 64) {
            return Rgb([25, 20, 20]);
        }
        let v = ((x * (7 + seed) + y * 13 + (x * y) % (29 + seed)) % 120) as u8;
        Rgb([110 + v, 80 + v / 2, 60 + v / 3])
    })
}

pub fn flat_png() -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(200, 200, Rgb([200, 200, 200])))
}

fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}
