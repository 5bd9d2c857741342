//! Face detector strategies.
//!
//! [`FaceDetector`] is the seam between the locator and concrete detection
//! back-ends. Two back-ends ship with the crate: the SeetaFace funnel cascade
//! ([`crate::cascade::CascadeDetector`]) and the SCRFD network run through
//! ONNX Runtime ([`ScrfdDetector`]).

use crate::types::{Candidate, FaceRegion};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- SCRFD constants ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Default minimum SCRFD score; the production engine kept DNN boxes above 0.7.
pub const SCRFD_DEFAULT_CONFIDENCE: f32 = 0.7;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model could not be loaded: {0}")]
    ModelInvalid(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detection back-end.
///
/// Detectors take `&mut self` because inference sessions keep scratch state;
/// each worker owns its own instances.
pub trait FaceDetector {
    /// Short identifier used in logs and candidate provenance.
    fn name(&self) -> &'static str;

    /// Propose face boxes in a grayscale raster.
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Candidate>, DetectorError>;
}

/// Letterbox parameters for mapping network coordinates back to the raster.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// A decoded SCRFD box in raster coordinates.
#[derive(Debug, Clone)]
struct RawBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    score: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD deep face detector.
pub struct ScrfdDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
    confidence_threshold: f32,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model.
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(DetectorError::ModelInvalid(format!(
                "SCRFD needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?stride_indices,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            stride_indices,
            confidence_threshold,
        })
    }

    fn preprocess(gray: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
        let pad_x = (SCRFD_INPUT_SIZE - new_w) as f32 / 2.0;
        let pad_y = (SCRFD_INPUT_SIZE - new_h) as f32 / 2.0;

        let resized = image::imageops::resize(
            gray,
            new_w as u32,
            new_h as u32,
            image::imageops::FilterType::Triangle,
        );

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

        for y in 0..SCRFD_INPUT_SIZE {
            for x in 0..SCRFD_INPUT_SIZE {
                let inside = y >= pad_y_start
                    && y < pad_y_start + new_h
                    && x >= pad_x_start
                    && x < pad_x_start + new_w;
                let pixel = if inside {
                    resized.get_pixel((x - pad_x_start) as u32, (y - pad_y_start) as u32)[0] as f32
                } else {
                    SCRFD_MEAN
                };
                let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
                // Grayscale replicated into the three input channels.
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    fn name(&self) -> &'static str {
        "scrfd"
    }

    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<Candidate>, DetectorError> {
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = Self::preprocess(gray);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut boxes = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            boxes.extend(decode_stride(scores, bboxes, stride, &letterbox, self.confidence_threshold));
        }

        let kept = nms(boxes, SCRFD_NMS_THRESHOLD);
        Ok(kept
            .into_iter()
            .filter_map(|b| {
                FaceRegion::from_f32_box(b.x, b.y, b.width, b.height, gray.width(), gray.height()).map(
                    |region| Candidate {
                        region,
                        confidence: b.score,
                        source: "scrfd",
                    },
                )
            })
            .collect())
    }
}

/// Map SCRFD output tensors to stride slots.
///
/// Named exports ("score_8", "bbox_8", ...) are matched by name; anything else
/// falls back to the standard positional layout `[scores 8/16/32, bboxes 8/16/32, ...]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[i] = (s, b),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    named
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * step;
        let ay = (cell / grid) as f32 * step;

        let x1 = (ax - bboxes[off] * step - letterbox.pad_x) / letterbox.scale;
        let y1 = (ay - bboxes[off + 1] * step - letterbox.pad_y) / letterbox.scale;
        let x2 = (ax + bboxes[off + 2] * step - letterbox.pad_x) / letterbox.scale;
        let y2 = (ay + bboxes[off + 3] * step - letterbox.pad_y) / letterbox.scale;

        out.push(RawBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            score,
        });
    }
    out
}

/// Non-maximum suppression over one detector's raw boxes.
fn nms(mut boxes: Vec<RawBox>, iou_threshold: f32) -> Vec<RawBox> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<RawBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| raw_iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn raw_iou(a: &RawBox, b: &RawBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn raw(x: f32, y: f32, w: f32, h: f32, score: f32) -> RawBox {
        RawBox { x, y, width: w, height: h, score }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let boxes = vec![
            raw(0.0, 0.0, 100.0, 100.0, 0.9),
            raw(5.0, 5.0, 100.0, 100.0, 0.8),
            raw(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = nms(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(discover_output_indices(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_stride_maps_letterbox() {
        // One anchor at cell (1, 1) of stride 32 with a 1-stride box on each side.
        let grid = SCRFD_INPUT_SIZE / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let boxes = decode_stride(&scores, &bboxes, 32, &letterbox, 0.5);
        assert_eq!(boxes.len(), 1);
        // Anchor centre (32, 32) ± 32 → (0..64) in network space → (0..32) in raster space.
        assert!((boxes[0].x - 0.0).abs() < 1e-4);
        assert!((boxes[0].width - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_pads_with_mean() {
        let gray = GrayImage::from_pixel(320, 160, Luma([255]));
        let (tensor, letterbox) = ScrfdDetector::preprocess(&gray);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert!((letterbox.pad_y - 160.0).abs() < 1e-6);
        // Padding rows normalize to zero, image rows to (255 - 127.5) / 128.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 320, 320]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }
}
