//! Image quality scoring of a located face.

use crate::eyes::{DarkBlobEyeDetector, EyeDetector};
use crate::types::FaceRegion;
use image::imageops;
use image::{GrayImage, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value used for a sub-score that could not be computed.
pub const FALLBACK_SCORE: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeightsError {
    #[error("quality weight `{0}` is negative")]
    Negative(&'static str),
    #[error("quality weights sum to {0}, expected 1")]
    BadSum(f32),
}

/// Weights of the sub-scores in the overall quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub sharpness: f32,
    pub brightness: f32,
    pub contrast: f32,
    pub eyes: f32,
    pub symmetry: f32,
    pub liveness: f32,
    pub resolution: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            sharpness: 0.25,
            brightness: 0.15,
            contrast: 0.15,
            eyes: 0.15,
            symmetry: 0.10,
            liveness: 0.15,
            resolution: 0.05,
        }
    }
}

impl QualityWeights {
    fn named(&self) -> [(&'static str, f32); 7] {
        [
            ("sharpness", self.sharpness),
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("eyes", self.eyes),
            ("symmetry", self.symmetry),
            ("liveness", self.liveness),
            ("resolution", self.resolution),
        ]
    }

    /// Weights must be non-negative and sum to 1 (±1e-4).
    pub fn validate(&self) -> Result<(), WeightsError> {
        let named = self.named();
        if let Some((name, _)) = named.iter().find(|(_, w)| *w < 0.0 || !w.is_finite()) {
            return Err(WeightsError::Negative(name));
        }
        let sum: f32 = named.iter().map(|(_, w)| w).sum();
        if (sum - 1.0).abs() > 1e-4 {
            return Err(WeightsError::BadSum(sum));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub sharpness: f32,
    pub brightness: f32,
    pub contrast: f32,
    pub eyes: f32,
    pub symmetry: f32,
    pub liveness: f32,
    pub resolution: f32,
    pub overall: f32,
    /// Sub-scores that could not be computed and used the fallback value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<String>,
}

impl QualityReport {
    /// All-zero report, used when there is no face to assess.
    pub fn zero() -> Self {
        Self::default()
    }
}

pub struct QualityAssessor {
    weights: QualityWeights,
    /// Laplacian variance mapped to a sharpness of 1.
    pub sharpness_norm: f32,
    /// Face area (px²) mapped to a resolution of 1.
    pub min_usable_area: f32,
    eye_detector: Box<dyn EyeDetector>,
}

impl Default for QualityAssessor {
    fn default() -> Self {
        Self::new(QualityWeights::default(), Box::new(DarkBlobEyeDetector::default()))
    }
}

impl QualityAssessor {
    pub fn new(weights: QualityWeights, eye_detector: Box<dyn EyeDetector>) -> Self {
        Self {
            weights,
            sharpness_norm: 1000.0,
            min_usable_area: 100.0 * 100.0,
            eye_detector,
        }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    /// Score the face region of `raster`. Every value is clamped to [0, 1].
    pub fn assess(&self, raster: &RgbImage, face: &FaceRegion) -> QualityReport {
        let Some(face) = face.clamp_to(raster.width(), raster.height()) else {
            return QualityReport::zero();
        };
        let crop = imageops::crop_imm(raster, face.left, face.top, face.width(), face.height()).to_image();
        let gray = imageops::grayscale(&crop);

        let mut fallbacks = Vec::new();
        let mut or_fallback = |name: &str, value: Option<f32>| match value {
            Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
            _ => {
                tracing::debug!(score = name, "quality sub-score unavailable; using fallback");
                fallbacks.push(name.to_string());
                FALLBACK_SCORE
            }
        };

        let (mean, std) = mean_std(&gray);
        let sharpness = or_fallback("sharpness", laplacian_variance(&gray).map(|v| v / self.sharpness_norm));
        let brightness = or_fallback("brightness", mean.map(|m| 1.0 - (m - 127.5).abs() / 127.5));
        let contrast = or_fallback("contrast", std.map(|s| s / 64.0));
        let eyes = or_fallback("eyes", Some(self.eye_detector.count_eyes(&gray).min(2) as f32 / 2.0));
        let symmetry = or_fallback("symmetry", symmetry(&gray));
        let liveness = or_fallback("liveness", liveness(&gray));
        let resolution = or_fallback("resolution", Some(face.area() as f32 / self.min_usable_area));

        let w = &self.weights;
        let overall = (sharpness * w.sharpness
            + brightness * w.brightness
            + contrast * w.contrast
            + eyes * w.eyes
            + symmetry * w.symmetry
            + liveness * w.liveness
            + resolution * w.resolution)
            .clamp(0.0, 1.0);

        if !fallbacks.is_empty() {
            tracing::warn!(fallbacks = ?fallbacks, "quality assessed with fallback sub-scores");
        }

        QualityReport {
            sharpness,
            brightness,
            contrast,
            eyes,
            symmetry,
            liveness,
            resolution,
            overall,
            fallbacks,
        }
    }
}

fn mean_std(gray: &GrayImage) -> (Option<f32>, Option<f32>) {
    let raw = gray.as_raw();
    if raw.is_empty() {
        return (None, None);
    }
    let n = raw.len() as f64;
    let mean = raw.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = raw.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (Some(mean as f32), Some(var.sqrt() as f32))
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
fn laplacian_variance(gray: &GrayImage) -> Option<f32> {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return None;
    }
    let at = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut values = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            values.push(at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y));
        }
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    Some((values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n) as f32)
}

/// `1 − mean|left − mirror(right)| / 255` over equal-width halves.
fn symmetry(gray: &GrayImage) -> Option<f32> {
    let (w, h) = gray.dimensions();
    let half = w / 2;
    if half == 0 || h == 0 {
        return None;
    }
    let mut total = 0u64;
    for y in 0..h {
        for x in 0..half {
            let left = gray.get_pixel(x, y)[0] as i32;
            let right = gray.get_pixel(w - 1 - x, y)[0] as i32;
            total += (left - right).unsigned_abs() as u64;
        }
    }
    let mean = total as f32 / (half * h) as f32;
    Some(1.0 - mean / 255.0)
}

/// Texture spread of the intensity histogram blended with gradient energy.
///
/// Histogram counts are scaled to a 10 000-pixel face so the score does not
/// depend on crop size.
fn liveness(gray: &GrayImage) -> Option<f32> {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return None;
    }
    let n = (w * h) as f64;
    let mut hist = [0f64; 256];
    for px in gray.as_raw() {
        hist[*px as usize] += 1.0;
    }
    let scaled: Vec<f64> = hist.iter().map(|c| c * 10_000.0 / n).collect();
    let hist_mean = scaled.iter().sum::<f64>() / 256.0;
    let hist_var = scaled.iter().map(|c| (c - hist_mean).powi(2)).sum::<f64>() / 256.0;
    let texture_score = (hist_var / 10_000.0).min(1.0);

    let gx = horizontal_sobel(gray);
    let gy = vertical_sobel(gray);
    let magnitude = gx
        .as_raw()
        .iter()
        .zip(gy.as_raw())
        .map(|(&x, &y)| ((x as f64).powi(2) + (y as f64).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let gradient_score = (magnitude / 50.0).min(1.0);

    Some((texture_score * 0.6 + gradient_score * 0.4) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    struct FixedEyes(usize);

    impl EyeDetector for FixedEyes {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn count_eyes(&self, _face: &GrayImage) -> usize {
            self.0
        }
    }

    fn assessor(eyes: usize) -> QualityAssessor {
        QualityAssessor::new(QualityWeights::default(), Box::new(FixedEyes(eyes)))
    }

    fn in_range(r: &QualityReport) -> bool {
        [r.sharpness, r.brightness, r.contrast, r.eyes, r.symmetry, r.liveness, r.resolution, r.overall]
            .iter()
            .all(|v| (0.0..=1.0).contains(v))
    }

    #[test]
    fn test_default_weights_valid() {
        assert!(QualityWeights::default().validate().is_ok());
    }

    #[test]
    fn test_weights_rejected() {
        let w = QualityWeights { sharpness: 0.5, ..QualityWeights::default() };
        assert!(matches!(w.validate(), Err(WeightsError::BadSum(_))));
        let w = QualityWeights { sharpness: -0.25, brightness: 0.65, ..QualityWeights::default() };
        assert_eq!(w.validate(), Err(WeightsError::Negative("sharpness")));
    }

    #[test]
    fn test_uniform_gray_face() {
        let img = RgbImage::from_pixel(200, 200, Rgb([127, 127, 127]));
        let r = assessor(0).assess(&img, &FaceRegion::from_xywh(50, 50, 100, 100));
        assert_eq!(r.sharpness, 0.0);
        assert!(r.brightness > 0.99);
        assert_eq!(r.contrast, 0.0);
        assert_eq!(r.eyes, 0.0);
        assert_eq!(r.symmetry, 1.0);
        assert_eq!(r.resolution, 1.0);
        assert!(r.fallbacks.is_empty());
        assert!(in_range(&r));
    }

    #[test]
    fn test_values_clamped_for_extreme_images() {
        let img = RgbImage::from_fn(300, 300, |x, y| if (x + y) % 2 == 0 { Rgb([255; 3]) } else { Rgb([0; 3]) });
        let r = assessor(5).assess(&img, &FaceRegion::from_xywh(0, 0, 300, 300));
        assert_eq!(r.sharpness, 1.0);
        assert_eq!(r.contrast, 1.0);
        assert_eq!(r.eyes, 1.0);
        assert!(in_range(&r));
    }

    #[test]
    fn test_overall_is_weighted_sum() {
        let img = RgbImage::from_fn(120, 120, |x, y| Rgb([((x * 3 + y) % 256) as u8; 3]));
        let a = assessor(2);
        let r = a.assess(&img, &FaceRegion::from_xywh(10, 10, 100, 100));
        let w = a.weights();
        let expected = r.sharpness * w.sharpness
            + r.brightness * w.brightness
            + r.contrast * w.contrast
            + r.eyes * w.eyes
            + r.symmetry * w.symmetry
            + r.liveness * w.liveness
            + r.resolution * w.resolution;
        assert!((r.overall - expected).abs() < 1e-5);
    }

    #[test]
    fn test_narrow_crop_uses_fallbacks() {
        let img = RgbImage::from_pixel(50, 50, Rgb([90, 90, 90]));
        let r = assessor(0).assess(&img, &FaceRegion::from_xywh(10, 10, 1, 30));
        assert_eq!(r.sharpness, FALLBACK_SCORE);
        assert_eq!(r.symmetry, FALLBACK_SCORE);
        assert_eq!(r.liveness, FALLBACK_SCORE);
        assert_eq!(r.fallbacks, vec!["sharpness", "symmetry", "liveness"]);
        assert!(in_range(&r));
    }

    #[test]
    fn test_asymmetric_face_scores_lower() {
        let sym = GrayImage::from_fn(40, 40, |x, _| Luma([if x < 10 || x >= 30 { 200 } else { 50 }]));
        let asym = GrayImage::from_fn(40, 40, |x, _| Luma([if x < 20 { 255 } else { 0 }]));
        assert_eq!(symmetry(&sym), Some(1.0));
        assert_eq!(symmetry(&asym), Some(0.0));
    }

    #[test]
    fn test_outside_region_is_zero_report() {
        let img = RgbImage::new(20, 20);
        let r = assessor(2).assess(&img, &FaceRegion::from_xywh(40, 40, 10, 10));
        assert_eq!(r, QualityReport::zero());
    }
}
