//! Handcrafted face descriptor extraction.
//!
//! The face crop is normalised to a 128×128 grayscale patch, from which an
//! intensity histogram, an LBP texture histogram, Hu moments, Canny edge
//! density and Sobel gradient means are taken. Mean color comes from the
//! un-resized color crop.
//!
//! A component that cannot be computed is replaced by a SHA-256 derived
//! stand-in so the descriptor keeps its fixed layout; the extraction is then
//! reported as [`Extraction::Degraded`].

use crate::moments::{self, ZeroMass};
use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Side of the normalised face patch.
pub const FACE_SIZE: u32 = 128;
pub const HISTOGRAM_BINS: usize = 50;
pub const TEXTURE_BINS: usize = 16;
pub const MOMENT_COUNT: usize = 7;

const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("image has zero mass; moments undefined")]
    ZeroMass,
    #[error("crop too small for {0}")]
    TooSmall(&'static str),
    #[error("non-finite values in {0}")]
    NonFinite(&'static str),
}

impl From<ZeroMass> for FeatureError {
    fn from(_: ZeroMass) -> Self {
        FeatureError::ZeroMass
    }
}

/// Fixed-layout face descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDescriptor {
    /// Counts of the first 50 intensity levels of the normalised patch.
    pub histogram: [f32; HISTOGRAM_BINS],
    /// LBP code histogram, 16 bins of width 16.
    pub texture: [f32; TEXTURE_BINS],
    pub moments: [f32; MOMENT_COUNT],
    /// Fraction of edge pixels, 0..=1.
    pub edge_density: f32,
    /// Per-channel RGB mean, absent for achromatic crops.
    pub color_mean: Option<[f32; 3]>,
    /// Mean absolute horizontal and vertical Sobel response.
    pub gradient_mean: [f32; 2],
}

impl FeatureDescriptor {
    /// Flatten into the block-normalised vector used by the similarity metrics.
    ///
    /// Histogram and texture blocks are L2-normalised, moments are log-scaled
    /// into roughly 0..1, color and gradients are divided by 255. The color
    /// block is emitted only when `with_color` is set.
    pub fn to_vector(&self, with_color: bool) -> Vec<f32> {
        let mut v = Vec::with_capacity(HISTOGRAM_BINS + TEXTURE_BINS + MOMENT_COUNT + 6);
        v.extend(l2_normalized(&self.histogram));
        v.extend(l2_normalized(&self.texture));
        v.extend(self.moments.iter().map(|&h| log_scaled(h)));
        v.push(self.edge_density.clamp(0.0, 1.0));
        if with_color {
            if let Some(color) = self.color_mean {
                v.extend(color.iter().map(|c| (c / 255.0).clamp(0.0, 1.0)));
            }
        }
        v.extend(self.gradient_mean.iter().map(|g| (g / 255.0).clamp(0.0, 1.0)));
        v
    }
}

pub(crate) fn l2_normalized(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter().map(|v| v / norm).collect()
    } else {
        values.to_vec()
    }
}

/// `-sign(h) · log10|h| / 30`, with zero mapped to zero.
pub(crate) fn log_scaled(h: f32) -> f32 {
    if h == 0.0 || !h.is_finite() {
        return 0.0;
    }
    let magnitude = h.abs().max(1e-30);
    -h.signum() * magnitude.log10() / 30.0
}

/// Outcome of descriptor extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Complete(FeatureDescriptor),
    /// Some components were replaced by deterministic stand-ins.
    Degraded {
        descriptor: FeatureDescriptor,
        reasons: Vec<FeatureError>,
    },
    Failed(FeatureError),
}

impl Extraction {
    pub fn descriptor(&self) -> Option<&FeatureDescriptor> {
        match self {
            Extraction::Complete(d) | Extraction::Degraded { descriptor: d, .. } => Some(d),
            Extraction::Failed(_) => None,
        }
    }

    pub fn into_descriptor(self) -> Option<FeatureDescriptor> {
        match self {
            Extraction::Complete(d) | Extraction::Degraded { descriptor: d, .. } => Some(d),
            Extraction::Failed(_) => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Extraction::Degraded { .. })
    }
}

/// Extract the descriptor of `face` within `raster`.
pub fn extract(raster: &RgbImage, face: &FaceRegion) -> Extraction {
    let Some(face) = face.clamp_to(raster.width(), raster.height()) else {
        return Extraction::Failed(FeatureError::EmptyCrop);
    };
    let crop = imageops::crop_imm(raster, face.left, face.top, face.width(), face.height()).to_image();
    let gray_crop = imageops::grayscale(&crop);
    let patch = imageops::resize(&gray_crop, FACE_SIZE, FACE_SIZE, FilterType::Triangle);
    let seed = patch.as_raw().as_slice();

    let mut reasons = Vec::new();
    let mut take = |result: Result<Vec<f32>, FeatureError>, component: &'static str, len: usize| match result {
        Ok(values) => values,
        Err(err) => {
            tracing::warn!(component, error = %err, "feature component failed; using stand-in");
            reasons.push(err);
            stand_in(component, seed, len)
        }
    };

    let histogram = take(intensity_histogram(&patch), "histogram", HISTOGRAM_BINS);
    let texture = take(lbp_histogram(&gray_crop, &patch), "texture", TEXTURE_BINS);
    let moments = take(hu_moments(&patch), "moments", MOMENT_COUNT);
    let edge = take(edge_density(&patch), "edge_density", 1);
    let gradients = take(gradient_means(&patch), "gradient_mean", 2);
    let color_mean = color_mean(&crop);

    let descriptor = FeatureDescriptor {
        histogram: to_array(&histogram),
        texture: to_array(&texture),
        moments: to_array(&moments),
        edge_density: edge[0],
        color_mean,
        gradient_mean: to_array(&gradients),
    };

    if reasons.is_empty() {
        Extraction::Complete(descriptor)
    } else {
        Extraction::Degraded { descriptor, reasons }
    }
}

fn to_array<const N: usize>(values: &[f32]) -> [f32; N] {
    let mut out = [0.0f32; N];
    for (slot, v) in out.iter_mut().zip(values) {
        *slot = *v;
    }
    out
}

fn ensure_finite(component: &'static str, values: Vec<f32>) -> Result<Vec<f32>, FeatureError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(values)
    } else {
        Err(FeatureError::NonFinite(component))
    }
}

fn intensity_histogram(patch: &GrayImage) -> Result<Vec<f32>, FeatureError> {
    let mut bins = [0u32; 256];
    for px in patch.as_raw() {
        bins[*px as usize] += 1;
    }
    ensure_finite("histogram", bins[..HISTOGRAM_BINS].iter().map(|&c| c as f32).collect())
}

/// 8-neighbour LBP, clockwise from the top-left neighbour, `bit = neighbour >= center`.
fn lbp_histogram(crop: &GrayImage, patch: &GrayImage) -> Result<Vec<f32>, FeatureError> {
    if crop.width() < 3 || crop.height() < 3 {
        return Err(FeatureError::TooSmall("texture"));
    }
    const OFFSETS: [(i32, i32); 8] = [(-1, -1), (0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0)];

    let (w, h) = patch.dimensions();
    let mut bins = [0f32; TEXTURE_BINS];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = patch.get_pixel(x, y)[0];
            let mut code = 0u8;
            for (bit, (dx, dy)) in OFFSETS.iter().enumerate() {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                if patch.get_pixel(nx, ny)[0] >= center {
                    code |= 1 << (7 - bit);
                }
            }
            bins[(code / 16) as usize] += 1.0;
        }
    }
    ensure_finite("texture", bins.to_vec())
}

fn hu_moments(patch: &GrayImage) -> Result<Vec<f32>, FeatureError> {
    let hu = moments::hu_moments(patch)?;
    ensure_finite("moments", hu.iter().map(|&h| h as f32).collect())
}

fn edge_density(patch: &GrayImage) -> Result<Vec<f32>, FeatureError> {
    let edges = canny(patch, CANNY_LOW, CANNY_HIGH);
    let total = edges.as_raw().len();
    if total == 0 {
        return Err(FeatureError::TooSmall("edge_density"));
    }
    let on = edges.as_raw().iter().filter(|&&v| v > 0).count();
    ensure_finite("edge_density", vec![on as f32 / total as f32])
}

fn gradient_means(patch: &GrayImage) -> Result<Vec<f32>, FeatureError> {
    let n = (patch.width() * patch.height()) as f32;
    if n == 0.0 {
        return Err(FeatureError::TooSmall("gradient_mean"));
    }
    let gx = horizontal_sobel(patch);
    let gy = vertical_sobel(patch);
    let mean_abs = |img: &image::ImageBuffer<image::Luma<i16>, Vec<i16>>| {
        img.as_raw().iter().map(|&v| (v as f32).abs()).sum::<f32>() / n
    };
    ensure_finite("gradient_mean", vec![mean_abs(&gx), mean_abs(&gy)])
}

/// Per-channel mean of the color crop; `None` when every pixel is gray.
fn color_mean(crop: &RgbImage) -> Option<[f32; 3]> {
    let n = (crop.width() * crop.height()) as f64;
    if n == 0.0 || crop.pixels().all(|p| p[0] == p[1] && p[1] == p[2]) {
        return None;
    }
    let mut sums = [0f64; 3];
    for p in crop.pixels() {
        for c in 0..3 {
            sums[c] += p[c] as f64;
        }
    }
    Some([(sums[0] / n) as f32, (sums[1] / n) as f32, (sums[2] / n) as f32])
}

/// Deterministic pseudo-feature values in `(0, 1]` derived from the patch.
fn stand_in(component: &str, seed: &[u8], len: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(len);
    let mut block = 0u32;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(component.as_bytes());
        hasher.update(block.to_le_bytes());
        hasher.update(seed);
        let digest = hasher.finalize();
        out.extend(digest.iter().take(len - out.len()).map(|&b| (b as f32 + 1.0) / 256.0));
        block += 1;
    }
    out
}
