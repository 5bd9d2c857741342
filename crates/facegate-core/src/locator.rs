//! Face localization: run every configured detector, pool the candidates,
//! merge near-duplicates, drop out-of-bounds sizes and pick the best face.

use crate::detector::FaceDetector;
use crate::enhance;
use crate::types::{Candidate, FaceRegion};
use image::{GrayImage, RgbImage};

#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Smallest face side kept as a candidate, in pixels. The stricter
    /// acceptance bounds are enforced later by the security gate.
    pub min_face: u32,
    /// Largest accepted face side, in pixels.
    pub max_face: u32,
    /// Candidates overlapping more than this IoU are merged.
    pub merge_iou: f32,
    /// Run CLAHE on the detection copy before detecting.
    pub enhance_contrast: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            min_face: 20,
            max_face: 2000,
            merge_iou: 0.5,
            enhance_contrast: true,
        }
    }
}

pub struct FaceLocator {
    detectors: Vec<Box<dyn FaceDetector>>,
    config: LocatorConfig,
}

impl FaceLocator {
    pub fn new(detectors: Vec<Box<dyn FaceDetector>>, config: LocatorConfig) -> Self {
        Self { detectors, config }
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Locate the single best face in `raster`, if any.
    pub fn locate(&mut self, raster: &RgbImage) -> Option<FaceRegion> {
        let gray = image::imageops::grayscale(raster);
        let gray = if self.config.enhance_contrast {
            enhance::clahe(&gray, enhance::DEFAULT_TILES, enhance::DEFAULT_CLIP_LIMIT)
        } else {
            gray
        };

        let pooled = self.collect_candidates(&gray);
        let merged = merge_candidates(&pooled, self.config.merge_iou);
        let sized: Vec<FaceRegion> = merged
            .into_iter()
            .filter(|r| within_bounds(r, self.config.min_face, self.config.max_face))
            .collect();

        tracing::debug!(
            pooled = pooled.len(),
            kept = sized.len(),
            "locator: candidates after merge and size filter"
        );

        select_best(&sized, raster.width(), raster.height())
    }

    fn collect_candidates(&mut self, gray: &GrayImage) -> Vec<Candidate> {
        let mut pooled = Vec::new();
        for detector in self.detectors.iter_mut() {
            match detector.detect(gray) {
                Ok(found) => {
                    tracing::debug!(detector = detector.name(), count = found.len(), "detector finished");
                    pooled.extend(found);
                }
                Err(err) => {
                    tracing::warn!(detector = detector.name(), error = %err, "detector failed; skipping");
                }
            }
        }
        pooled
    }
}

/// Check both sides of a region against `[min, max]`.
pub fn within_bounds(region: &FaceRegion, min: u32, max: u32) -> bool {
    let (w, h) = (region.width(), region.height());
    w >= min && w <= max && h >= min && h <= max
}

/// Greedily group candidates whose IoU with a group's first member exceeds
/// `iou_threshold`, then replace each group by the mean of its boxes.
///
/// Groups are seeded largest-first so the merged box is anchored on the
/// most complete proposal.
pub fn merge_candidates(candidates: &[Candidate], iou_threshold: f32) -> Vec<FaceRegion> {
    let mut order: Vec<&Candidate> = candidates.iter().collect();
    order.sort_by(|a, b| b.region.area().cmp(&a.region.area()));

    let mut groups: Vec<Vec<FaceRegion>> = Vec::new();
    for candidate in order {
        match groups
            .iter_mut()
            .find(|g| g[0].iou(&candidate.region) > iou_threshold)
        {
            Some(group) => group.push(candidate.region),
            None => groups.push(vec![candidate.region]),
        }
    }

    groups.iter().map(|g| mean_region(g)).collect()
}

fn mean_region(group: &[FaceRegion]) -> FaceRegion {
    let n = group.len() as f64;
    let avg = |f: fn(&FaceRegion) -> u32| (group.iter().map(|r| f(r) as f64).sum::<f64>() / n).round() as u32;
    FaceRegion {
        top: avg(|r| r.top),
        right: avg(|r| r.right),
        bottom: avg(|r| r.bottom),
        left: avg(|r| r.left),
    }
}

/// Score a face by size and centring:
/// `0.6 · area/image_area + 0.4 · (1 − (|cx − W/2| + |cy − H/2|) / (W + H))`.
pub fn face_score(region: &FaceRegion, image_width: u32, image_height: u32) -> f32 {
    let (w, h) = (image_width as f32, image_height as f32);
    if w <= 0.0 || h <= 0.0 {
        return 0.0;
    }
    let area_ratio = region.area() as f32 / (w * h);
    let (cx, cy) = region.center();
    let center_score = 1.0 - ((cx - w / 2.0).abs() + (cy - h / 2.0).abs()) / (w + h);
    area_ratio * 0.6 + center_score * 0.4
}

/// Pick the highest scoring region; the earliest wins ties.
pub fn select_best(regions: &[FaceRegion], image_width: u32, image_height: u32) -> Option<FaceRegion> {
    let mut best: Option<(f32, FaceRegion)> = None;
    for region in regions {
        let score = face_score(region, image_width, image_height);
        if best.map_or(true, |(s, _)| score > s) {
            best = Some((score, *region));
        }
    }
    best.map(|(_, r)| r)
}
