use serde::{Deserialize, Serialize};

/// Face bounding box in pixel coordinates, `(top, right, bottom, left)`.
///
/// `right` and `bottom` are exclusive, so `width = right - left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceRegion {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self { top, right, bottom, left }
    }

    /// Build a region from an `x, y, width, height` box.
    pub fn from_xywh(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            top: y,
            right: x + width,
            bottom: y + height,
            left: x,
        }
    }

    /// Build a region from a floating point box, clamping it to the raster.
    ///
    /// Returns `None` when nothing of the box lies inside the raster.
    pub fn from_f32_box(x: f32, y: f32, width: f32, height: f32, raster_w: u32, raster_h: u32) -> Option<Self> {
        if !(x.is_finite() && y.is_finite() && width.is_finite() && height.is_finite()) {
            return None;
        }
        let left = x.max(0.0).round() as u32;
        let top = y.max(0.0).round() as u32;
        let right = ((x + width).round().max(0.0) as u32).min(raster_w);
        let bottom = ((y + height).round().max(0.0) as u32).min(raster_h);
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self { top, right, bottom, left })
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Box center as `(x, y)`.
    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) as f32 / 2.0,
            (self.top + self.bottom) as f32 / 2.0,
        )
    }

    /// Clamp the region to a `width × height` raster. `None` if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        let clamped = Self {
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
            left: self.left.min(width),
        };
        if clamped.is_empty() {
            None
        } else {
            Some(clamped)
        }
    }

    /// Intersection-over-Union with another region.
    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);

        let inter = right.saturating_sub(left) as u64 * bottom.saturating_sub(top) as u64;
        let union = self.area() + other.area() - inter;
        if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// A face proposal produced by one detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub region: FaceRegion,
    /// Detector-specific score; only comparable between candidates of one detector.
    pub confidence: f32,
    /// Name of the detector that proposed this box.
    pub source: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        let r = FaceRegion::from_xywh(10, 20, 30, 40);
        assert_eq!(r, FaceRegion::new(20, 40, 60, 10));
        assert_eq!(r.width(), 30);
        assert_eq!(r.height(), 40);
        assert_eq!(r.area(), 1200);
        assert_eq!(r.center(), (25.0, 40.0));
    }

    #[test]
    fn test_iou_identical() {
        let a = FaceRegion::from_xywh(0, 0, 100, 100);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = FaceRegion::from_xywh(0, 0, 10, 10);
        let b = FaceRegion::from_xywh(20, 20, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = FaceRegion::from_xywh(0, 0, 10, 10);
        let b = FaceRegion::from_xywh(5, 0, 10, 10);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_to_raster() {
        let r = FaceRegion::new(10, 500, 300, 50);
        let c = r.clamp_to(200, 100).unwrap();
        assert_eq!(c, FaceRegion::new(10, 200, 100, 50));
        assert!(FaceRegion::new(150, 300, 200, 250).clamp_to(200, 100).is_none());
    }

    #[test]
    fn test_from_f32_box_clamps_negative_origin() {
        let r = FaceRegion::from_f32_box(-5.0, -5.0, 20.0, 20.0, 100, 100).unwrap();
        assert_eq!(r, FaceRegion::new(0, 15, 15, 0));
        assert!(FaceRegion::from_f32_box(f32::NAN, 0.0, 1.0, 1.0, 10, 10).is_none());
        assert!(FaceRegion::from_f32_box(200.0, 0.0, 10.0, 10.0, 100, 100).is_none());
    }
}
