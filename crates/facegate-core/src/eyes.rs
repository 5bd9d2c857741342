//! Eye presence estimation on a face crop.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};

/// Fraction of the face height searched for eyes, from the top.
pub const EYE_BAND: f32 = 0.55;

/// Below this intensity spread the band has no distinct dark regions.
const MIN_BAND_STD: f32 = 8.0;

/// Counts eyes visible in a grayscale face crop.
pub trait EyeDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of eyes found in `face` (0, 1 or 2).
    fn count_eyes(&self, face: &GrayImage) -> usize;
}

/// Finds eyes as dark, compact blobs in the upper part of the face.
///
/// Pixels darker than `mean − k·std` of the band are foreground; 8-connected
/// components that are neither too small, too large, too elongated, nor
/// touching the band border count as eye candidates. Two candidates at a
/// similar height with enough horizontal separation form a pair.
#[derive(Debug, Clone)]
pub struct DarkBlobEyeDetector {
    pub k: f32,
    pub min_area_fraction: f32,
    pub max_area_fraction: f32,
    pub min_aspect: f32,
    pub max_aspect: f32,
}

impl Default for DarkBlobEyeDetector {
    fn default() -> Self {
        Self {
            k: 0.8,
            min_area_fraction: 0.002,
            max_area_fraction: 0.08,
            min_aspect: 0.5,
            max_aspect: 4.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Blob {
    min_x: u32,
    max_x: u32,
    min_y: u32,
    max_y: u32,
    area: u32,
}

impl Blob {
    fn new(x: u32, y: u32) -> Self {
        Self { min_x: x, max_x: x, min_y: y, max_y: y, area: 0 }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
        self.area += 1;
    }

    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    fn center(&self) -> (f32, f32) {
        (
            (self.min_x + self.max_x) as f32 / 2.0,
            (self.min_y + self.max_y) as f32 / 2.0,
        )
    }
}

impl DarkBlobEyeDetector {
    fn candidates(&self, band: &GrayImage) -> Vec<Blob> {
        let (w, h) = band.dimensions();
        let raw = band.as_raw();
        let n = raw.len() as f32;
        let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
        let std = (raw.iter().map(|&v| (v as f32 - mean).powi(2)).sum::<f32>() / n).sqrt();
        if std < MIN_BAND_STD {
            return Vec::new();
        }
        let cutoff = mean - self.k * std;

        let mask = GrayImage::from_fn(w, h, |x, y| {
            if (band.get_pixel(x, y)[0] as f32) < cutoff {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut blobs: Vec<Option<Blob>> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let id = label[0] as usize;
            if id == 0 {
                continue;
            }
            if blobs.len() <= id {
                blobs.resize(id + 1, None);
            }
            blobs[id].get_or_insert_with(|| Blob::new(x, y)).add(x, y);
        }

        let band_area = n;
        blobs
            .into_iter()
            .flatten()
            .filter(|b| {
                let frac = b.area as f32 / band_area;
                let aspect = b.width() as f32 / b.height() as f32;
                let touches_border = b.min_x == 0 || b.min_y == 0 || b.max_x == w - 1 || b.max_y == h - 1;
                frac >= self.min_area_fraction
                    && frac <= self.max_area_fraction
                    && aspect >= self.min_aspect
                    && aspect <= self.max_aspect
                    && !touches_border
            })
            .collect()
    }
}

impl EyeDetector for DarkBlobEyeDetector {
    fn name(&self) -> &'static str {
        "dark_blob"
    }

    fn count_eyes(&self, face: &GrayImage) -> usize {
        let band_height = (face.height() as f32 * EYE_BAND).round() as u32;
        if face.width() < 8 || band_height < 4 {
            return 0;
        }
        let band = image::imageops::crop_imm(face, 0, 0, face.width(), band_height).to_image();
        let blobs = self.candidates(&band);

        let (w, h) = (band.width() as f32, band.height() as f32);
        for (i, a) in blobs.iter().enumerate() {
            for b in &blobs[i + 1..] {
                let (ax, ay) = a.center();
                let (bx, by) = b.center();
                if (ay - by).abs() <= h * 0.15 && (ax - bx).abs() >= w * 0.2 {
                    return 2;
                }
            }
        }
        blobs.len().min(1)
    }
}
