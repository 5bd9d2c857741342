//! Enrollment templates: aggregation of accepted descriptors and the binary
//! encoding stored in the profile.
//!
//! Layout (all multi-byte values little-endian):
//!
//! ```text
//! "FGT1" | version u8 | flags u8 | capture_count u16 | f32 fields...
//! ```
//!
//! Fields follow `FeatureDescriptor` declaration order; the three color
//! values are present only when flag bit 0 is set.

use crate::features::{FeatureDescriptor, HISTOGRAM_BINS, MOMENT_COUNT, TEXTURE_BINS};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"FGT1";
const VERSION: u8 = 1;
const FLAG_COLOR: u8 = 0b0000_0001;
const HEADER_LEN: usize = 8;
const BASE_FLOATS: usize = HISTOGRAM_BINS + TEXTURE_BINS + MOMENT_COUNT + 1 + 2;

/// Minimum number of accepted captures a template is built from.
pub const MIN_CAPTURES: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("need at least 2 captures, got {0}")]
    TooFewCaptures(usize),
    #[error("template too short: {0} bytes")]
    Truncated(usize),
    #[error("bad template magic")]
    BadMagic,
    #[error("unsupported template version {0}")]
    UnsupportedVersion(u8),
    #[error("template length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("template contains non-finite values")]
    NonFinite,
}

/// Aggregated enrollment template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub descriptor: FeatureDescriptor,
    pub capture_count: u16,
}

impl Template {
    /// Component-wise mean of the accepted descriptors.
    ///
    /// Color is averaged over the captures that carry it and is absent when
    /// none does.
    pub fn aggregate(descriptors: &[FeatureDescriptor]) -> Result<Self, TemplateError> {
        if descriptors.len() < MIN_CAPTURES {
            return Err(TemplateError::TooFewCaptures(descriptors.len()));
        }
        let n = descriptors.len() as f32;

        fn mean_array<const N: usize>(ds: &[FeatureDescriptor], pick: impl Fn(&FeatureDescriptor) -> &[f32; N]) -> [f32; N] {
            let mut out = [0f32; N];
            for d in ds {
                for (acc, v) in out.iter_mut().zip(pick(d)) {
                    *acc += v;
                }
            }
            let n = ds.len() as f32;
            out.iter_mut().for_each(|v| *v /= n);
            out
        }

        let colors: Vec<[f32; 3]> = descriptors.iter().filter_map(|d| d.color_mean).collect();
        let color_mean = if colors.is_empty() {
            None
        } else {
            let k = colors.len() as f32;
            let mut sum = [0f32; 3];
            for c in &colors {
                for i in 0..3 {
                    sum[i] += c[i];
                }
            }
            Some(sum.map(|s| s / k))
        };

        let descriptor = FeatureDescriptor {
            histogram: mean_array(descriptors, |d| &d.histogram),
            texture: mean_array(descriptors, |d| &d.texture),
            moments: mean_array(descriptors, |d| &d.moments),
            edge_density: descriptors.iter().map(|d| d.edge_density).sum::<f32>() / n,
            color_mean,
            gradient_mean: mean_array(descriptors, |d| &d.gradient_mean),
        };

        Ok(Self {
            descriptor,
            capture_count: descriptors.len().min(u16::MAX as usize) as u16,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let d = &self.descriptor;
        let floats = BASE_FLOATS + if d.color_mean.is_some() { 3 } else { 0 };
        let mut out = Vec::with_capacity(HEADER_LEN + floats * 4);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(if d.color_mean.is_some() { FLAG_COLOR } else { 0 });
        out.extend_from_slice(&self.capture_count.to_le_bytes());

        let mut put = |values: &[f32]| {
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        };
        put(&d.histogram);
        put(&d.texture);
        put(&d.moments);
        put(&[d.edge_density]);
        if let Some(color) = d.color_mean {
            put(&color);
        }
        put(&d.gradient_mean);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TemplateError> {
        if bytes.len() < HEADER_LEN {
            return Err(TemplateError::Truncated(bytes.len()));
        }
        if &bytes[..4] != MAGIC {
            return Err(TemplateError::BadMagic);
        }
        if bytes[4] != VERSION {
            return Err(TemplateError::UnsupportedVersion(bytes[4]));
        }
        let has_color = bytes[5] & FLAG_COLOR != 0;
        let capture_count = u16::from_le_bytes([bytes[6], bytes[7]]);
        if (capture_count as usize) < MIN_CAPTURES {
            return Err(TemplateError::TooFewCaptures(capture_count as usize));
        }

        let floats = BASE_FLOATS + if has_color { 3 } else { 0 };
        let expected = HEADER_LEN + floats * 4;
        if bytes.len() != expected {
            return Err(TemplateError::LengthMismatch { expected, actual: bytes.len() });
        }

        let values: Vec<f32> = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(TemplateError::NonFinite);
        }

        let mut cursor = values.iter().copied();
        let mut next = |slot: &mut [f32]| {
            for s in slot.iter_mut() {
                *s = cursor.next().unwrap_or_default();
            }
        };
        let mut histogram = [0f32; HISTOGRAM_BINS];
        let mut texture = [0f32; TEXTURE_BINS];
        let mut moments = [0f32; MOMENT_COUNT];
        let mut edge = [0f32; 1];
        let mut color = [0f32; 3];
        let mut gradient = [0f32; 2];
        next(&mut histogram);
        next(&mut texture);
        next(&mut moments);
        next(&mut edge);
        if has_color {
            next(&mut color);
        }
        next(&mut gradient);

        Ok(Self {
            descriptor: FeatureDescriptor {
                histogram,
                texture,
                moments,
                edge_density: edge[0],
                color_mean: has_color.then_some(color),
                gradient_mean: gradient,
            },
            capture_count,
        })
    }
}
