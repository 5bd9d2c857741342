//! Image decoding and normalization to an RGB raster.
//!
//! Accepts raw encoded bytes or base64 text, optionally carrying a
//! `data:<media-type>;base64,` prefix as produced by browser capture code.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image input is empty")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed image: {0}")]
    Malformed(#[from] image::ImageError),
    #[error("image has zero width or height")]
    ZeroSized,
}

/// Image payload as handed over by a collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageInput {
    /// Encoded image bytes (JPEG, PNG, ...).
    Bytes(Vec<u8>),
    /// Base64 text, optionally prefixed with a data-URI header.
    Base64(String),
}

impl ImageInput {
    pub fn decode(&self) -> Result<CapturedImage, DecodeError> {
        match self {
            ImageInput::Bytes(bytes) => decode_image(bytes),
            ImageInput::Base64(text) => decode_base64(text),
        }
    }

    /// Size of the payload as received, before any decoding.
    pub fn len(&self) -> usize {
        match self {
            ImageInput::Bytes(b) => b.len(),
            ImageInput::Base64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded capture. Lives for a single pipeline call.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub raster: RgbImage,
    /// Encoded size in bytes.
    pub source_len: usize,
    /// Container format recognised from the magic bytes.
    pub format: Option<ImageFormat>,
}

impl CapturedImage {
    /// Wrap an in-memory raster (already decoded by the caller).
    pub fn from_raster(raster: RgbImage) -> Self {
        Self {
            source_len: raster.as_raw().len(),
            raster,
            format: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }
}

/// Decode encoded image bytes into an RGB raster.
pub fn decode_image(bytes: &[u8]) -> Result<CapturedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let format = image::guess_format(bytes).ok();
    let dynamic = image::load_from_memory(bytes)?;
    let raster = dynamic.to_rgb8();
    if raster.width() == 0 || raster.height() == 0 {
        return Err(DecodeError::ZeroSized);
    }

    tracing::debug!(
        bytes = bytes.len(),
        width = raster.width(),
        height = raster.height(),
        ?format,
        "decoded capture"
    );

    Ok(CapturedImage {
        raster,
        source_len: bytes.len(),
        format,
    })
}

/// Decode base64 text (with or without a data-URI prefix) into an RGB raster.
pub fn decode_base64(text: &str) -> Result<CapturedImage, DecodeError> {
    let payload = strip_data_uri(text);
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    // `base64` and mail encoders wrap lines; the alphabet has no whitespace.
    let compact: Vec<u8> = payload.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    let bytes = STANDARD.decode(compact)?;
    decode_image(&bytes)
}

/// Remove a `data:<media>;base64,` header and surrounding whitespace.
pub fn strip_data_uri(text: &str) -> &str {
    let text = text.trim();
    if text.starts_with("data:") {
        match text.split_once(',') {
            Some((_, payload)) => payload.trim(),
            None => "",
        }
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let bytes = png_bytes(8, 6);
        let captured = decode_image(&bytes).unwrap();
        assert_eq!(captured.width(), 8);
        assert_eq!(captured.height(), 6);
        assert_eq!(captured.format, Some(ImageFormat::Png));
        assert_eq!(captured.source_len, bytes.len());
        assert_eq!(captured.raster.get_pixel(2, 3), &Rgb([20, 30, 128]));
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode_image(&[]), Err(DecodeError::Empty)));
        assert!(matches!(decode_base64("   "), Err(DecodeError::Empty)));
        assert!(matches!(decode_base64("data:image/png;base64,"), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_bad_base64() {
        let err = decode_base64("data:image/jpeg;base64,@@@not-base64@@@").unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));
    }

    #[test]
    fn test_decode_data_uri() {
        let bytes = png_bytes(4, 4);
        let text = format!("data:image/png;base64,{}", STANDARD.encode(&bytes));
        let captured = decode_base64(&text).unwrap();
        assert_eq!(captured.width(), 4);

        let plain = STANDARD.encode(&bytes);
        let captured = ImageInput::Base64(plain).decode().unwrap();
        assert_eq!(captured.height(), 4);
    }

    #[test]
    fn test_decode_wrapped_base64() {
        let bytes = png_bytes(32, 32);
        let encoded = STANDARD.encode(&bytes);
        let wrapped = encoded
            .as_bytes()
            .chunks(76)
            .map(|line| std::str::from_utf8(line).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(wrapped.contains('\n'));

        let captured = decode_base64(&format!("{wrapped}\n")).unwrap();
        assert_eq!(captured.width(), 32);
        let captured = decode_base64(&format!("data:image/png;base64,{}", wrapped.replace('\n', "\r\n"))).unwrap();
        assert_eq!(captured.height(), 32);
    }

    #[test]
    fn test_strip_data_uri() {
        assert_eq!(strip_data_uri("data:image/jpeg;base64,QUJD"), "QUJD");
        assert_eq!(strip_data_uri("  QUJD \n"), "QUJD");
        assert_eq!(strip_data_uri("data:nonsense"), "");
    }
}
