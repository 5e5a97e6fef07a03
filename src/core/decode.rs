//! Image decoding for preview payloads.
//!
//! Payload bytes are whatever the backend encoded (PNG, JPEG or WebP in
//! practice). Decoding always produces 8-bit RGBA so hosts can upload it
//! without caring about the source format.
//!
//! **Used by**: decode jobs scheduled by `PreviewTracker` on the worker pool.

use image::RgbaImage;
use log::trace;
use std::fmt;
use std::sync::Arc;

/// Decoded preview frame (cheap to clone, shared between buffers)
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewImage {
    pixels: Arc<RgbaImage>,
}

impl PreviewImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels: Arc::new(pixels) }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn rgba(&self) -> &RgbaImage {
        &self.pixels
    }

    /// True if both handles point at the same decoded pixels
    pub fn ptr_eq(&self, other: &PreviewImage) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

/// Decode errors
#[derive(Debug)]
pub enum DecodeError {
    Empty,
    Image(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "Empty image payload"),
            DecodeError::Image(e) => write!(f, "Image error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Turns encoded payload bytes into a drawable image.
///
/// Runs on worker threads, hence `Send + Sync`.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<PreviewImage, DecodeError>;
}

/// Decoder backed by the `image` crate (format sniffed from magic bytes)
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PreviewImage, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let img = image::load_from_memory(bytes).map_err(|e| DecodeError::Image(e.to_string()))?;
        let rgba = img.to_rgba8();
        trace!("Decoded preview payload: {}x{} ({} bytes)", rgba.width(), rgba.height(), bytes.len());
        Ok(PreviewImage::new(rgba))
    }
}

/// Blanket impl so decoders can be shared behind an Arc
impl<T: ImageDecoder + ?Sized> ImageDecoder for Arc<T> {
    fn decode(&self, bytes: &[u8]) -> Result<PreviewImage, DecodeError> {
        (**self).decode(bytes)
    }
}

/// Encode a solid-colour RGBA image as PNG (test and replay helper)
pub fn encode_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut out = std::io::Cursor::new(Vec::new());
    // Writing into a Vec cannot fail for a well-formed RgbaImage
    if img.write_to(&mut out, image::ImageFormat::Png).is_err() {
        return Vec::new();
    }
    out.into_inner()
}
