//! Frames and the frame-source boundary.
//!
//! - `Frame`: Immutable image buffer + capture timestamp + source identifier.
//! - `FrameSource`: Pull-based boundary to the acquisition subsystem.
//!
//! A frame is never mutated after construction. Stages receive it behind an
//! `Arc` and the pixel buffer is zeroized when the last holder drops it.
//! Only confirmation stages see pixels, and a remote stage may upload them.
//! Notifications and outcome records reference a frame by its SHA-256
//! fingerprint.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroize;

use crate::{SourceId, Timestamp};

/// Pixel layout of a frame buffer.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// One byte of luma per pixel.
    Gray8,
    /// Three bytes per pixel, interleaved.
    Rgb8,
    /// Encoded JPEG. Requires the `frame-jpeg` feature to decode.
    Jpeg,
}

impl PixelFormat {
    fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Rgb8 => Some(3),
            PixelFormat::Jpeg => None,
        }
    }
}

/// Input errors: the frame cannot be turned into pixels.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions {width}x{height} are invalid")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("expected {expected} bytes for {format:?} frame, received {actual}")]
    LengthMismatch {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("frame could not be decoded: {0}")]
    Undecodable(String),
}

/// Immutable frame. There is no `Clone` and no mutable accessor.
pub struct Frame {
    source: SourceId,
    captured_at: Timestamp,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(
        source: SourceId,
        captured_at: Timestamp,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Self {
        Self {
            source,
            captured_at,
            width,
            height,
            format,
            data,
        }
    }

    /// Convenience constructor for single-channel frames.
    pub fn gray(source: SourceId, captured_at: Timestamp, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self::new(source, captured_at, width, height, PixelFormat::Gray8, data)
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn captured_at(&self) -> Timestamp {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw buffer, read-only. Stages treat it as ephemeral.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// SHA-256 of the raw buffer, hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest: [u8; 32] = Sha256::digest(&self.data).into();
        hex::encode(digest)
    }

    /// Decode to one luma byte per pixel, validating the buffer.
    ///
    /// Raw formats are checked against `width * height * channels`.
    pub fn luma(&self) -> Result<Cow<'_, [u8]>, FrameError> {
        let pixel_count = (self.width as usize)
            .checked_mul(self.height as usize)
            .filter(|count| *count > 0)
            .ok_or(FrameError::InvalidDimensions {
                width: self.width,
                height: self.height,
            })?;

        match self.format.bytes_per_pixel() {
            Some(bpp) => {
                let expected = pixel_count
                    .checked_mul(bpp)
                    .ok_or(FrameError::InvalidDimensions {
                        width: self.width,
                        height: self.height,
                    })?;
                if self.data.len() != expected {
                    return Err(FrameError::LengthMismatch {
                        format: self.format,
                        expected,
                        actual: self.data.len(),
                    });
                }
                if bpp == 1 {
                    Ok(Cow::Borrowed(&self.data))
                } else {
                    Ok(Cow::Owned(rgb_to_luma(&self.data)))
                }
            }
            None => decode_jpeg_luma(&self.data, self.width, self.height).map(Cow::Owned),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("source", &self.source)
            .field("captured_at", &self.captured_at)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

fn rgb_to_luma(rgb: &[u8]) -> Vec<u8> {
    // Integer BT.601 weights: deterministic across platforms.
    rgb.chunks_exact(3)
        .map(|px| ((77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8) as u8)
        .collect()
}

#[cfg(feature = "frame-jpeg")]
fn decode_jpeg_luma(bytes: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    use image::GenericImageView;

    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Undecodable(e.to_string()))?;
    let (w, h) = image.dimensions();
    if (w, h) != (width, height) {
        return Err(FrameError::Undecodable(format!(
            "decoded {}x{}, frame declares {}x{}",
            w, h, width, height
        )));
    }
    Ok(image.into_luma8().into_raw())
}

#[cfg(not(feature = "frame-jpeg"))]
fn decode_jpeg_luma(_bytes: &[u8], _width: u32, _height: u32) -> Result<Vec<u8>, FrameError> {
    Err(FrameError::Undecodable(
        "jpeg frames require the frame-jpeg feature".to_string(),
    ))
}

// ----------------------------------------------------------------------------
// FrameSource: pull boundary to acquisition
// ----------------------------------------------------------------------------

/// Result of one read from a source.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// No frame arrived within the read timeout.
    Idle,
    EndOfStream,
}

/// Pull-based frame source owned by the acquisition subsystem.
///
/// `next_frame` must not block longer than `timeout`. Read failures are
/// returned as errors; the caller decides whether to keep pulling.
pub trait FrameSource: Send {
    fn source_id(&self) -> &SourceId;

    fn next_frame(&mut self, timeout: Duration) -> Result<FrameRead>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame::new(
            SourceId::new("cam"),
            Timestamp::from_millis(0),
            width,
            height,
            format,
            data,
        )
    }

    #[test]
    fn gray_frame_borrows_buffer() {
        let f = frame(PixelFormat::Gray8, 2, 2, vec![1, 2, 3, 4]);
        let luma = f.luma().unwrap();
        assert!(matches!(luma, Cow::Borrowed(_)));
        assert_eq!(&*luma, &[1, 2, 3, 4]);
    }

    #[test]
    fn rgb_frame_converts_to_luma() {
        let f = frame(PixelFormat::Rgb8, 2, 1, vec![255, 255, 255, 0, 0, 0]);
        let luma = f.luma().unwrap();
        assert_eq!(luma.len(), 2);
        assert!(luma[0] >= 254);
        assert_eq!(luma[1], 0);
    }

    #[test]
    fn truncated_frame_is_input_error() {
        let f = frame(PixelFormat::Rgb8, 4, 4, vec![0; 10]);
        assert_eq!(
            f.luma().unwrap_err(),
            FrameError::LengthMismatch {
                format: PixelFormat::Rgb8,
                expected: 48,
                actual: 10
            }
        );
    }

    #[test]
    fn zero_sized_frame_is_input_error() {
        let f = frame(PixelFormat::Gray8, 0, 4, vec![]);
        assert!(matches!(
            f.luma(),
            Err(FrameError::InvalidDimensions { .. })
        ));
    }

    #[cfg(not(feature = "frame-jpeg"))]
    #[test]
    fn jpeg_without_feature_is_undecodable() {
        let f = frame(PixelFormat::Jpeg, 4, 4, vec![0xFF, 0xD8]);
        assert!(matches!(f.luma(), Err(FrameError::Undecodable(_))));
    }

    #[test]
    fn fingerprint_depends_only_on_pixels() {
        let a = frame(PixelFormat::Gray8, 2, 1, vec![9, 9]);
        let b = Frame::gray(SourceId::new("other"), Timestamp::from_millis(77), 2, 1, vec![9, 9]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn debug_does_not_print_pixels() {
        let f = frame(PixelFormat::Gray8, 1, 1, vec![200]);
        let rendered = format!("{:?}", f);
        assert!(rendered.contains("bytes: 1"));
        assert!(!rendered.contains("200"));
    }
}
