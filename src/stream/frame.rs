//! Video frame data structures

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

/// Pixel layout of a decoded frame payload.
///
/// Network decoders emit packed BGR24 (`-pix_fmt bgr24`); HTTP MJPEG sources
/// and snapshot paths carry whole JPEG images. The bus contract is uniform:
/// consumers branch on the format, never on the camera mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// Packed 8-bit BGR, 3 bytes per pixel
    Bgr24,
    /// Complete JPEG image (SOI..EOI)
    Jpeg,
}

impl FrameFormat {
    /// Expected payload size for a given resolution.
    /// Returns None for compressed formats (variable size).
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        match self {
            FrameFormat::Bgr24 => Some(resolution.pixels() as usize * 3),
            FrameFormat::Jpeg => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, FrameFormat::Jpeg)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Bgr24 => write!(f, "BGR24"),
            FrameFormat::Jpeg => write!(f, "JPEG"),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is within the accepted range
    pub fn is_valid(&self) -> bool {
        (16..=7680).contains(&self.width) && (16..=7680).contains(&self.height)
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// A decoded video frame with metadata
///
/// The payload is a reference-counted byte buffer: publishing and fanning a
/// frame out to N subscribers never copies the pixels, only the handle.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame payload
    data: Bytes,
    /// Cached xxHash64 of the payload (lazy, shared across clones)
    hash: Arc<OnceLock<u64>>,
    /// Frame resolution
    pub resolution: Resolution,
    /// Payload format
    pub format: FrameFormat,
    /// Bus sequence number, strictly monotonic per camera
    pub sequence: u64,
    /// Monotonic timestamp taken at publication
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(data: Bytes, resolution: Resolution, format: FrameFormat, sequence: u64) -> Self {
        Self {
            data,
            hash: Arc::new(OnceLock::new()),
            resolution,
            format,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Get frame data as a byte slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Time since publication
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }

    /// Get hash of the payload (computed once, cached)
    ///
    /// Used by the encode cache to skip re-encoding identical payloads.
    pub fn content_hash(&self) -> u64 {
        *self
            .hash
            .get_or_init(|| xxhash_rust::xxh64::xxh64(&self.data, 0))
    }

    /// Validate JPEG bytes without constructing a frame
    pub fn is_valid_jpeg_bytes(data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        data[0] == 0xFF && data[1] == 0xD8 && data[data.len() - 2] == 0xFF && data[data.len() - 1] == 0xD9
    }
}

/// Frame metadata without the payload (for logging/stats)
#[derive(Debug, Clone, Serialize)]
pub struct FrameMeta {
    pub resolution: Resolution,
    pub format: FrameFormat,
    pub size: usize,
    pub sequence: u64,
}

impl From<&Frame> for FrameMeta {
    fn from(frame: &Frame) -> Self {
        Self {
            resolution: frame.resolution,
            format: frame.format,
            size: frame.len(),
            sequence: frame.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_bounds() {
        assert!(Resolution::new(16, 16).is_valid());
        assert!(Resolution::new(7680, 4320).is_valid());
        assert!(!Resolution::new(15, 720).is_valid());
        assert!(!Resolution::new(7681, 720).is_valid());
    }

    #[test]
    fn test_frame_size() {
        let res = Resolution::HD720;
        assert_eq!(
            FrameFormat::Bgr24.frame_size(res),
            Some(1280 * 720 * 3)
        );
        assert_eq!(FrameFormat::Jpeg.frame_size(res), None);
    }

    #[test]
    fn test_content_hash_shared_across_clones() {
        let frame = Frame::new(
            Bytes::from(vec![1u8, 2, 3, 4]),
            Resolution::new(16, 16),
            FrameFormat::Bgr24,
            1,
        );
        let clone = frame.clone();
        assert_eq!(frame.content_hash(), clone.content_hash());
    }

    #[test]
    fn test_jpeg_validation() {
        assert!(Frame::is_valid_jpeg_bytes(&[0xFF, 0xD8, 0x00, 0x10, 0xFF, 0xD9]));
        assert!(!Frame::is_valid_jpeg_bytes(&[0x00, 0x01, 0x02, 0x03]));
        assert!(!Frame::is_valid_jpeg_bytes(&[0xFF, 0xD8]));
    }
}
