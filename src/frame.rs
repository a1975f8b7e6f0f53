use crate::error::{InspectorError, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit grayscale, the usual industrial camera output
    Mono8,
    /// Packed RGB, 3 bytes per pixel
    Rgb24,
    /// Packed BGR, 3 bytes per pixel
    Bgr24,
    /// Motion JPEG - compressed JPEG frames
    Mjpeg,
}

impl PixelFormat {
    /// Get bytes per pixel for the format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Mjpeg => 0, // Variable size, compressed
        }
    }

    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Stable numeric code used by the clip container
    pub fn code(&self) -> u8 {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb24 => 2,
            PixelFormat::Bgr24 => 3,
            PixelFormat::Mjpeg => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PixelFormat::Mono8),
            2 => Some(PixelFormat::Rgb24),
            3 => Some(PixelFormat::Bgr24),
            4 => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }

    /// Parse a configuration name such as `mono8` or `rgb24`
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mono8" | "mono" | "gray8" | "gray" => Some(PixelFormat::Mono8),
            "rgb24" | "rgb" => Some(PixelFormat::Rgb24),
            "bgr24" | "bgr" => Some(PixelFormat::Bgr24),
            "mjpeg" | "jpeg" | "mjpg" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// A single decoded image produced by a frame source.
///
/// The pixel buffer is immutable once produced. Cloning a frame hands out
/// another reference to the same buffer, so each consumer gets its own
/// handle without being able to mutate what the others see.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Per-source monotonic capture counter
    pub sequence: u64,
    /// Frame index within a file, `None` for live sources
    pub position: Option<u64>,
    /// Timestamp when frame was captured
    pub timestamp: SystemTime,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    pub format: PixelFormat,
    pub data: Arc<Vec<u8>>,
}

impl Frame {
    pub fn new(
        sequence: u64,
        timestamp: SystemTime,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            sequence,
            position: None,
            timestamp,
            width,
            height,
            format,
            data: Arc::new(data),
        }
    }

    pub fn with_position(mut self, position: u64) -> Self {
        self.position = Some(position);
        self
    }

    /// Get the expected frame size for uncompressed formats
    pub fn expected_size(&self) -> Option<usize> {
        if self.format.is_compressed() {
            None
        } else {
            Some(self.width as usize * self.height as usize * self.format.bytes_per_pixel())
        }
    }

    /// Validate frame data size against expected size
    pub fn validate_size(&self) -> bool {
        match self.expected_size() {
            Some(expected) => self.data.len() == expected,
            None => !self.data.is_empty(),
        }
    }

    /// An empty buffer marks a frame whose backing storage was already released
    pub fn is_released(&self) -> bool {
        self.data.is_empty()
    }

    /// Timestamp as nanoseconds since the Unix epoch
    pub fn timestamp_nanos(&self) -> u64 {
        self.timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }

    /// Decode into an `image` buffer for snapshots, export and classification
    pub fn to_image(&self) -> Result<DynamicImage> {
        if self.is_released() {
            return Err(frame_error(format!(
                "frame {} has no pixel data",
                self.sequence
            )));
        }

        match self.format {
            PixelFormat::Mono8 => {
                GrayImage::from_raw(self.width, self.height, self.data.to_vec())
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| self.size_mismatch())
            }
            PixelFormat::Rgb24 => RgbImage::from_raw(self.width, self.height, self.data.to_vec())
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| self.size_mismatch()),
            PixelFormat::Bgr24 => {
                let mut rgb = self.data.to_vec();
                for pixel in rgb.chunks_exact_mut(3) {
                    pixel.swap(0, 2);
                }
                RgbImage::from_raw(self.width, self.height, rgb)
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| self.size_mismatch())
            }
            PixelFormat::Mjpeg => image::load_from_memory(&self.data)
                .map_err(|e| frame_error(format!("JPEG decode failed: {}", e))),
        }
    }

    /// Grayscale view of the frame, decoding and converting as needed
    pub fn to_luma(&self) -> Result<GrayImage> {
        if self.format == PixelFormat::Mono8 {
            return GrayImage::from_raw(self.width, self.height, self.data.to_vec())
                .ok_or_else(|| self.size_mismatch());
        }
        Ok(self.to_image()?.to_luma8())
    }

    fn size_mismatch(&self) -> InspectorError {
        frame_error(format!(
            "frame {} has {} bytes, expected {:?} for {}x{} {:?}",
            self.sequence,
            self.data.len(),
            self.expected_size(),
            self.width,
            self.height,
            self.format
        ))
    }
}

fn frame_error(message: String) -> InspectorError {
    InspectorError::component("frame", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_properties() {
        assert_eq!(PixelFormat::Mono8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Bgr24.bytes_per_pixel(), 3);
        assert!(PixelFormat::Mjpeg.is_compressed());
        assert!(!PixelFormat::Rgb24.is_compressed());

        for format in [
            PixelFormat::Mono8,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Mjpeg,
        ] {
            assert_eq!(PixelFormat::from_code(format.code()), Some(format));
        }
        assert_eq!(PixelFormat::from_code(0), None);
        assert_eq!(PixelFormat::parse("Mono"), Some(PixelFormat::Mono8));
        assert_eq!(PixelFormat::parse("yuyv"), None);
    }

    #[test]
    fn test_frame_size_validation() {
        let valid = Frame::new(1, SystemTime::now(), vec![0u8; 64 * 48], 64, 48, PixelFormat::Mono8);
        assert!(valid.validate_size());

        let invalid = Frame::new(2, SystemTime::now(), vec![0u8; 100], 64, 48, PixelFormat::Rgb24);
        assert!(!invalid.validate_size());

        let jpeg = Frame::new(3, SystemTime::now(), vec![0u8; 5000], 64, 48, PixelFormat::Mjpeg);
        assert!(jpeg.validate_size());
    }

    #[test]
    fn test_released_frame() {
        let frame = Frame::new(7, SystemTime::now(), Vec::new(), 64, 48, PixelFormat::Mono8);
        assert!(frame.is_released());
        assert!(frame.to_image().is_err());
    }

    #[test]
    fn test_clones_share_buffer() {
        let frame = Frame::new(1, SystemTime::now(), vec![9u8; 16], 4, 4, PixelFormat::Mono8)
            .with_position(3);
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.data, &copy.data));
        assert_eq!(copy.position, Some(3));
    }

    #[test]
    fn test_bgr_to_image_swaps_channels() {
        let frame = Frame::new(1, SystemTime::now(), vec![10, 20, 30], 1, 1, PixelFormat::Bgr24);
        let image = frame.to_image().unwrap().to_rgb8();
        assert_eq!(image.get_pixel(0, 0).0, [30, 20, 10]);
    }
}
