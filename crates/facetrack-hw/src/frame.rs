//! Captured frames and what enrollment needs from them: a luma view for
//! lighting checks and the fixed-size JPEG samples that get stored.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

/// Side length, in pixels, of the square sample images sent for enrollment.
pub const SAMPLE_IMAGE_SIZE: u32 = 150;

/// JPEG quality used for encoded samples.
pub const SAMPLE_JPEG_QUALITY: u8 = 90;

/// Luma below this counts as an unlit pixel.
const UNLIT_LUMA: u8 = 32;

/// Share of unlit pixels above which a frame is not kept as a face sample.
pub const DARK_FRAME_SHARE: f32 = 0.95;

/// Layout of the bytes in [`Frame::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// One byte per pixel.
    Gray,
    /// Three bytes per pixel, R G B.
    Rgb,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Rgb => 3,
        }
    }
}

/// A captured camera frame.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Per-pixel luma whatever the layout. RGB uses integer BT.601 weights,
    /// so a saturated blue frame reads as dark like it looks.
    fn luma(&self) -> Vec<u8> {
        match self.layout {
            PixelLayout::Gray => self.data.clone(),
            PixelLayout::Rgb => self
                .data
                .chunks_exact(3)
                .map(|px| {
                    let y = 77 * u32::from(px[0]) + 150 * u32::from(px[1]) + 29 * u32::from(px[2]);
                    (y >> 8) as u8
                })
                .collect(),
        }
    }

    /// Mean luma, 0 to 255. `facetrack test` prints it per frame so poor
    /// lighting at the check-in point shows up before anyone enrolls.
    pub fn avg_brightness(&self) -> f32 {
        let luma = self.luma();
        if luma.is_empty() {
            return 0.0;
        }
        luma.iter().map(|&y| f32::from(y)).sum::<f32>() / luma.len() as f32
    }

    /// Whether the frame is too dark to keep as an enrollment or recognition sample.
    pub fn is_dark(&self) -> bool {
        mostly_unlit(&self.luma(), DARK_FRAME_SHARE)
    }

    /// Check dimensions and buffer length before the frame is used.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::ZeroDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.width as usize * self.height as usize * self.layout.bytes_per_pixel();
        if self.data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Downscale to a `size`×`size` square and encode as JPEG.
    ///
    /// The frame is stretched, not cropped, matching how the samples were
    /// drawn onto a fixed-size canvas before upload.
    pub fn encode_jpeg(&self, size: u32, quality: u8) -> Result<Vec<u8>, FrameError> {
        self.validate()?;
        let pixels = self.width as usize * self.height as usize * self.layout.bytes_per_pixel();
        let raw = self.data[..pixels].to_vec();

        let mut out = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            match self.layout {
                PixelLayout::Gray => {
                    let img = GrayImage::from_raw(self.width, self.height, raw)
                        .ok_or(FrameError::BufferMismatch)?;
                    let resized = imageops::resize(&img, size, size, FilterType::Triangle);
                    encoder.encode_image(&resized)?;
                }
                PixelLayout::Rgb => {
                    let img = RgbImage::from_raw(self.width, self.height, raw)
                        .ok_or(FrameError::BufferMismatch)?;
                    let resized = imageops::resize(&img, size, size, FilterType::Triangle);
                    encoder.encode_image(&resized)?;
                }
            }
        }
        Ok(out)
    }

    /// Encode with the standard sample size and quality.
    pub fn encode_sample(&self) -> Result<Vec<u8>, FrameError> {
        self.encode_jpeg(SAMPLE_IMAGE_SIZE, SAMPLE_JPEG_QUALITY)
    }
}

/// Luma plane of a packed YUYV 4:2:2 buffer.
///
/// Most webcams hand the V4L2 backend YUYV. Face samples are kept in
/// grayscale, so only the leading Y byte of each two-byte pixel slot is used
/// and the shared chroma is dropped. Trailing bytes past `width`×`height`
/// pixels are ignored.
pub fn yuyv_luma(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let needed = width as usize * height as usize * 2;
    let packed = yuyv.get(..needed).ok_or(FrameError::InvalidLength {
        expected: needed,
        actual: yuyv.len(),
    })?;
    Ok(packed.chunks_exact(2).map(|slot| slot[0]).collect())
}

/// Whether more than `max_share` of the luma values are unlit. An empty
/// plane has nothing to recognize and counts as dark.
pub fn mostly_unlit(luma: &[u8], max_share: f32) -> bool {
    if luma.is_empty() {
        return true;
    }
    let unlit = luma.iter().filter(|&&y| y < UNLIT_LUMA).count();
    unlit as f32 > max_share * luma.len() as f32
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has zero dimensions ({width}x{height}); stream not ready")]
    ZeroDimensions { width: u32, height: u32 },
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame buffer does not match its dimensions")]
    BufferMismatch,
    #[error("encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, layout: PixelLayout, fill: u8) -> Frame {
        Frame {
            data: vec![fill; width as usize * height as usize * layout.bytes_per_pixel()],
            width,
            height,
            layout,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn test_yuyv_luma() {
        // Two pixel slots per row, two rows, plus a stray trailing byte.
        let yuyv = [100, 128, 200, 128, 30, 90, 40, 90, 7];
        assert_eq!(yuyv_luma(&yuyv, 2, 2).unwrap(), vec![100, 200, 30, 40]);
        assert!(matches!(
            yuyv_luma(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_unlit_share() {
        assert!(mostly_unlit(&[0u8; 1000], DARK_FRAME_SHARE));
        assert!(!mostly_unlit(&[128u8; 1000], DARK_FRAME_SHARE));
        assert!(mostly_unlit(&[], DARK_FRAME_SHARE));

        // A dim room with a lit badge in frame is still too dark.
        let mut dim = vec![10u8; 960];
        dim.extend([128u8; 40]);
        assert!(mostly_unlit(&dim, DARK_FRAME_SHARE));
        dim[..20].fill(200);
        assert!(!mostly_unlit(&dim, DARK_FRAME_SHARE));
    }

    #[test]
    fn test_rgb_brightness_uses_luma() {
        assert_eq!(frame(4, 4, PixelLayout::Gray, 100).avg_brightness(), 100.0);
        assert_eq!(frame(4, 4, PixelLayout::Rgb, 140).avg_brightness(), 140.0);
        assert_eq!(frame(0, 0, PixelLayout::Gray, 0).avg_brightness(), 0.0);

        let solid = |rgb: [u8; 3]| Frame {
            data: rgb.repeat(16),
            ..frame(4, 4, PixelLayout::Rgb, 0)
        };
        assert!(solid([0, 0, 255]).is_dark());
        assert!(!solid([0, 255, 0]).is_dark());
        assert!(solid([0, 0, 0]).is_dark());
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let f = frame(0, 480, PixelLayout::Rgb, 120);
        assert!(matches!(
            f.encode_sample(),
            Err(FrameError::ZeroDimensions { width: 0, height: 480 })
        ));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut f = frame(8, 8, PixelLayout::Rgb, 120);
        f.data.truncate(10);
        assert!(matches!(f.validate(), Err(FrameError::InvalidLength { .. })));
    }

    #[test]
    fn test_encode_sample_produces_jpeg() {
        for layout in [PixelLayout::Gray, PixelLayout::Rgb] {
            let jpeg = frame(64, 48, layout, 140).encode_sample().unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "missing SOI marker");
            assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9], "missing EOI marker");
        }
    }
}
