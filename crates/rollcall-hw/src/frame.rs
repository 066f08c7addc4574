//! Frame type and pixel conversions: YUYV, MJPEG, dark detection.

use image::{GrayImage, ImageFormat};
use std::time::Instant;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: GrayImage,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let data = self.image.as_raw();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y samples.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let luma: Vec<u8> = yuyv[..expected].iter().step_by(2).copied().collect();
    gray_from_raw(luma, width, height)
}

/// Wrap an 8-bit GREY buffer, ignoring any trailing padding.
pub fn grey_to_image(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height) as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    gray_from_raw(buf[..expected].to_vec(), width, height)
}

/// Decode one MJPEG frame and drop colour.
pub fn mjpeg_to_grayscale(jpeg: &[u8]) -> Result<GrayImage, FrameError> {
    Ok(image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?.to_luma8())
}

fn gray_from_raw(luma: Vec<u8>, width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let actual = luma.len();
    GrayImage::from_raw(width, height, luma).ok_or(FrameError::InvalidLength {
        expected: (width * height) as usize,
        actual,
    })
}

/// True if more than `threshold_pct` of pixels are in the darkest bucket (0–31).
///
/// Webcams often deliver black frames while auto-exposure settles.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let gray = yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(gray.as_raw(), &vec![100, 200]);
        assert_eq!(gray.dimensions(), (2, 1));
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_grayscale(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_ignores_padding() {
        let buf: Vec<u8> = (0..10).collect();
        let gray = grey_to_image(&buf, 4, 2).unwrap();
        assert_eq!(gray.as_raw(), &(0..8).collect::<Vec<u8>>());
        assert!(grey_to_image(&buf, 4, 4).is_err());
    }

    #[test]
    fn test_mjpeg_roundtrip_is_gray() {
        let src = image::RgbImage::from_pixel(8, 6, image::Rgb([200, 200, 200]));
        let mut jpeg = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(src)
            .write_to(&mut jpeg, ImageFormat::Jpeg)
            .unwrap();

        let gray = mjpeg_to_grayscale(jpeg.get_ref()).unwrap();
        assert_eq!(gray.dimensions(), (8, 6));
        assert!(gray.pixels().all(|p| p.0[0].abs_diff(200) < 8));
        assert!(mjpeg_to_grayscale(b"not a jpeg").is_err());
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[0u8; 1000], 0.95));
        assert!(!is_dark_frame(&[128u8; 1000], 0.95));
        assert!(is_dark_frame(&[], 0.95));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, 0.95));

        let mut borderline = vec![10u8; 940];
        borderline.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&borderline, 0.95));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame {
            image: GrayImage::from_raw(2, 1, vec![100, 200]).unwrap(),
            timestamp: Instant::now(),
            sequence: 0,
        };
        assert_eq!(frame.avg_brightness(), 150.0);
    }
}
