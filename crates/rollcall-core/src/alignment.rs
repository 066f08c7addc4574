//! Face alignment for ArcFace input.
//!
//! Maps the five SCRFD landmarks onto the InsightFace reference layout with
//! a least-squares similarity transform (scale, rotation, translation) and
//! resamples a 112×112 crop. Faces without landmarks fall back to a plain
//! box crop.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit over centred point sets.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let (sx, sy) = src.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        let (dx, dy) = dst.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        let (msx, msy) = (sx / n, sy / n);
        let (mdx, mdy) = (dx / n, dy / n);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut spread = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (px, py) = (s.0 - msx, s.1 - msy);
            let (qx, qy) = (d.0 - mdx, d.1 - mdy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            spread += px * px + py * py;
        }

        if spread < 1e-6 {
            return None;
        }

        let a = dot / spread;
        let b = cross / spread;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    /// Map an output pixel back into source coordinates.
    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        (
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        )
    }
}

/// Bilinear sample; out-of-bounds reads are black.
fn sample(image: &GrayImage, x: f32, y: f32) -> u8 {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x.floor(), y - y.floor());

    let px = |xi: i64, yi: i64| -> f32 {
        if xi < 0 || yi < 0 || xi >= w || yi >= h {
            0.0
        } else {
            image.get_pixel(xi as u32, yi as u32).0[0] as f32
        }
    };

    let top = px(x0, y0) * (1.0 - fx) + px(x0 + 1, y0) * fx;
    let bottom = px(x0, y0 + 1) * (1.0 - fx) + px(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Align a face to the canonical 112×112 ArcFace layout.
pub fn align_face(image: &GrayImage, landmarks: &[(f32, f32); 5]) -> Option<GrayImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;
    let mut out = GrayImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = transform.invert_point(ox as f32, oy as f32);
        *pixel = Luma([sample(image, sx, sy)]);
    }
    Some(out)
}

/// Crop the box and resize it to 112×112 without alignment.
pub fn crop_resize(image: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    let region = bbox.clip(image.width(), image.height())?;
    let crop = imageops::crop_imm(
        image,
        region.left as u32,
        region.top as u32,
        region.width() as u32,
        region.height() as u32,
    )
    .to_image();
    Some(imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3);
        assert!(t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_estimate_scale_and_translation() {
        // Source landmarks = reference scaled by 2 and shifted by (10, 20).
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 + 20.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4);

        let (x, y) = t.invert_point(REFERENCE_LANDMARKS_112[0].0, REFERENCE_LANDMARKS_112[0].1);
        assert!((x - src[0].0).abs() < 1e-2);
        assert!((y - src[0].1).abs() < 1e-2);
    }

    #[test]
    fn test_estimate_degenerate_points() {
        let collapsed = [(5.0, 5.0); 5];
        assert!(Similarity::estimate(&collapsed, &REFERENCE_LANDMARKS_112).is_none());
    }

    #[test]
    fn test_align_output_size() {
        let image = GrayImage::from_pixel(200, 200, Luma([90]));
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x + 40.0, y + 40.0));
        let aligned = align_face(&image, &src).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        // Fully inside a uniform image: every sample is the same value.
        assert!(aligned.pixels().all(|p| p.0[0] == 90));
    }

    #[test]
    fn test_crop_resize_outside_is_none() {
        let image = GrayImage::new(50, 50);
        assert!(crop_resize(&image, &BoundingBox::new(60, 90, 90, 60)).is_none());
        let crop = crop_resize(&image, &BoundingBox::new(0, 20, 20, 0)).unwrap();
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }
}
