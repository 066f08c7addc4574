//! Motion-based liveness scoring.
//!
//! A printed photo or a phone screen held up to the camera barely changes
//! between the first and last frame of a short burst, while a seated
//! student shifts, blinks and breathes. The score is the mean absolute
//! pixel difference inside the face box between those two frames.
//!
//! # Threat Coverage
//!
//! - **Blocks:** static prints and paused screens held steady.
//! - **Does not block:** video replays, a photo waved around, masks.

use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Mean absolute intensity difference below which a face is treated as static.
pub const DEFAULT_MOTION_THRESHOLD: f32 = 7.0;

/// Tunable liveness decision rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessPolicy {
    pub motion_threshold: f32,
    /// Verdict used when motion cannot be measured (single-frame burst,
    /// face box outside the frame). `true` fails open.
    pub assume_live_if_no_baseline: bool,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            assume_live_if_no_baseline: true,
        }
    }
}

/// Liveness verdict for one face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessResult {
    pub is_live: bool,
    pub motion_score: f32,
    /// False when the verdict came from the policy fallback.
    pub assessed: bool,
}

/// Mean absolute difference between `prev` and `curr` inside `bbox`.
///
/// The box is clipped to the area both frames cover. Returns `None` when
/// the clipped region is empty.
pub fn region_motion(prev: &GrayImage, curr: &GrayImage, bbox: &BoundingBox) -> Option<f32> {
    let width = prev.width().min(curr.width());
    let height = prev.height().min(curr.height());
    let region = bbox.clip(width, height)?;

    let mut total = 0u64;
    for y in region.top as u32..region.bottom as u32 {
        for x in region.left as u32..region.right as u32 {
            let a = prev.get_pixel(x, y).0[0];
            let b = curr.get_pixel(x, y).0[0];
            total += a.abs_diff(b) as u64;
        }
    }

    Some(total as f32 / region.area() as f32)
}

/// Motion score for a face; exactly 0.0 when there is no baseline frame
/// or no overlap with the frame.
pub fn motion_score(prev: Option<&GrayImage>, curr: &GrayImage, bbox: &BoundingBox) -> f32 {
    prev.and_then(|p| region_motion(p, curr, bbox)).unwrap_or(0.0)
}

/// Score a face and apply the policy.
pub fn assess(
    prev: Option<&GrayImage>,
    curr: &GrayImage,
    bbox: &BoundingBox,
    policy: &LivenessPolicy,
) -> LivenessResult {
    match prev.and_then(|p| region_motion(p, curr, bbox)) {
        Some(score) => LivenessResult {
            is_live: score >= policy.motion_threshold,
            motion_score: score,
            assessed: true,
        },
        None => LivenessResult {
            is_live: policy.assume_live_if_no_baseline,
            motion_score: 0.0,
            assessed: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(w: u32, h: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([value]))
    }

    fn face() -> BoundingBox {
        BoundingBox::new(10, 30, 30, 10)
    }

    #[test]
    fn test_identical_frames_score_zero() {
        let a = flat(40, 40, 120);
        let result = assess(Some(&a), &a.clone(), &face(), &LivenessPolicy::default());
        assert_eq!(result.motion_score, 0.0);
        assert!(result.assessed);
        assert!(!result.is_live);
    }

    #[test]
    fn test_uniform_shift_scores_difference() {
        let a = flat(40, 40, 100);
        let b = flat(40, 40, 112);
        let result = assess(Some(&a), &b, &face(), &LivenessPolicy::default());
        assert!((result.motion_score - 12.0).abs() < 1e-6);
        assert!(result.is_live);
    }

    #[test]
    fn test_score_symmetric_under_swap() {
        let mut a = flat(40, 40, 50);
        let b = flat(40, 40, 60);
        a.put_pixel(15, 15, image::Luma([255]));
        assert_eq!(motion_score(Some(&a), &b, &face()), motion_score(Some(&b), &a, &face()));
    }

    #[test]
    fn test_no_baseline_scores_zero() {
        let curr = flat(40, 40, 90);
        assert_eq!(motion_score(None, &curr, &face()), 0.0);
    }

    #[test]
    fn test_no_baseline_follows_policy() {
        let curr = flat(40, 40, 90);
        let lenient = assess(None, &curr, &face(), &LivenessPolicy::default());
        assert!(lenient.is_live);
        assert!(!lenient.assessed);

        let strict = LivenessPolicy {
            assume_live_if_no_baseline: false,
            ..LivenessPolicy::default()
        };
        assert!(!assess(None, &curr, &face(), &strict).is_live);
    }

    #[test]
    fn test_box_outside_frame_not_assessed() {
        let a = flat(40, 40, 0);
        let b = flat(40, 40, 200);
        let outside = BoundingBox::new(100, 140, 140, 100);
        assert_eq!(region_motion(&a, &b, &outside), None);
        assert!(!assess(Some(&a), &b, &outside, &LivenessPolicy::default()).assessed);
    }

    #[test]
    fn test_region_only_counts_pixels_inside_box() {
        let a = flat(40, 40, 100);
        let mut b = a.clone();
        // Change everything outside the face box.
        for (x, y, p) in b.enumerate_pixels_mut() {
            if !(10..30).contains(&x) || !(10..30).contains(&y) {
                p.0[0] = 255;
            }
        }
        assert_eq!(motion_score(Some(&a), &b, &face()), 0.0);
    }

    #[test]
    fn test_partially_clipped_box() {
        let a = flat(20, 20, 10);
        let b = flat(20, 20, 30);
        let spill = BoundingBox::new(-10, 30, 10, 10);
        assert_eq!(region_motion(&a, &b, &spill), Some(20.0));
    }
}
