//! Gallery matching by cosine distance.

use crate::types::{Embedding, Gallery, IdentityId};
use serde::Serialize;

/// Maximum cosine distance accepted as a positive identification.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.35;

/// Display name given to faces that match nobody.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Distance reported when the gallery had no candidate at all.
///
/// Larger than any real cosine distance (which tops out at 2.0).
pub const NO_CANDIDATE_DISTANCE: f32 = 10.0;

/// Result of matching one probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity_id: Option<IdentityId>,
    pub name: String,
    /// Cosine distance to the closest gallery entry, even when rejected.
    pub distance: f32,
}

impl MatchResult {
    fn unknown(distance: f32) -> Self {
        Self {
            identity_id: None,
            name: UNKNOWN_NAME.to_string(),
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// Strategy for resolving a probe embedding against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult;
}

/// Nearest-neighbour matcher over cosine distance.
///
/// Scans the whole gallery; on equal distances the entry encountered
/// first wins.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult {
        let mut best_dist = NO_CANDIDATE_DISTANCE;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let dist = probe.distance(&entry.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= self.threshold => {
                let entry = &gallery.entries()[idx];
                MatchResult {
                    identity_id: Some(entry.identity_id),
                    name: entry.name.clone(),
                    distance: best_dist,
                }
            }
            _ => MatchResult::unknown(best_dist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GalleryEntry;

    fn entry(id: IdentityId, name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            identity_id: id,
            name: name.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_self_query_matches_with_zero_distance() {
        let e = vec![0.2, -0.4, 0.1, 0.9];
        let gallery = Gallery::new(vec![
            entry(1, "decoy", vec![0.9, 0.1, 0.0, 0.0]),
            entry(7, "asha", e.clone()),
        ]);

        let result = CosineMatcher::default().compare(&Embedding::new(e), &gallery);
        assert_eq!(result.identity_id, Some(7));
        assert_eq!(result.name, "asha");
        assert!(result.distance.abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher::default().compare(&probe, &Gallery::default());
        assert!(!result.is_known());
        assert_eq!(result.name, UNKNOWN_NAME);
        assert_eq!(result.distance, NO_CANDIDATE_DISTANCE);
    }

    #[test]
    fn test_small_noise_matches() {
        let gallery = Gallery::new(vec![entry(1, "ravi", vec![1.0, 0.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.2, 0.0]);

        let result = CosineMatcher::new(0.35).compare(&probe, &gallery);
        assert_eq!(result.identity_id, Some(1));
        assert!((result.distance - 0.02).abs() < 0.005, "distance {}", result.distance);
    }

    #[test]
    fn test_orthogonal_probe_is_unknown() {
        let gallery = Gallery::new(vec![entry(1, "ravi", vec![1.0, 0.0, 0.0])]);
        let probe = Embedding::new(vec![0.0, 1.0, 0.0]);

        let result = CosineMatcher::new(0.35).compare(&probe, &gallery);
        assert_eq!(result.identity_id, None);
        assert_eq!(result.name, UNKNOWN_NAME);
        assert!((result.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gallery = Gallery::new(vec![entry(3, "mei", vec![1.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.5]);
        let d = probe.distance(&gallery.entries()[0].embedding);

        assert!(CosineMatcher::new(d).compare(&probe, &gallery).is_known());
        assert!(!CosineMatcher::new(d - 1e-4).compare(&probe, &gallery).is_known());
    }

    #[test]
    fn test_tie_resolves_to_first_entry() {
        let gallery = Gallery::new(vec![
            entry(10, "first", vec![1.0, 0.0]),
            entry(11, "second", vec![1.0, 0.0]),
        ]);
        let result = CosineMatcher::default().compare(&Embedding::new(vec![1.0, 0.0]), &gallery);
        assert_eq!(result.identity_id, Some(10));
    }

    #[test]
    fn test_zero_norm_probe_never_matches() {
        let gallery = Gallery::new(vec![entry(1, "ravi", vec![1.0, 0.0])]);
        let result = CosineMatcher::default().compare(&Embedding::new(vec![0.0, 0.0]), &gallery);
        // Degenerate probe sits at distance 1.0 from everything.
        assert_eq!(result.distance, 1.0);
        assert!(!result.is_known());
    }
}
