use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable surrogate key of a registered student.
///
/// Used as the foreign key everywhere; the roll number is editable and
/// never referenced by attendance rows.
pub type IdentityId = i64;

/// Pixel-space face box, stored in (top, right, bottom, left) order.
///
/// `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl BoundingBox {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> i32 {
        self.right.saturating_sub(self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        self.bottom.saturating_sub(self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// Clip the box to a `width` × `height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clip(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        let clipped = BoundingBox {
            top: self.top.clamp(0, h),
            right: self.right.clamp(0, w),
            bottom: self.bottom.clamp(0, h),
            left: self.left.clamp(0, w),
        };
        (clipped.area() > 0).then_some(clipped)
    }

    /// Grow every side by `margin` times the box's own width/height.
    pub fn expand(&self, margin: f32) -> BoundingBox {
        let dx = (self.width() as f32 * margin).round() as i32;
        let dy = (self.height() as f32 * margin).round() as i32;
        BoundingBox {
            top: self.top.saturating_sub(dy),
            right: self.right.saturating_add(dx),
            bottom: self.bottom.saturating_add(dy),
            left: self.left.saturating_sub(dx),
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// Degenerate inputs (zero norm, mismatched dimensions) have similarity 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance `1 - similarity`, in [0, 2].
    ///
    /// Returns exactly 1.0 ("no similarity") for a zero-norm vector or a
    /// dimension mismatch instead of dividing by zero.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() || self.norm() == 0.0 || other.norm() == 0.0 {
            return 1.0;
        }
        (1.0 - self.similarity(other)).clamp(0.0, 2.0)
    }
}

/// A registered student as stored in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub roll_no: String,
    pub name: String,
    pub class: String,
    pub section: String,
    pub email: String,
    pub has_embedding: bool,
}

/// Fields needed to create a new roster row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIdentity {
    pub roll_no: String,
    pub name: String,
    pub class: String,
    pub section: String,
    pub email: String,
}

/// One known face in a [`Gallery`] snapshot.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: IdentityId,
    pub name: String,
    pub embedding: Embedding,
}

/// Immutable in-memory snapshot of every identity with an embedding.
///
/// Never patched in place: a reload builds a new snapshot which callers
/// swap in wholesale.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<GalleryEntry> for Gallery {
    fn from_iter<T: IntoIterator<Item = GalleryEntry>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown attendance status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for AttendanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// An attendance row about to be appended to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttendance {
    pub identity_id: IdentityId,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
    /// Operator who triggered the mark, if known.
    pub marked_by: Option<i64>,
}
