//! rollcall-core: Face matching and attendance decisions.
//!
//! SCRFD detection and ArcFace embeddings run via ONNX Runtime. On top of
//! them sit a cosine gallery matcher, a frame-difference liveness check,
//! and the per-capture decision cycle that writes at most one Present row
//! per student per day.

pub mod alignment;
pub mod cycle;
pub mod detector;
pub mod extractor;
pub mod liveness;
pub mod matcher;
pub mod recognizer;
pub mod registration;
pub mod render;
pub mod session;
pub mod store;
pub mod types;

pub use cycle::{run_capture_cycle, CaptureOutcome, CycleConfig, CycleError, FrameSource, LogLine};
pub use extractor::{FaceExtractor, OnnxExtractor};
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use registration::{register_pending_face, RegistrationForm, RegistrationOutcome};
pub use session::SessionState;
pub use store::{AttendanceLedger, Roster};
pub use types::{AttendanceStatus, BoundingBox, Embedding, Gallery, IdentityId};

use std::path::PathBuf;

/// Directory holding `det_10g.onnx` and `w600k_r50.onnx`.
///
/// `$XDG_DATA_HOME/rollcall/models`, falling back to
/// `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("rollcall").join("models")
}

/// Base directory for per-user application data.
pub fn data_home() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("share"),
        None => PathBuf::from("/var/lib"),
    }
}
