use rollcall_core::liveness::LivenessPolicy;
use rollcall_core::CycleConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Largest cosine distance accepted as a match.
    pub match_threshold: f32,
    /// Mean absolute pixel difference a face needs to count as live.
    pub motion_threshold: f32,
    pub assume_live_if_no_baseline: bool,
    /// Frames per capture burst.
    pub burst_frames: usize,
    pub burst_spacing_ms: u64,
    /// Frames discarded before each burst while exposure settles.
    pub warmup_frames: usize,
    /// Margin around an unknown face when cropping it for registration.
    pub crop_margin: f32,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_model_dir());

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::data_home().join("rollcall").join("attendance.db"));

        let defaults = CycleConfig::default();

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE").unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_u32("ROLLCALL_CAMERA_WIDTH", 640),
            camera_height: env_u32("ROLLCALL_CAMERA_HEIGHT", 480),
            model_dir,
            db_path,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", defaults.match_threshold),
            motion_threshold: env_f32("ROLLCALL_MOTION_THRESHOLD", defaults.liveness.motion_threshold),
            assume_live_if_no_baseline: std::env::var("ROLLCALL_ASSUME_LIVE_IF_NO_BASELINE")
                .map(|v| v != "0")
                .unwrap_or(defaults.liveness.assume_live_if_no_baseline),
            burst_frames: env_usize("ROLLCALL_BURST_FRAMES", defaults.burst_frames),
            burst_spacing_ms: env_u64("ROLLCALL_BURST_SPACING_MS", defaults.burst_spacing.as_millis() as u64),
            warmup_frames: env_usize("ROLLCALL_WARMUP_FRAMES", 4),
            crop_margin: env_f32("ROLLCALL_CROP_MARGIN", defaults.crop_margin),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS").is_ok(),
        }
    }

    /// The subset of settings the capture cycle needs.
    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            burst_frames: self.burst_frames,
            burst_spacing: Duration::from_millis(self.burst_spacing_ms),
            match_threshold: self.match_threshold,
            liveness: LivenessPolicy {
                motion_threshold: self.motion_threshold,
                assume_live_if_no_baseline: self.assume_live_if_no_baseline,
            },
            crop_margin: self.crop_margin,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
