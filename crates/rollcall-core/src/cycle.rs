//! Attendance decision engine: one full cycle per capture trigger.
//!
//! `CAPTURED → MATCHED → LIVENESS-SCORED → PARTITIONED → LEDGER-UPDATED`.
//! The last frame of the burst is the decision frame and the first one is
//! the liveness baseline. Every face in the decision frame is matched and
//! scored on its own, then sorted into live-known, spoof-suspect and
//! live-unknown. Known live faces are written to the ledger at most once
//! per day; the largest unknown live face becomes the session's pending
//! registration.

use crate::extractor::{ExtractorError, FaceExtractor};
use crate::liveness::{self, LivenessPolicy};
use crate::matcher::{CosineMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::render;
use crate::session::{PendingRegistration, SessionState};
use crate::store::AttendanceLedger;
use crate::types::{AttendanceStatus, BoundingBox, Embedding, Gallery, IdentityId, NewAttendance};
use chrono::NaiveDateTime;
use image::{imageops, GrayImage, RgbImage};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from the frame source. Either way nothing is written.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("a face is waiting for registration; register or abandon it first")]
    RegistrationPending,
    #[error(transparent)]
    Acquisition(#[from] CaptureError),
    #[error("no frames captured")]
    NoFrames,
    #[error("face extraction failed: {0}")]
    Extraction(#[from] ExtractorError),
}

/// A camera that can grab a short burst of grayscale frames.
pub trait FrameSource {
    fn capture_burst(&mut self, count: usize, spacing: Duration) -> Result<Vec<GrayImage>, CaptureError>;
}

/// Knobs for one capture cycle.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub burst_frames: usize,
    pub burst_spacing: Duration,
    pub match_threshold: f32,
    pub liveness: LivenessPolicy,
    /// Extra context around an unknown face's box when cropping it, as a
    /// fraction of the box size.
    pub crop_margin: f32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            burst_frames: 5,
            burst_spacing: Duration::from_millis(150),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            liveness: LivenessPolicy::default(),
            crop_margin: 0.25,
        }
    }
}

/// One face found in the decision frame, matched and scored.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    #[serde(skip)]
    pub embedding: Embedding,
    pub identity_id: Option<IdentityId>,
    pub name: String,
    pub distance: f32,
    pub motion_score: f32,
    pub is_live: bool,
    pub liveness_assessed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceClass {
    LiveKnown,
    SpoofSuspect,
    LiveUnknown,
    /// Unknown and not live: neither registered nor warned about.
    Dropped,
}

impl DetectedFace {
    pub fn class(&self) -> FaceClass {
        match (self.identity_id.is_some(), self.is_live) {
            (true, true) => FaceClass::LiveKnown,
            (true, false) => FaceClass::SpoofSuspect,
            (false, true) => FaceClass::LiveUnknown,
            (false, false) => FaceClass::Dropped,
        }
    }

    /// Caption for the annotated frame.
    pub fn label(&self) -> String {
        match self.class() {
            FaceClass::SpoofSuspect => format!("{}? (spoof)", self.name),
            _ => self.name.clone(),
        }
    }
}

/// Indices into the face list, one bucket per class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub live_known: Vec<usize>,
    pub spoof_suspects: Vec<usize>,
    pub live_unknown: Vec<usize>,
    pub dropped: Vec<usize>,
}

pub fn partition(faces: &[DetectedFace]) -> Partition {
    let mut p = Partition::default();
    for (i, face) in faces.iter().enumerate() {
        match face.class() {
            FaceClass::LiveKnown => p.live_known.push(i),
            FaceClass::SpoofSuspect => p.spoof_suspects.push(i),
            FaceClass::LiveUnknown => p.live_unknown.push(i),
            FaceClass::Dropped => p.dropped.push(i),
        }
    }
    p
}

/// The unknown face offered for registration: largest box, first on ties.
pub fn registration_candidate(faces: &[DetectedFace], live_unknown: &[usize]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for &i in live_unknown {
        match best {
            Some(b) if faces[b].bbox.area() >= faces[i].bbox.area() => {}
            _ => best = Some(i),
        }
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Operator-facing message produced by a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        match level {
            LogLevel::Warning | LogLevel::Error => tracing::warn!(%message, "attendance"),
            _ => tracing::info!(%message, "attendance"),
        }
        Self { level, message }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

/// Everything a cycle hands back to the caller.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub capture_id: Uuid,
    pub frames_captured: usize,
    pub faces: Vec<DetectedFace>,
    pub partition: Partition,
    /// Identities newly written as Present in this cycle.
    pub marked: Vec<IdentityId>,
    pub logs: Vec<LogLine>,
    pub rendered: RgbImage,
    pub pending_crop: Option<GrayImage>,
}

/// Ledger step for live-known faces.
///
/// Consults the session cache, then the ledger, before appending. Each
/// identity is handled independently: a store failure for one is logged
/// and the rest proceed.
pub async fn record_attendance<L: AttendanceLedger>(
    ledger: &L,
    faces: &[DetectedFace],
    live_known: &[usize],
    session: &mut SessionState,
    actor: Option<i64>,
    now: NaiveDateTime,
) -> (Vec<IdentityId>, Vec<LogLine>) {
    let today = now.date();
    let time = now.time();
    let mut marked = Vec::new();
    let mut logs = Vec::new();

    for &i in live_known {
        let face = &faces[i];
        let Some(id) = face.identity_id else {
            continue;
        };

        if session.is_marked(id) {
            logs.push(LogLine::info(format!("{} already marked today.", face.name)));
            continue;
        }

        match ledger.has_record(id, today).await {
            Ok(true) => {
                session.mark(id);
                logs.push(LogLine::info(format!("{} already marked today.", face.name)));
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(identity_id = id, error = %e, "ledger lookup failed");
                logs.push(LogLine::error(format!("Could not check attendance for {}: {e}", face.name)));
                continue;
            }
        }

        let record = NewAttendance {
            identity_id: id,
            date: today,
            time,
            status: AttendanceStatus::Present,
            marked_by: actor,
        };
        match ledger.append_record(record).await {
            Ok(()) => {
                session.mark(id);
                marked.push(id);
                logs.push(LogLine::success(format!(
                    "Marked {} present at {}",
                    face.name,
                    time.format("%H:%M:%S")
                )));
            }
            Err(e) => {
                tracing::error!(identity_id = id, error = %e, "ledger append failed");
                logs.push(LogLine::error(format!("Could not mark {} present: {e}", face.name)));
            }
        }
    }

    (marked, logs)
}

fn crop_face(frame: &GrayImage, bbox: &BoundingBox, margin: f32) -> Option<GrayImage> {
    let region = bbox.expand(margin).clip(frame.width(), frame.height())?;
    Some(
        imageops::crop_imm(
            frame,
            region.left as u32,
            region.top as u32,
            region.width() as u32,
            region.height() as u32,
        )
        .to_image(),
    )
}

/// Run one capture trigger end to end.
///
/// Refuses to start while a registration is pending. Acquisition and
/// extraction failures abort before any ledger write.
#[allow(clippy::too_many_arguments)]
pub async fn run_capture_cycle<S, E, L>(
    source: &mut S,
    extractor: &mut E,
    ledger: &L,
    gallery: &Gallery,
    actor: Option<i64>,
    session: &mut SessionState,
    config: &CycleConfig,
    now: NaiveDateTime,
) -> Result<CaptureOutcome, CycleError>
where
    S: FrameSource,
    E: FaceExtractor,
    L: AttendanceLedger,
{
    if session.has_pending() {
        return Err(CycleError::RegistrationPending);
    }
    session.roll_over(now.date());

    let capture_id = Uuid::new_v4();

    // CAPTURED
    let frames = source.capture_burst(config.burst_frames.max(1), config.burst_spacing)?;
    let Some(decision) = frames.last() else {
        return Err(CycleError::NoFrames);
    };
    let baseline = if frames.len() > 1 { frames.first() } else { None };
    tracing::debug!(%capture_id, frames = frames.len(), gallery = gallery.len(), "capture: burst acquired");

    // MATCHED + LIVENESS-SCORED
    let detections = extractor.detect_faces(decision)?;
    let matcher = CosineMatcher::new(config.match_threshold);
    let faces: Vec<DetectedFace> = detections
        .into_iter()
        .map(|det| {
            let result = matcher.compare(&det.embedding, gallery);
            let live = liveness::assess(baseline, decision, &det.bbox, &config.liveness);
            DetectedFace {
                bbox: det.bbox,
                embedding: det.embedding,
                identity_id: result.identity_id,
                name: result.name,
                distance: result.distance,
                motion_score: live.motion_score,
                is_live: live.is_live,
                liveness_assessed: live.assessed,
            }
        })
        .collect();

    // PARTITIONED
    let parts = partition(&faces);
    tracing::info!(
        %capture_id,
        faces = faces.len(),
        live_known = parts.live_known.len(),
        spoof = parts.spoof_suspects.len(),
        live_unknown = parts.live_unknown.len(),
        dropped = parts.dropped.len(),
        "capture: partitioned"
    );

    let mut logs = Vec::new();
    if faces.is_empty() {
        logs.push(LogLine::info("No faces found."));
    }

    // LEDGER-UPDATED
    let (marked, ledger_logs) = record_attendance(ledger, &faces, &parts.live_known, session, actor, now).await;
    logs.extend(ledger_logs);

    for &i in &parts.spoof_suspects {
        let face = &faces[i];
        logs.push(LogLine::warning(format!(
            "Possible spoof: {} (motion {:.2}); not marked.",
            face.name, face.motion_score
        )));
    }

    if let Some(i) = registration_candidate(&faces, &parts.live_unknown) {
        let face = &faces[i];
        match crop_face(decision, &face.bbox, config.crop_margin) {
            Some(crop) => {
                session.set_pending(PendingRegistration {
                    capture_id,
                    crop,
                    bbox: face.bbox,
                    detected_at: now,
                });
                logs.push(LogLine::warning(format!(
                    "Unknown face detected ({} unknown in frame); register or abandon it to continue.",
                    parts.live_unknown.len()
                )));
            }
            None => {
                logs.push(LogLine::warning("Unknown face detected but could not be cropped."));
            }
        }
    }

    // TERMINAL
    let rendered = render::annotate(decision, &faces);
    Ok(CaptureOutcome {
        capture_id,
        frames_captured: frames.len(),
        pending_crop: session.pending().map(|p| p.crop.clone()),
        faces,
        partition: parts,
        marked,
        logs,
        rendered,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extractor::FaceDetection;
    use crate::types::GalleryEntry;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    /// Returns the same burst on every call.
    pub(crate) struct StaticSource {
        pub frames: Vec<GrayImage>,
        pub fail: bool,
    }

    impl FrameSource for StaticSource {
        fn capture_burst(&mut self, count: usize, _spacing: Duration) -> Result<Vec<GrayImage>, CaptureError> {
            if self.fail {
                return Err(CaptureError::Unavailable("/dev/video9".into()));
            }
            Ok(self.frames.iter().take(count).cloned().collect())
        }
    }

    /// Reports a fixed list of faces for any image.
    pub(crate) struct FixedExtractor {
        pub faces: Vec<FaceDetection>,
    }

    impl FaceExtractor for FixedExtractor {
        fn detect_faces(&mut self, _image: &GrayImage) -> Result<Vec<FaceDetection>, ExtractorError> {
            Ok(self.faces.clone())
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryLedger {
        pub rows: Mutex<Vec<NewAttendance>>,
        pub broken_for: Option<IdentityId>,
    }

    impl MemoryLedger {
        fn present_rows(&self, id: IdentityId) -> usize {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.identity_id == id && r.status == AttendanceStatus::Present)
                .count()
        }
    }

    impl AttendanceLedger for MemoryLedger {
        type Error = std::io::Error;

        async fn has_record(&self, identity_id: IdentityId, date: chrono::NaiveDate) -> Result<bool, Self::Error> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.identity_id == identity_id && r.date == date))
        }

        async fn append_record(&self, record: NewAttendance) -> Result<(), Self::Error> {
            if self.broken_for == Some(record.identity_id) {
                return Err(std::io::Error::other("disk full"));
            }
            self.rows.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn e1() -> Vec<f32> {
        vec![1.0, 0.0, 0.0]
    }

    fn gallery() -> Gallery {
        Gallery::new(vec![GalleryEntry {
            identity_id: 1,
            name: "Asha".into(),
            embedding: Embedding::new(e1()),
        }])
    }

    fn detection(bbox: BoundingBox, values: Vec<f32>) -> FaceDetection {
        FaceDetection {
            bbox,
            confidence: 0.9,
            embedding: Embedding::new(values),
        }
    }

    fn flat(value: u8) -> GrayImage {
        GrayImage::from_pixel(100, 100, image::Luma([value]))
    }

    /// Five frames whose intensity drifts enough to count as motion.
    fn moving_burst() -> Vec<GrayImage> {
        (0..5).map(|i| flat(100 + i * 5)).collect()
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap().and_hms_opt(9, 15, 0).unwrap()
    }

    fn face_box() -> BoundingBox {
        BoundingBox::new(20, 60, 60, 20)
    }

    #[tokio::test]
    async fn test_known_live_face_is_marked_once() {
        let mut source = StaticSource { frames: moving_burst(), fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![detection(face_box(), vec![1.0, 0.2, 0.0])],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();
        let config = CycleConfig::default();

        let out = run_capture_cycle(&mut source, &mut extractor, &ledger, &gallery(), Some(9), &mut session, &config, now())
            .await
            .unwrap();

        assert_eq!(out.marked, vec![1]);
        assert_eq!(out.faces[0].identity_id, Some(1));
        assert!(out.faces[0].motion_score >= 7.0);
        assert_eq!(out.logs[0].level, LogLevel::Success);
        assert_eq!(out.logs[0].message, "Marked Asha present at 09:15:00");
        assert!(out.pending_crop.is_none());

        let rows = ledger.rows.lock().unwrap().clone();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].marked_by, Some(9));
        assert_eq!(rows[0].status, AttendanceStatus::Present);
    }

    #[tokio::test]
    async fn test_orthogonal_live_face_becomes_pending() {
        let mut source = StaticSource { frames: moving_burst(), fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![detection(face_box(), vec![0.0, 1.0, 0.0])],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &gallery(),
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(out.faces[0].name, "Unknown");
        assert_eq!(out.partition.live_unknown, vec![0]);
        assert!(out.marked.is_empty());
        assert!(session.has_pending());
        // 40×40 box grown by 25% on each side.
        assert_eq!(out.pending_crop.unwrap().dimensions(), (60, 60));
        assert!(ledger.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_frames_flag_spoof() {
        let mut source = StaticSource { frames: vec![flat(120), flat(120)], fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![detection(face_box(), e1())],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &gallery(),
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();

        assert!(!out.faces[0].is_live);
        assert_eq!(out.partition.spoof_suspects, vec![0]);
        assert_eq!(out.logs.len(), 1);
        assert_eq!(out.logs[0].level, LogLevel::Warning);
        assert!(out.logs[0].message.contains("Asha"));
        assert!(out.logs[0].message.contains("0.00"));
        assert!(ledger.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_ledger_row_reports_already_marked() {
        let ledger = MemoryLedger::default();
        ledger.rows.lock().unwrap().push(NewAttendance {
            identity_id: 1,
            date: now().date(),
            time: now().time(),
            status: AttendanceStatus::Present,
            marked_by: None,
        });

        for _ in 0..2 {
            let mut session = SessionState::new();
            let mut source = StaticSource { frames: moving_burst(), fail: false };
            let mut extractor = FixedExtractor {
                faces: vec![detection(face_box(), e1())],
            };
            let out = run_capture_cycle(
                &mut source,
                &mut extractor,
                &ledger,
                &gallery(),
                None,
                &mut session,
                &CycleConfig::default(),
                now(),
            )
            .await
            .unwrap();
            assert!(out.marked.is_empty());
            assert_eq!(out.logs[0].message, "Asha already marked today.");
            assert!(ledger.has_record(1, now().date()).await.unwrap());
        }
        assert_eq!(ledger.present_rows(1), 1);
    }

    #[tokio::test]
    async fn test_record_attendance_is_idempotent() {
        let ledger = MemoryLedger::default();
        let faces = vec![DetectedFace {
            bbox: face_box(),
            embedding: Embedding::new(e1()),
            identity_id: Some(1),
            name: "Asha".into(),
            distance: 0.0,
            motion_score: 10.0,
            is_live: true,
            liveness_assessed: true,
        }];

        // Fresh sessions each time so only the ledger lookup can dedupe.
        let (first, _) = record_attendance(&ledger, &faces, &[0], &mut SessionState::new(), None, now()).await;
        let (second, logs) = record_attendance(&ledger, &faces, &[0], &mut SessionState::new(), None, now()).await;

        assert_eq!(first, vec![1]);
        assert!(second.is_empty());
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(ledger.present_rows(1), 1);
    }

    #[tokio::test]
    async fn test_same_identity_twice_in_one_frame() {
        let mut source = StaticSource { frames: moving_burst(), fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![
                detection(face_box(), e1()),
                detection(BoundingBox::new(60, 95, 95, 65), e1()),
            ],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &gallery(),
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(out.marked, vec![1]);
        assert_eq!(out.logs[1].message, "Asha already marked today.");
        assert_eq!(ledger.present_rows(1), 1);
    }

    #[tokio::test]
    async fn test_only_largest_unknown_is_queued() {
        let mut source = StaticSource { frames: moving_burst(), fail: false };
        let small = BoundingBox::new(0, 20, 20, 0);
        let large = BoundingBox::new(40, 90, 90, 40);
        let mut extractor = FixedExtractor {
            faces: vec![
                detection(small, vec![0.0, 1.0, 0.0]),
                detection(large, vec![0.0, 0.0, 1.0]),
            ],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &gallery(),
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(out.partition.live_unknown, vec![0, 1]);
        assert_eq!(session.pending().unwrap().bbox, large);
        let unknown_logs: Vec<_> = out.logs.iter().filter(|l| l.message.contains("Unknown face")).collect();
        assert_eq!(unknown_logs.len(), 1);
        assert!(unknown_logs[0].message.contains("2 unknown"));
    }

    #[tokio::test]
    async fn test_pending_registration_blocks_capture() {
        let mut source = StaticSource { frames: moving_burst(), fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![detection(face_box(), vec![0.0, 1.0, 0.0])],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();
        let config = CycleConfig::default();

        run_capture_cycle(&mut source, &mut extractor, &ledger, &gallery(), None, &mut session, &config, now())
            .await
            .unwrap();
        let blocked =
            run_capture_cycle(&mut source, &mut extractor, &ledger, &gallery(), None, &mut session, &config, now())
                .await;
        assert!(matches!(blocked, Err(CycleError::RegistrationPending)));

        session.abandon_pending();
        assert!(
            run_capture_cycle(&mut source, &mut extractor, &ledger, &gallery(), None, &mut session, &config, now())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unknown_static_face_is_dropped_silently() {
        let mut source = StaticSource { frames: vec![flat(50), flat(50)], fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![detection(face_box(), vec![0.0, 1.0, 0.0])],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &gallery(),
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(out.partition.dropped, vec![0]);
        assert!(out.logs.is_empty());
        assert!(!session.has_pending());
    }

    #[tokio::test]
    async fn test_single_frame_burst_fails_open() {
        let mut source = StaticSource { frames: vec![flat(80)], fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![detection(face_box(), e1())],
        };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &gallery(),
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();
        assert!(out.faces[0].is_live);
        assert!(!out.faces[0].liveness_assessed);
        assert_eq!(out.marked, vec![1]);

        let strict = CycleConfig {
            liveness: LivenessPolicy {
                assume_live_if_no_baseline: false,
                ..LivenessPolicy::default()
            },
            ..CycleConfig::default()
        };
        let mut session = SessionState::new();
        let out = run_capture_cycle(&mut source, &mut extractor, &ledger, &gallery(), None, &mut session, &strict, now())
            .await
            .unwrap();
        assert_eq!(out.partition.spoof_suspects, vec![0]);
    }

    #[tokio::test]
    async fn test_acquisition_failures_write_nothing() {
        let ledger = MemoryLedger::default();
        let mut extractor = FixedExtractor {
            faces: vec![detection(face_box(), e1())],
        };
        let mut session = SessionState::new();
        let config = CycleConfig::default();

        let mut broken = StaticSource { frames: vec![], fail: true };
        let err = run_capture_cycle(&mut broken, &mut extractor, &ledger, &gallery(), None, &mut session, &config, now())
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Acquisition(CaptureError::Unavailable(_))));

        let mut empty = StaticSource { frames: vec![], fail: false };
        let err = run_capture_cycle(&mut empty, &mut extractor, &ledger, &gallery(), None, &mut session, &config, now())
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::NoFrames));
        assert!(ledger.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_faces_found() {
        let mut source = StaticSource { frames: moving_burst(), fail: false };
        let mut extractor = FixedExtractor { faces: vec![] };
        let ledger = MemoryLedger::default();
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &Gallery::default(),
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();
        assert_eq!(out.logs, vec![LogLine::info("No faces found.")]);
        assert_eq!(out.rendered.dimensions(), (100, 100));
    }

    #[tokio::test]
    async fn test_ledger_failure_is_partial() {
        let gallery = Gallery::new(vec![
            GalleryEntry {
                identity_id: 1,
                name: "Asha".into(),
                embedding: Embedding::new(vec![1.0, 0.0, 0.0]),
            },
            GalleryEntry {
                identity_id: 2,
                name: "Ben".into(),
                embedding: Embedding::new(vec![0.0, 1.0, 0.0]),
            },
        ]);
        let mut source = StaticSource { frames: moving_burst(), fail: false };
        let mut extractor = FixedExtractor {
            faces: vec![
                detection(face_box(), vec![1.0, 0.0, 0.0]),
                detection(BoundingBox::new(60, 95, 95, 65), vec![0.0, 1.0, 0.0]),
            ],
        };
        let ledger = MemoryLedger {
            broken_for: Some(1),
            ..MemoryLedger::default()
        };
        let mut session = SessionState::new();

        let out = run_capture_cycle(
            &mut source,
            &mut extractor,
            &ledger,
            &gallery,
            None,
            &mut session,
            &CycleConfig::default(),
            now(),
        )
        .await
        .unwrap();

        assert_eq!(out.marked, vec![2]);
        assert_eq!(out.logs[0].level, LogLevel::Error);
        assert!(!session.is_marked(1));
        assert!(session.is_marked(2));
    }

    #[test]
    fn test_registration_candidate_tie_keeps_first() {
        let f = |b: BoundingBox| DetectedFace {
            bbox: b,
            embedding: Embedding::new(vec![]),
            identity_id: None,
            name: "Unknown".into(),
            distance: 1.0,
            motion_score: 9.0,
            is_live: true,
            liveness_assessed: true,
        };
        let faces = vec![f(BoundingBox::new(0, 10, 10, 0)), f(BoundingBox::new(50, 60, 60, 50))];
        assert_eq!(registration_candidate(&faces, &[0, 1]), Some(0));
        assert_eq!(registration_candidate(&faces, &[]), None);
    }
}
