use crate::config::Config;
use crate::store::{SqliteStore, StoreError};
use rollcall_core::cycle::CaptureError;
use rollcall_core::extractor::ExtractorError;
use rollcall_core::session::SessionState;
use rollcall_core::{
    register_pending_face, render, run_capture_cycle, CaptureOutcome, CycleConfig, CycleError, FaceExtractor,
    FrameSource, Gallery, OnnxExtractor, RegistrationForm, RegistrationOutcome,
};
use rollcall_hw::{Camera, Frame};
use image::GrayImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Models(#[from] ExtractorError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A finished capture cycle plus its annotated frame as PNG.
pub struct CaptureReport {
    pub outcome: CaptureOutcome,
    pub png: Vec<u8>,
}

/// Snapshot of the operator session held by the engine thread.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SessionInfo {
    pub marked_today: usize,
    pub pending_registration: bool,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Capture {
        gallery: Arc<Gallery>,
        actor: Option<i64>,
        reply: oneshot::Sender<Result<CaptureReport, EngineError>>,
    },
    Register {
        form: RegistrationForm,
        reply: oneshot::Sender<Result<RegistrationOutcome, EngineError>>,
    },
    AbandonPending {
        reply: oneshot::Sender<bool>,
    },
    ResetSession {
        reply: oneshot::Sender<()>,
    },
    Session {
        reply: oneshot::Sender<SessionInfo>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Run one capture cycle against `gallery`.
    pub async fn capture(&self, gallery: Arc<Gallery>, actor: Option<i64>) -> Result<CaptureReport, EngineError> {
        self.request(|reply| EngineRequest::Capture { gallery, actor, reply })
            .await?
    }

    /// Register the pending face under `form`.
    pub async fn register(&self, form: RegistrationForm) -> Result<RegistrationOutcome, EngineError> {
        self.request(|reply| EngineRequest::Register { form, reply }).await?
    }

    pub async fn abandon_pending(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::AbandonPending { reply }).await
    }

    pub async fn reset_session(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::ResetSession { reply }).await
    }

    pub async fn session(&self) -> Result<SessionInfo, EngineError> {
        self.request(|reply| EngineRequest::Session { reply }).await
    }
}

/// Camera source that opens the device for each burst.
///
/// A missing or busy camera surfaces as a capture error on that cycle
/// instead of taking the daemon down.
pub struct V4lBurstSource {
    device: String,
    width: u32,
    height: u32,
    warmup: usize,
}

impl V4lBurstSource {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device: config.camera_device.clone(),
            width: config.camera_width,
            height: config.camera_height,
            warmup: config.warmup_frames,
        }
    }
}

impl FrameSource for V4lBurstSource {
    fn capture_burst(&mut self, count: usize, spacing: Duration) -> Result<Vec<GrayImage>, CaptureError> {
        let camera = Camera::open(&self.device, self.width, self.height)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.device)))?;
        let (frames, dark_skipped) = camera
            .capture_burst(count, spacing, self.warmup)
            .map_err(|e| CaptureError::Failed(e.to_string()))?;
        tracing::debug!(captured = frames.len(), dark_skipped, "burst captured");
        Ok(frames.into_iter().map(Frame::into_image).collect())
    }
}

/// State owned by the engine thread.
struct Engine<S, E> {
    source: S,
    extractor: E,
    store: SqliteStore,
    cycle: CycleConfig,
    session: SessionState,
    runtime: Handle,
}

impl<S: FrameSource, E: FaceExtractor> Engine<S, E> {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Capture { gallery, actor, reply } => {
                let _ = reply.send(self.capture(&gallery, actor));
            }
            EngineRequest::Register { form, reply } => {
                let result = self
                    .runtime
                    .block_on(register_pending_face(&mut self.extractor, &self.store, &mut self.session, form))
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::AbandonPending { reply } => {
                let abandoned = self.session.abandon_pending();
                if abandoned {
                    tracing::info!("pending registration abandoned");
                }
                let _ = reply.send(abandoned);
            }
            EngineRequest::ResetSession { reply } => {
                self.session.reset();
                tracing::info!(pending = self.session.has_pending(), "session reset");
                let _ = reply.send(());
            }
            EngineRequest::Session { reply } => {
                let _ = reply.send(SessionInfo {
                    marked_today: self.session.marked_count(),
                    pending_registration: self.session.has_pending(),
                });
            }
        }
    }

    fn capture(&mut self, gallery: &Gallery, actor: Option<i64>) -> Result<CaptureReport, EngineError> {
        let now = chrono::Local::now().naive_local();
        let outcome = self.runtime.block_on(run_capture_cycle(
            &mut self.source,
            &mut self.extractor,
            &self.store,
            gallery,
            actor,
            &mut self.session,
            &self.cycle,
            now,
        ))?;
        let png = render::to_png(&outcome.rendered)?;
        Ok(CaptureReport { outcome, png })
    }
}

/// Spawn the engine on a dedicated OS thread with the V4L2 camera and ONNX models.
///
/// Models are loaded synchronously so a missing model fails startup. The
/// camera is opened per burst.
pub fn spawn_engine(config: &Config, store: SqliteStore) -> Result<EngineHandle, EngineError> {
    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let extractor = OnnxExtractor::load(&scrfd_path, &arcface_path)?;
    tracing::info!(scrfd = %scrfd_path, arcface = %arcface_path, "face models loaded");

    spawn_engine_with(V4lBurstSource::from_config(config), extractor, store, config.cycle_config())
}

/// Spawn the engine loop around any frame source and extractor.
///
/// Must be called from within a Tokio runtime; the engine thread drives
/// store futures on it.
pub fn spawn_engine_with<S, E>(
    source: S,
    extractor: E,
    store: SqliteStore,
    cycle: CycleConfig,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + Send + 'static,
    E: FaceExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let mut engine = Engine {
        source,
        extractor,
        store,
        cycle,
        session: SessionState::new(),
        runtime: Handle::current(),
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
