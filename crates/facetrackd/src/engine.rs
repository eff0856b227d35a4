use crate::session::{EnrollmentProgress, EnrollmentSession, SessionOpenError, SessionOutcome, Timing};
use facetrack_core::sequencer::EnrollmentCapture;
use facetrack_hw::{CameraDevice, CameraError, CameraStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("invalid prompts: {0}")]
    Prompts(String),
    #[error("camera is busy with another capture")]
    Busy,
    #[error("enrollment cancelled; {discarded} samples discarded")]
    Cancelled { discarded: usize },
    #[error("enrollment failed: {0}")]
    Failed(String),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to start engine thread: {0}")]
    Startup(std::io::Error),
}

/// Capture settings shared by every request.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Prompt list used when a request does not bring its own.
    pub prompts: Vec<String>,
    pub max_capture_retries: u32,
    pub timing: Timing,
    /// Frames discarded after opening the camera for a recognition capture.
    pub warmup_frames: usize,
}

/// Messages sent from service calls to the engine thread.
enum EngineRequest {
    Enroll {
        prompts: Option<Vec<String>>,
        reply: oneshot::Sender<Result<EnrollmentCapture, EngineError>>,
    },
    Capture {
        reply: oneshot::Sender<Result<Vec<u8>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    activity: Arc<AtomicU8>,
    cancel: Arc<watch::Sender<bool>>,
    progress: watch::Receiver<EnrollmentProgress>,
    device: String,
}

const IDLE: u8 = 0;
const ENROLLING: u8 = 1;
const CAPTURING: u8 = 2;

/// Marks the engine idle again when the request finishes, however it finishes.
struct BusyGuard(Arc<AtomicU8>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(IDLE, Ordering::SeqCst);
    }
}

impl EngineHandle {
    /// Run a full enrollment sequence. `None` uses the configured prompt list.
    pub async fn enroll(&self, prompts: Option<Vec<String>>) -> Result<EnrollmentCapture, EngineError> {
        let _busy = self.acquire(ENROLLING)?;
        // A cancel from an earlier session must not leak into this one.
        self.cancel.send_replace(false);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                prompts,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture a single JPEG frame for recognition.
    pub async fn capture(&self) -> Result<Vec<u8>, EngineError> {
        let _busy = self.acquire(CAPTURING)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Ask the running enrollment to stop. Returns false when none is running.
    pub fn cancel(&self) -> bool {
        let running = self.is_enrolling();
        if running {
            self.cancel.send_replace(true);
            tracing::info!("enrollment cancel requested");
        }
        running
    }

    pub fn progress(&self) -> EnrollmentProgress {
        self.progress.borrow().clone()
    }

    /// Receiver for progress updates, for callers that want to follow along.
    pub fn subscribe(&self) -> watch::Receiver<EnrollmentProgress> {
        self.progress.clone()
    }

    pub fn is_enrolling(&self) -> bool {
        self.activity.load(Ordering::SeqCst) == ENROLLING
    }

    pub fn is_busy(&self) -> bool {
        self.activity.load(Ordering::SeqCst) != IDLE
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn acquire(&self, activity: u8) -> Result<BusyGuard, EngineError> {
        self.activity
            .compare_exchange(IDLE, activity, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::Busy)?;
        Ok(BusyGuard(Arc::clone(&self.activity)))
    }
}

/// Spawn the engine on a dedicated OS thread. It owns the camera for the
/// daemon's lifetime and opens a stream only for the duration of each request.
///
/// Capture calls block, so they stay off the tokio workers that serve D-Bus.
/// The thread drives enrollment timers on its own current-thread runtime.
pub fn spawn_engine(
    mut camera: Box<dyn CameraDevice>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError> {
    let device = camera.name();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (cancel_tx, _) = watch::channel(false);
    let cancel_tx = Arc::new(cancel_tx);
    let (progress_tx, progress_rx) = watch::channel(EnrollmentProgress::idle());
    let progress_tx = Arc::new(progress_tx);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(EngineError::Startup)?;

    let thread_cancel = Arc::clone(&cancel_tx);
    std::thread::Builder::new()
        .name("facetrack-engine".into())
        .spawn(move || {
            tracing::info!(device = %camera.name(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { prompts, reply } => {
                        let prompts = prompts.unwrap_or_else(|| settings.prompts.clone());
                        let result = rt.block_on(run_enroll(
                            camera.as_mut(),
                            prompts,
                            &settings,
                            thread_cancel.subscribe(),
                            Arc::clone(&progress_tx),
                        ));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Capture { reply } => {
                        let result = run_capture(camera.as_mut(), &settings);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Startup)?;

    Ok(EngineHandle {
        tx,
        activity: Arc::new(AtomicU8::new(IDLE)),
        cancel: cancel_tx,
        progress: progress_rx,
        device,
    })
}

async fn run_enroll(
    camera: &mut dyn CameraDevice,
    prompts: Vec<String>,
    settings: &EngineSettings,
    cancel: watch::Receiver<bool>,
    progress: Arc<watch::Sender<EnrollmentProgress>>,
) -> Result<EnrollmentCapture, EngineError> {
    let session = EnrollmentSession::open(
        camera,
        prompts,
        settings.max_capture_retries,
        settings.timing,
        cancel,
        progress,
    )
    .map_err(|e| match e {
        SessionOpenError::Camera(e) => EngineError::Camera(e),
        SessionOpenError::Prompts(msg) => EngineError::Prompts(msg),
    })?;

    match session.run().await {
        SessionOutcome::Completed(capture) => Ok(capture),
        SessionOutcome::Cancelled { discarded } => Err(EngineError::Cancelled { discarded }),
        SessionOutcome::Failed(reason) => Err(EngineError::Failed(reason)),
    }
}

/// Open the camera, let exposure settle, and grab one usable frame.
fn run_capture(camera: &mut dyn CameraDevice, settings: &EngineSettings) -> Result<Vec<u8>, EngineError> {
    let mut stream = CameraStream::open(camera)?;
    if settings.warmup_frames > 0 {
        tracing::debug!(count = settings.warmup_frames, "discarding warmup frames");
        stream.discard_frames(settings.warmup_frames);
    }

    let mut attempt = 0;
    loop {
        match stream.capture_sample() {
            Ok(jpeg) => {
                tracing::debug!(bytes = jpeg.len(), "recognition frame captured");
                return Ok(jpeg);
            }
            Err(e) if e.is_transient() && attempt < settings.max_capture_retries => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "recognition capture failed; retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
