//! Enrollment session: drives the sequencer against a live camera stream.
//!
//! The session owns everything a capture run needs (stream guard,
//! sequencer, cancel receiver, progress sender) and is consumed by `run`,
//! so the camera is released on every exit path.

use facetrack_core::sequencer::{CaptureRetry, EnrollmentCapture, Progress, SequenceState, Sequencer};
use facetrack_hw::{CameraDevice, CameraError, CameraStream};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Delays between the steps of a capture run.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub warmup: Duration,
    pub settle: Duration,
    pub interval: Duration,
}

impl Timing {
    pub const ZERO: Timing = Timing {
        warmup: Duration::ZERO,
        settle: Duration::ZERO,
        interval: Duration::ZERO,
    };
}

/// Live view of the running (or last) enrollment, published over a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentProgress {
    pub state: SequenceState,
    pub prompt: Option<String>,
    pub captured: usize,
    pub total: usize,
    pub percent: u8,
    /// Transient problem with the last capture, cleared on the next success.
    pub warning: Option<String>,
}

impl EnrollmentProgress {
    pub fn idle() -> Self {
        Self {
            state: SequenceState::Idle,
            prompt: None,
            captured: 0,
            total: 0,
            percent: 0,
            warning: None,
        }
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed(EnrollmentCapture),
    Cancelled { discarded: usize },
    Failed(String),
}

pub struct EnrollmentSession {
    stream: CameraStream,
    sequencer: Sequencer,
    timing: Timing,
    cancel: watch::Receiver<bool>,
    progress: Arc<watch::Sender<EnrollmentProgress>>,
    warning: Option<String>,
}

impl EnrollmentSession {
    /// Open the camera and prepare a run over `prompts`.
    ///
    /// Camera errors here (permission denied, missing device) abort before
    /// any prompt is shown; the sequencer is marked failed so progress
    /// observers see the failure.
    pub fn open(
        camera: &mut dyn CameraDevice,
        prompts: Vec<String>,
        max_capture_retries: u32,
        timing: Timing,
        cancel: watch::Receiver<bool>,
        progress: Arc<watch::Sender<EnrollmentProgress>>,
    ) -> Result<Self, SessionOpenError> {
        let sequencer = Sequencer::new(prompts, max_capture_retries)
            .map_err(|e| SessionOpenError::Prompts(e.to_string()))?;
        let stream = match CameraStream::open(camera) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "enrollment aborted: camera unavailable");
                progress.send_replace(EnrollmentProgress {
                    state: SequenceState::Failed,
                    total: sequencer.prompts().len(),
                    warning: Some(e.to_string()),
                    ..EnrollmentProgress::idle()
                });
                return Err(SessionOpenError::Camera(e));
            }
        };
        Ok(Self {
            stream,
            sequencer,
            timing,
            cancel,
            progress,
            warning: None,
        })
    }

    pub async fn run(mut self) -> SessionOutcome {
        if let Err(e) = self.sequencer.start() {
            return SessionOutcome::Failed(e.to_string());
        }
        let total = self.sequencer.prompts().len();
        tracing::info!(prompts = total, device = %self.stream.device(), "enrollment started");

        if !self.wait(self.timing.warmup).await {
            return self.cancelled();
        }

        loop {
            self.publish();
            match self.sequencer.state() {
                SequenceState::AwaitingPrompt(k) => {
                    tracing::debug!(index = k, prompt = ?self.sequencer.current_prompt(), "prompt shown");
                    if !self.wait(self.timing.settle).await {
                        return self.cancelled();
                    }
                    if let Err(e) = self.sequencer.begin_capture() {
                        return self.failed(e.to_string());
                    }
                }
                SequenceState::Capturing(k) => {
                    if self.cancel_requested() {
                        return self.cancelled();
                    }
                    match self.stream.capture_sample() {
                        Ok(jpeg) => match self.sequencer.record_capture(jpeg) {
                            Ok(progress) => {
                                self.warning = None;
                                log_progress(k, progress);
                                if !progress.is_complete() && !self.wait(self.timing.interval).await {
                                    return self.cancelled();
                                }
                            }
                            Err(e) => return self.failed(e.to_string()),
                        },
                        Err(e) if e.is_transient() => {
                            tracing::warn!(index = k, error = %e, "capture failed; repeating prompt");
                            self.warning = Some(format!("failed to capture image: {e}"));
                            match self.sequencer.record_capture_failure(&e.to_string()) {
                                Ok(CaptureRetry::Retry { attempt }) => {
                                    tracing::debug!(index = k, attempt, "retrying prompt");
                                }
                                Ok(CaptureRetry::GaveUp) => {}
                                Err(e) => return self.failed(e.to_string()),
                            }
                        }
                        Err(e) => return self.failed(e.to_string()),
                    }
                }
                SequenceState::Completed => {
                    let Some(capture) = self.sequencer.take_completion() else {
                        return self.failed("completed without samples".to_string());
                    };
                    self.stream.release();
                    tracing::info!(samples = capture.samples.len(), "enrollment capture complete");
                    return SessionOutcome::Completed(capture);
                }
                SequenceState::Failed => {
                    let reason = self
                        .sequencer
                        .failure()
                        .unwrap_or("enrollment failed")
                        .to_string();
                    self.stream.release();
                    tracing::error!(reason = %reason, "enrollment failed");
                    return SessionOutcome::Failed(reason);
                }
                SequenceState::Cancelled => return self.cancelled(),
                SequenceState::Idle => return self.failed("sequence never started".to_string()),
            }
        }
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleep for `duration` unless cancelled first. Returns false on cancel.
    async fn wait(&mut self, duration: Duration) -> bool {
        if self.cancel_requested() {
            return false;
        }
        let interrupted = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => true,
            _ = tokio::time::sleep(duration) => false,
        };
        !interrupted && !self.cancel_requested()
    }

    fn publish(&self) {
        let p = self.sequencer.progress();
        self.progress.send_replace(EnrollmentProgress {
            state: self.sequencer.state(),
            prompt: self.sequencer.current_prompt().map(str::to_string),
            captured: p.captured,
            total: p.total,
            percent: p.percent(),
            warning: self.warning.clone(),
        });
    }

    fn cancelled(mut self) -> SessionOutcome {
        let discarded = self.sequencer.cancel().unwrap_or(0);
        self.stream.release();
        self.publish();
        tracing::info!(discarded, "enrollment cancelled");
        SessionOutcome::Cancelled { discarded }
    }

    fn failed(mut self, reason: String) -> SessionOutcome {
        let _ = self.sequencer.fail(reason.clone());
        self.stream.release();
        self.publish();
        tracing::error!(reason = %reason, "enrollment failed");
        SessionOutcome::Failed(reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionOpenError {
    #[error("camera unavailable: {0}")]
    Camera(#[from] CameraError),
    #[error("{0}")]
    Prompts(String),
}

fn log_progress(index: usize, progress: Progress) {
    tracing::info!(
        index,
        captured = progress.captured,
        total = progress.total,
        percent = progress.percent(),
        "sample captured"
    );
}

/// Resolves once the flag is true. Pends forever if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetrack_core::prompts::default_prompts;
    use facetrack_hw::{Frame, FrameStream, SyntheticCamera};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prompts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("pose {i}")).collect()
    }

    fn channels() -> (
        watch::Sender<bool>,
        watch::Receiver<bool>,
        Arc<watch::Sender<EnrollmentProgress>>,
        watch::Receiver<EnrollmentProgress>,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(EnrollmentProgress::idle());
        (cancel_tx, cancel_rx, Arc::new(progress_tx), progress_rx)
    }

    #[tokio::test]
    async fn test_full_enrollment_run() {
        let mut cam = SyntheticCamera::new(64, 48);
        let open = cam.open_streams();
        let (_cancel_tx, cancel_rx, progress_tx, progress_rx) = channels();

        let session =
            EnrollmentSession::open(&mut cam, default_prompts(), 3, Timing::ZERO, cancel_rx, progress_tx)
                .unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 1);

        let SessionOutcome::Completed(capture) = session.run().await else {
            panic!("enrollment should complete");
        };
        assert_eq!(capture.samples.len(), 19);
        assert!(capture.samples.iter().all(|s| s.image.starts_with(&[0xFF, 0xD8])));
        assert_eq!(open.load(Ordering::SeqCst), 0, "camera must be released");

        let last = progress_rx.borrow().clone();
        assert_eq!(last.state, SequenceState::Completed);
        assert_eq!(last.percent, 100);
    }

    #[tokio::test]
    async fn test_bad_frames_are_retried() {
        let mut cam = SyntheticCamera::new(32, 24).fail_captures([1]).dark_captures([2]);
        let (_cancel_tx, cancel_rx, progress_tx, _progress_rx) = channels();
        let session =
            EnrollmentSession::open(&mut cam, prompts(3), 3, Timing::ZERO, cancel_rx, progress_tx)
                .unwrap();
        let SessionOutcome::Completed(capture) = session.run().await else {
            panic!("bad frames must not abort the run");
        };
        let order: Vec<_> = capture.samples.iter().map(|s| s.prompt.as_str()).collect();
        assert_eq!(order, vec!["pose 0", "pose 1", "pose 2"]);
    }

    #[tokio::test]
    async fn test_failed_capture_sets_and_clears_warning() {
        let mut cam = SyntheticCamera::new(32, 24).fail_captures([1]);
        let (_cancel_tx, cancel_rx, progress_tx, progress_rx) = channels();
        let timing = Timing {
            warmup: Duration::ZERO,
            settle: Duration::from_millis(10),
            interval: Duration::ZERO,
        };
        let session =
            EnrollmentSession::open(&mut cam, prompts(3), 3, timing, cancel_rx, progress_tx).unwrap();

        // The warning is published before the retried prompt settles.
        let mut watcher = progress_rx.clone();
        let seen = tokio::spawn(async move {
            watcher
                .wait_for(|p| p.warning.is_some())
                .await
                .map(|p| p.clone())
        });

        assert!(matches!(session.run().await, SessionOutcome::Completed(_)));
        let warned = seen.await.unwrap().unwrap();
        assert!(warned.warning.unwrap().contains("failed to capture"));
        assert_eq!(warned.captured, 1);
        assert_eq!(warned.state, SequenceState::AwaitingPrompt(1));

        let last = progress_rx.borrow().clone();
        assert_eq!(last.warning, None);
        assert_eq!(last.captured, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_and_releases() {
        let mut cam = SyntheticCamera::new(32, 24).fail_captures(0..10);
        let open = cam.open_streams();
        let (_cancel_tx, cancel_rx, progress_tx, progress_rx) = channels();
        let session =
            EnrollmentSession::open(&mut cam, prompts(3), 2, Timing::ZERO, cancel_rx, progress_tx)
                .unwrap();
        assert!(matches!(session.run().await, SessionOutcome::Failed(_)));
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert_eq!(progress_rx.borrow().state, SequenceState::Failed);
    }

    #[tokio::test]
    async fn test_permission_denied_aborts_immediately() {
        let mut cam = SyntheticCamera::new(32, 24).deny_permission();
        let (_cancel_tx, cancel_rx, progress_tx, progress_rx) = channels();
        let err = EnrollmentSession::open(&mut cam, prompts(3), 3, Timing::ZERO, cancel_rx, progress_tx)
            .err()
            .unwrap();
        assert!(matches!(err, SessionOpenError::Camera(CameraError::PermissionDenied(_))));
        assert_eq!(progress_rx.borrow().state, SequenceState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_before_first_prompt() {
        let mut cam = SyntheticCamera::new(32, 24);
        let open = cam.open_streams();
        let (cancel_tx, cancel_rx, progress_tx, _progress_rx) = channels();
        let session =
            EnrollmentSession::open(&mut cam, prompts(3), 3, Timing::ZERO, cancel_rx, progress_tx)
                .unwrap();
        cancel_tx.send_replace(true);
        assert!(matches!(
            session.run().await,
            SessionOutcome::Cancelled { discarded: 0 }
        ));
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    /// Camera that raises the cancel flag right after its `k`-th frame.
    struct CancellingCamera {
        inner: SyntheticCamera,
        cancel_after: usize,
        cancel: Arc<watch::Sender<bool>>,
    }

    struct CancellingStream {
        inner: Box<dyn FrameStream>,
        captured: Arc<AtomicUsize>,
        cancel_after: usize,
        cancel: Arc<watch::Sender<bool>>,
    }

    impl CameraDevice for CancellingCamera {
        fn name(&self) -> String {
            "cancelling".into()
        }

        fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError> {
            Ok(Box::new(CancellingStream {
                inner: self.inner.open()?,
                captured: Arc::new(AtomicUsize::new(0)),
                cancel_after: self.cancel_after,
                cancel: Arc::clone(&self.cancel),
            }))
        }
    }

    impl FrameStream for CancellingStream {
        fn capture_frame(&mut self) -> Result<Frame, CameraError> {
            let frame = self.inner.capture_frame()?;
            if self.captured.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_after {
                self.cancel.send_replace(true);
            }
            Ok(frame)
        }

        fn stop(&mut self) {
            self.inner.stop();
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_sequence_discards_samples() {
        for k in 1..4 {
            let inner = SyntheticCamera::new(32, 24);
            let open = inner.open_streams();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let cancel_tx = Arc::new(cancel_tx);
            let (progress_tx, progress_rx) = watch::channel(EnrollmentProgress::idle());
            let progress_tx = Arc::new(progress_tx);
            let mut cam = CancellingCamera {
                inner,
                cancel_after: k,
                cancel: Arc::clone(&cancel_tx),
            };

            let session =
                EnrollmentSession::open(&mut cam, prompts(5), 3, Timing::ZERO, cancel_rx, progress_tx)
                    .unwrap();
            match session.run().await {
                SessionOutcome::Cancelled { discarded } => assert_eq!(discarded, k),
                other => panic!("expected cancellation at {k}, got {other:?}"),
            }
            assert_eq!(open.load(Ordering::SeqCst), 0, "camera leaked at k={k}");
            let last = progress_rx.borrow().clone();
            assert_eq!(last.state, SequenceState::Cancelled);
            assert_eq!(last.captured, 0);
        }
    }
}
