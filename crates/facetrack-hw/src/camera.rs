//! Camera access: device/stream traits, the release-on-drop stream guard,
//! and a scripted synthetic camera.

use crate::frame::{Frame, FrameError, PixelLayout};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("camera stream already released")]
    Released,
}

impl CameraError {
    /// Transient errors affect one frame; the stream stays usable and the
    /// caller may retry. Everything else ends the capture attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::CaptureFailed(_) | CameraError::Frame(_))
    }
}

/// A camera that can be opened into a frame stream.
pub trait CameraDevice: Send {
    /// Human-readable device name for logs and status output.
    fn name(&self) -> String;

    /// Acquire the device and start streaming.
    fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError>;
}

/// An acquired, streaming camera.
pub trait FrameStream: Send {
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;

    /// Stop all tracks and give the device back. Must be idempotent.
    fn stop(&mut self);
}

/// Owned handle on an open camera stream.
///
/// The device is released when the guard is dropped, so every exit path of
/// a capture flow (completion, cancellation, error, teardown) frees it.
pub struct CameraStream {
    inner: Option<Box<dyn FrameStream>>,
    device: String,
}

impl CameraStream {
    pub fn open(camera: &mut dyn CameraDevice) -> Result<Self, CameraError> {
        let device = camera.name();
        let inner = camera.open()?;
        tracing::info!(device = %device, "camera stream opened");
        Ok(Self {
            inner: Some(inner),
            device,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        self.inner
            .as_mut()
            .ok_or(CameraError::Released)?
            .capture_frame()
    }

    /// Capture one usable frame and encode it as a JPEG face sample.
    ///
    /// Zero-sized and dark frames are reported as transient errors.
    pub fn capture_sample(&mut self) -> Result<Vec<u8>, CameraError> {
        let frame = self.capture_frame()?;
        frame.validate()?;
        if frame.is_dark() {
            return Err(CameraError::CaptureFailed(format!(
                "frame {} too dark (avg brightness {:.1})",
                frame.sequence,
                frame.avg_brightness()
            )));
        }
        Ok(frame.encode_sample()?)
    }

    /// Capture and throw away `count` frames while exposure settles.
    pub fn discard_frames(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.capture_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }

    /// Release the device now rather than at drop.
    pub fn release(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.stop();
            tracing::info!(device = %self.device, "camera stream released");
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Software camera producing a moving gradient pattern.
///
/// Used when no hardware backend is compiled in, and by tests to script
/// permission failures and bad frames.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    permission_denied: bool,
    failing_captures: HashSet<u32>,
    dark_captures: HashSet<u32>,
    open_streams: Arc<AtomicUsize>,
    total_opens: Arc<AtomicUsize>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            permission_denied: false,
            failing_captures: HashSet::new(),
            dark_captures: HashSet::new(),
            open_streams: Arc::new(AtomicUsize::new(0)),
            total_opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every `open` fails as if the user refused camera access.
    pub fn deny_permission(mut self) -> Self {
        self.permission_denied = true;
        self
    }

    /// Capture calls (0-based, counted per stream) that yield a zero-sized frame.
    pub fn fail_captures(mut self, indices: impl IntoIterator<Item = u32>) -> Self {
        self.failing_captures.extend(indices);
        self
    }

    /// Capture calls (0-based, counted per stream) that yield a black frame.
    pub fn dark_captures(mut self, indices: impl IntoIterator<Item = u32>) -> Self {
        self.dark_captures.extend(indices);
        self
    }

    /// Number of streams currently open. Shared, so it can be observed after
    /// the camera has been moved into an engine.
    pub fn open_streams(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_streams)
    }

    /// Number of successful opens over the camera's lifetime.
    pub fn total_opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.total_opens)
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }

    fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError> {
        if self.permission_denied {
            return Err(CameraError::PermissionDenied(
                "synthetic camera configured to refuse access".into(),
            ));
        }
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        self.total_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticStream {
            width: self.width,
            height: self.height,
            failing_captures: self.failing_captures.clone(),
            dark_captures: self.dark_captures.clone(),
            sequence: 0,
            open_streams: Arc::clone(&self.open_streams),
            stopped: false,
        }))
    }
}

struct SyntheticStream {
    width: u32,
    height: u32,
    failing_captures: HashSet<u32>,
    dark_captures: HashSet<u32>,
    sequence: u32,
    open_streams: Arc<AtomicUsize>,
    stopped: bool,
}

impl FrameStream for SyntheticStream {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stopped {
            return Err(CameraError::Released);
        }
        let seq = self.sequence;
        self.sequence += 1;

        if self.failing_captures.contains(&seq) {
            // Mirrors a video element that has not reported its size yet.
            return Ok(Frame {
                data: Vec::new(),
                width: 0,
                height: 0,
                layout: PixelLayout::Rgb,
                timestamp: std::time::Instant::now(),
                sequence: seq,
            });
        }

        let dark = self.dark_captures.contains(&seq);
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                if dark {
                    data.extend_from_slice(&[0, 0, 0]);
                } else {
                    let r = 64 + ((x * 128) / w.max(1)) as u8;
                    let g = 64 + ((y * 128) / h.max(1)) as u8;
                    let b = 96u8.wrapping_add((seq as u8).wrapping_mul(7));
                    data.extend_from_slice(&[r, g, b]);
                }
            }
        }

        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            layout: PixelLayout::Rgb,
            timestamp: std::time::Instant::now(),
            sequence: seq,
        })
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}
