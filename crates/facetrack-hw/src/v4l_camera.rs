//! V4L2 camera capture via the `v4l` crate (feature `v4l2`).

use crate::camera::{CameraDevice, CameraError, FrameStream};
use crate::frame::{self, Frame, PixelLayout};
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// `EBUSY` on Linux.
const EBUSY: i32 = 16;

/// A camera found by [`V4lCamera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Yuyv,
    Grey,
}

/// A V4L2 capture device, opened lazily for each capture flow.
pub struct V4lCamera {
    device_path: String,
    width: u32,
    height: u32,
}

impl V4lCamera {
    pub fn new(device_path: &str, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.to_string(),
            width,
            height,
        }
    }

    /// Capture-capable V4L2 nodes under `/dev`, in index order.
    ///
    /// `facetrack test` prints these so the right path can go into
    /// `FACETRACK_CAMERA_DEVICE`. Many webcams expose a metadata node next to
    /// the capture node; those lack `VIDEO_CAPTURE` and are left out.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut nodes: Vec<(u32, String)> = entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().into_string().ok()?;
                Some((video_node_index(&name)?, format!("/dev/{name}")))
            })
            .collect();
        nodes.sort_unstable();

        nodes
            .into_iter()
            .filter_map(|(_, path)| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                    })
            })
            .collect()
    }
}

/// Index of a `/dev/videoN` node name, if it is one.
fn video_node_index(name: &str) -> Option<u32> {
    name.strip_prefix("video")?.parse().ok()
}

impl CameraDevice for V4lCamera {
    fn name(&self) -> String {
        self.device_path.clone()
    }

    fn open(&mut self) -> Result<Box<dyn FrameStream>, CameraError> {
        if !Path::new(&self.device_path).exists() {
            return Err(CameraError::DeviceNotFound(self.device_path.clone()));
        }

        let device = Device::with_path(&self.device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(format!("{}: {e}", self.device_path))
            }
            _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{}: {e}", self.device_path)),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = self.width;
        fmt.height = self.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            device = %self.device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Box::new(V4lStream {
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        }))
    }
}

struct V4lStream {
    device: Option<Device>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl FrameStream for V4lStream {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let device = self.device.as_ref().ok_or(CameraError::Released)?;
        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, 4).map_err(|e| {
            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let pixels = (self.width * self.height) as usize;
        let gray = match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                buf[..pixels].to_vec()
            }
            PixelFormat::Yuyv => frame::yuyv_luma(buf, self.width, self.height)?,
        };

        Ok(Frame {
            data: gray,
            width: self.width,
            height: self.height,
            layout: PixelLayout::Gray,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    fn stop(&mut self) {
        // Dropping the device closes the file descriptor and frees the camera.
        self.device.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_node_index() {
        assert_eq!(video_node_index("video0"), Some(0));
        assert_eq!(video_node_index("video12"), Some(12));
        assert_eq!(video_node_index("video"), None);
        assert_eq!(video_node_index("vhci"), None);
        assert_eq!(video_node_index("video0p1"), None);
    }
}
