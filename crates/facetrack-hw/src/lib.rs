//! facetrack-hw: Camera access and frame handling.
//!
//! Provides the camera device/stream abstraction used by enrollment and
//! recognition captures, a synthetic camera, and (with the `v4l2` feature)
//! V4L2-based capture.

pub mod camera;
pub mod frame;
#[cfg(feature = "v4l2")]
pub mod v4l_camera;

pub use camera::{CameraDevice, CameraError, CameraStream, FrameStream, SyntheticCamera};
pub use frame::{Frame, FrameError, PixelLayout};
#[cfg(feature = "v4l2")]
pub use v4l_camera::V4lCamera;
