//! rollcall-hw: V4L2 camera access for attendance capture.
//!
//! Opens a classroom webcam, negotiates a format it can turn into
//! grayscale, and grabs short bursts of frames with dark frames skipped.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
