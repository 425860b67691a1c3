//! rollcall-hw — V4L2 frame source for the kiosk.
//!
//! Opens the capture device, converts YUYV/GREY/Y16 buffers to luminance
//! for presence sampling, and encodes JPEG stills for recognition.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use frame::FrameError;
pub use source::{CaptureSettings, V4lFrameSource};
