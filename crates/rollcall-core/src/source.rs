//! Frame source contract: the capture device as seen by the session.

use crate::presence::NativeDetector;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Capture-device failure. Fatal to the session that hit it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device not supported: {0}")]
    NotSupported(String),
    #[error("device already in use: {0}")]
    AlreadyInUse(String),
    #[error("device error: {0}")]
    Other(String),
}

impl DeviceError {
    /// Message shown to the person standing at the kiosk, paired with a retry action.
    pub fn user_message(&self) -> String {
        match self {
            DeviceError::PermissionDenied(_) => {
                "Camera access denied. Allow access to the camera and try again.".to_string()
            }
            DeviceError::NotFound(_) => {
                "No camera found. Connect a camera and try again.".to_string()
            }
            DeviceError::NotSupported(_) => {
                "This camera is not supported. Try a different capture device.".to_string()
            }
            DeviceError::AlreadyInUse(_) => {
                "Camera is already in use by another application.".to_string()
            }
            DeviceError::Other(msg) => format!("Camera failed: {msg}"),
        }
    }

    /// Short machine-readable kind, used in status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::PermissionDenied(_) => "permission_denied",
            DeviceError::NotFound(_) => "not_found",
            DeviceError::NotSupported(_) => "not_supported",
            DeviceError::AlreadyInUse(_) => "already_in_use",
            DeviceError::Other(_) => "other",
        }
    }
}

/// An 8-bit luminance frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

/// An encoded still image handed to the recognition service.
#[derive(Clone)]
pub struct StillFrame {
    /// JPEG bytes.
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl std::fmt::Debug for StillFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StillFrame")
            .field("bytes", &self.jpeg.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Owner of the capture device for one session.
///
/// Implementations must release the device in `stop()` and again on drop,
/// so that every exit path leaves the device free.
pub trait FrameSource: Send {
    /// Acquire the device. No-op when already active.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Release the device. Idempotent.
    fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Current luminance frame, or `None` when the source is not ready.
    fn luma_frame(&mut self) -> Result<Option<Frame>, DeviceError>;

    /// Encoded still of the current frame, or `None` when the source is not ready.
    fn capture_frame(&mut self) -> Result<Option<StillFrame>, DeviceError>;

    /// Platform face-presence primitive, if the runtime exposes one.
    fn native_presence(&self) -> Option<NativeDetector> {
        None
    }
}
