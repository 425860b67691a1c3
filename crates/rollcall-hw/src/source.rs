//! `FrameSource` backed by a V4L2 camera.

use crate::camera::{Camera, CameraStream};
use crate::frame::{self, PixelLayout};
use rollcall_core::{DeviceError, Frame, FrameSource, StillFrame};
use serde::{Deserialize, Serialize};

/// Capture device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded after opening while exposure settles.
    pub warmup_frames: u32,
    /// Send CLAHE-enhanced grayscale stills instead of colour.
    pub auto_adjust_lighting: bool,
    pub jpeg_quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            warmup_frames: 4,
            auto_adjust_lighting: false,
            jpeg_quality: 80,
        }
    }
}

/// Holds the open device and its stream for the whole session. Dropping it
/// stops streaming, then closes the device node.
struct CameraLease {
    stream: CameraStream,
    camera: Camera,
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        tracing::info!(
            device = %self.camera.device_path,
            frames = self.stream.delivered(),
            "camera released"
        );
    }
}

pub struct V4lFrameSource {
    settings: CaptureSettings,
    lease: Option<CameraLease>,
}

impl V4lFrameSource {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            lease: None,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }
}

fn encode_still(
    settings: &CaptureSettings,
    camera: &Camera,
    raw: &[u8],
) -> Result<StillFrame, DeviceError> {
    let quality = settings.jpeg_quality;
    let lighting = settings.auto_adjust_lighting;
    let gray_still = || {
        camera.to_grayscale(raw).and_then(|mut gray| {
            if lighting {
                frame::clahe_enhance(&mut gray, camera.width, camera.height, 8, 0.02);
            }
            frame::encode_jpeg(&gray, camera.width, camera.height, PixelLayout::Gray, quality)
        })
    };
    let colour = if lighting { None } else { camera.to_rgb(raw) };
    let encoded = match colour {
        Some(rgb) => rgb.and_then(|rgb| {
            frame::encode_jpeg(&rgb, camera.width, camera.height, PixelLayout::Rgb, quality)
        }),
        None => gray_still(),
    };
    let jpeg = encoded.map_err(|e| DeviceError::Other(e.to_string()))?;

    Ok(StillFrame {
        jpeg,
        width: camera.width,
        height: camera.height,
        captured_at: chrono::Utc::now(),
    })
}

impl FrameSource for V4lFrameSource {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.lease.is_some() {
            return Ok(());
        }
        let camera = Camera::open(&self.settings.device, self.settings.width, self.settings.height)?;
        let mut stream = camera.stream()?;
        if self.settings.warmup_frames > 0 {
            stream.skip(self.settings.warmup_frames)?;
            tracing::debug!(frames = self.settings.warmup_frames, "warmup frames discarded");
        }
        self.lease = Some(CameraLease { stream, camera });
        Ok(())
    }

    fn stop(&mut self) {
        self.lease = None;
    }

    fn is_active(&self) -> bool {
        self.lease.is_some()
    }

    fn luma_frame(&mut self) -> Result<Option<Frame>, DeviceError> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(None);
        };
        let raw = lease.stream.next_frame()?;
        let camera = &lease.camera;
        let data = camera
            .to_grayscale(&raw.data)
            .map_err(|e| DeviceError::Other(e.to_string()))?;
        Ok(Some(Frame {
            data,
            width: camera.width,
            height: camera.height,
            timestamp: std::time::Instant::now(),
            sequence: raw.sequence,
        }))
    }

    fn capture_frame(&mut self) -> Result<Option<StillFrame>, DeviceError> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(None);
        };
        let raw = lease.stream.next_frame()?;
        let still = encode_still(&self.settings, &lease.camera, &raw.data)?;
        tracing::trace!(bytes = still.jpeg.len(), seq = raw.sequence, "still captured");
        Ok(Some(still))
    }
}

impl Drop for V4lFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
