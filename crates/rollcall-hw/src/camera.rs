//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use rollcall_core::DeviceError;
use std::io;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed; the only format with colour.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(PixelFormat::Y16)
        } else {
            None
        }
    }
}

/// One dequeued buffer, copied out of the mmap ring.
pub struct RawFrame {
    pub data: Vec<u8>,
    pub sequence: u32,
}

const STREAM_BUFFERS: u32 = 4;

/// Open V4L2 capture device. Closing happens on drop.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

/// Map an I/O failure from the driver onto the device error taxonomy.
///
/// `fallback` builds the error used when the failure is not a permission,
/// presence, or contention problem.
pub(crate) fn classify_io_error(
    path: &str,
    err: &io::Error,
    fallback: fn(String) -> DeviceError,
) -> DeviceError {
    let detail = format!("{path}: {err}");
    if err.raw_os_error() == Some(libc::EBUSY) {
        return DeviceError::AlreadyInUse(detail);
    }
    if matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO)) {
        return DeviceError::NotFound(detail);
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(detail),
        io::ErrorKind::NotFound => DeviceError::NotFound(detail),
        _ => fallback(detail),
    }
}

/// A running capture stream. The mmap ring holds its own reference to the
/// device handle, so the stream may outlive the borrow it was created from.
pub struct CameraStream {
    stream: MmapStream<'static>,
    device_path: String,
    delivered: u64,
}

impl CameraStream {
    /// Dequeue the next filled buffer.
    pub fn next_frame(&mut self) -> Result<RawFrame, DeviceError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| classify_io_error(&self.device_path, &e, DeviceError::Other))?;
        self.delivered += 1;
        Ok(RawFrame {
            data: buf.to_vec(),
            sequence: meta.sequence,
        })
    }

    /// Dequeue and drop `count` buffers.
    pub fn skip(&mut self, count: u32) -> Result<(), DeviceError> {
        for _ in 0..count {
            self.next_frame()?;
        }
        Ok(())
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, frames = self.delivered, "streaming stopped");
    }
}

impl Camera {
    /// Open a capture device and negotiate `width`×`height`, preferring YUYV.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, DeviceError> {
        if !Path::new(device_path).exists() {
            return Err(DeviceError::NotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| classify_io_error(device_path, &e, DeviceError::Other))?;

        let caps = device
            .query_caps()
            .map_err(|e| classify_io_error(device_path, &e, DeviceError::NotSupported))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(DeviceError::NotSupported(format!(
                "{device_path}: {} has no video capture capability",
                caps.card
            )));
        }

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let mut fmt = device
            .format()
            .map_err(|e| classify_io_error(device_path, &e, DeviceError::NotSupported))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| classify_io_error(device_path, &e, DeviceError::NotSupported))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            DeviceError::NotSupported(format!(
                "{device_path}: unsupported pixel format {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Map capture buffers and start streaming. Streaming continues until
    /// the returned stream is dropped.
    pub fn stream(&self) -> Result<CameraStream, DeviceError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| classify_io_error(&self.device_path, &e, DeviceError::Other))?;
        tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "streaming started");
        Ok(CameraStream {
            stream,
            device_path: self.device_path.clone(),
            delivered: 0,
        })
    }

    /// 8-bit luminance for a raw buffer in the negotiated format.
    pub fn to_grayscale(&self, raw: &[u8]) -> Result<Vec<u8>, FrameError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(raw, self.width, self.height),
            PixelFormat::Y16 => frame::y16_to_grayscale(raw, self.width, self.height),
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if raw.len() < pixels {
                    return Err(FrameError::InvalidLength {
                        expected: pixels,
                        actual: raw.len(),
                    });
                }
                Ok(raw[..pixels].to_vec())
            }
        }
    }

    /// Interleaved RGB, available only when the camera delivers YUYV.
    pub fn to_rgb(&self, raw: &[u8]) -> Option<Result<Vec<u8>, FrameError>> {
        match self.pixel_format {
            PixelFormat::Yuyv => Some(frame::yuyv_to_rgb(raw, self.width, self.height)),
            PixelFormat::Grey | PixelFormat::Y16 => None,
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}
