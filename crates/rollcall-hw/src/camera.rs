//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use image::GrayImage;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame is discarded.
const DARK_FRAME_PCT: f32 = 0.95;

/// EBUSY: another process holds the device.
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    NotFound(String),
    #[error("camera {0} is in use by another process")]
    Busy(String),
    #[error("{0} is not a video capture device")]
    NotCapture(String),
    #[error("unsupported pixel format {0} (need YUYV, GREY or MJPG)")]
    UnsupportedFormat(String),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Convert(#[from] FrameError),
}

fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> CameraError {
    move |source| CameraError::Io { context, source }
}

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
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// Motion JPEG, one compressed image per buffer.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera and request `width`×`height` YUYV.
    ///
    /// Drivers that only offer GREY or MJPG are accepted as negotiated.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::Busy(device_path.to_string()),
            _ => CameraError::Io {
                context: "opening device",
                source: e,
            },
        })?;

        let caps = device.query_caps().map_err(io("querying capabilities"))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCapture(device_path.to_string()));
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let requested = v4l::Format::new(width, height, FourCC::new(b"YUYV"));
        let negotiated = device.set_format(&requested).map_err(io("setting format"))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc)
            .ok_or_else(|| CameraError::UnsupportedFormat(negotiated.fourcc.to_string()))?;

        if (negotiated.width, negotiated.height) != (width, height) {
            tracing::warn!(
                requested_width = width,
                requested_height = height,
                width = negotiated.width,
                height = negotiated.height,
                "driver picked a different resolution"
            );
        }
        tracing::info!(format = ?pixel_format, width = negotiated.width, height = negotiated.height, "format negotiated");

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn to_gray(&self, buf: &[u8]) -> Result<GrayImage, FrameError> {
        match self.pixel_format {
            PixelFormat::Grey => frame::grey_to_image(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
            PixelFormat::Mjpeg => frame::mjpeg_to_grayscale(buf),
        }
    }

    /// Capture a burst of `count` usable frames, `spacing` apart.
    ///
    /// The first `warmup` buffers are thrown away while exposure settles.
    /// Dark frames are skipped; at most `count * 3` buffers are read after
    /// warm-up. Returns the frames and the number of dark frames skipped.
    pub fn capture_burst(
        &self,
        count: usize,
        spacing: Duration,
        warmup: usize,
    ) -> Result<(Vec<Frame>, usize), CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(io("starting mmap stream"))?;

        for _ in 0..warmup {
            stream.next().map_err(io("dequeuing warm-up buffer"))?;
        }

        let mut kept = Vec::with_capacity(count);
        let mut dark = 0usize;
        let mut last_kept: Option<Instant> = None;

        for _ in 0..count * 3 {
            if kept.len() == count {
                break;
            }
            if let Some(at) = last_kept {
                let elapsed = at.elapsed();
                if elapsed < spacing {
                    std::thread::sleep(spacing - elapsed);
                }
            }

            let (buf, meta) = stream.next().map_err(io("dequeuing buffer"))?;
            let image = self.to_gray(buf)?;
            if frame::is_dark_frame(image.as_raw(), DARK_FRAME_PCT) {
                dark += 1;
                tracing::trace!(seq = meta.sequence, "dark frame");
                continue;
            }

            let now = Instant::now();
            last_kept = Some(now);
            kept.push(Frame {
                image,
                timestamp: now,
                sequence: meta.sequence,
            });
        }

        tracing::debug!(kept = kept.len(), dark, "burst complete");
        Ok((kept, dark))
    }

    /// Video capture devices under `/dev`, sorted by path.
    ///
    /// Metadata-only nodes (UVC exposes one per camera) are left out.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut devices: Vec<DeviceInfo> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("video"))
            .filter_map(|e| {
                let path = e.path().to_string_lossy().into_owned();
                let caps = Device::with_path(&path).and_then(|d| d.query_caps()).ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect();
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        devices
    }
}
