//! Core traits and types for the camera driver seam.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::controls::{ControlConfig, ControlId, ControlValue};

/// Pixel format representation (e.g., MJPG).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count, used to rank frame sizes.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("invalid width {w:?}: {err}"))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|err| format!("invalid height {h:?}: {err}"))?;
        if width == 0 || height == 0 {
            return Err(format!("resolution must be non-zero, got {s:?}"));
        }
        Ok(Self { width, height })
    }
}

/// Video format requested when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame size.
    pub resolution: Resolution,
    /// Pixel format.
    pub fourcc: FourCC,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            resolution: Resolution::new(width, height),
            fourcc,
        }
    }

    /// Compressed still-image format used for both preview and capture.
    #[must_use]
    pub const fn mjpeg(resolution: Resolution) -> Self {
        Self {
            resolution,
            fourcc: FourCC::MJPG,
        }
    }
}

/// Receiving half of a device's frame stream.
///
/// Each item is one complete compressed image. The channel closes once the
/// device stops streaming.
pub type FrameSource = mpsc::Receiver<Bytes>;

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The session already holds an open handle.
    #[error("already started")]
    AlreadyStarted,
    /// The operation needs an open handle.
    #[error("camera not started")]
    NotStarted,
    /// Preview is already running.
    #[error("preview already started")]
    PreviewActive,
    /// Failed to open or start the device.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The device reported EBUSY.
    #[error("device busy: {0}")]
    Busy(String),
    /// The frame stream closed before delivering a frame.
    #[error("capture stream closed")]
    StreamClosed,
    /// No frame arrived within the caller's deadline.
    #[error("timed out waiting for frame")]
    FrameTimeout,
    /// A control could not be read or applied.
    #[error("control {id:#x}: {message}")]
    Control {
        /// Control identifier.
        id: ControlId,
        /// Driver message.
        message: String,
    },
    /// A frame failed validation.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// The device reported no usable frame size.
    #[error("unable to determine the maximum pixels of the camera")]
    FrameSizeUnknown,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Whether the error looks like a transient "device busy" condition.
    ///
    /// Drivers word this differently, so the check is a case-insensitive
    /// match on the rendered message.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        if matches!(self, Self::Busy(_)) {
            return true;
        }
        let msg = self.to_string().to_lowercase();
        msg.contains("busy") || msg.contains("ebusy")
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Opens handles on a capture device.
pub trait CameraDriver: Send + Sync {
    /// Open the device at `path` with the given format and buffer depth.
    fn open(&self, path: &str, format: &Format, buffer_depth: u32) -> Result<Box<dyn DeviceHandle>>;
}

/// An open, exclusively owned device handle.
pub trait DeviceHandle: Send {
    /// Begin streaming. The stream runs until `cancel` fires.
    fn start(&mut self, cancel: CancellationToken) -> Result<FrameSource>;

    /// Set a single control value.
    fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()>;

    /// Read metadata and the current value for a control.
    fn control_config(&self, id: ControlId) -> Result<ControlConfig>;

    /// Largest frame size per enumerated entry for the given pixel format.
    fn max_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<Resolution>>;

    /// Stop streaming and release the handle.
    ///
    /// Returns only once the device is free to be opened again, which may mean
    /// blocking until the stream's reader has exited.
    fn close(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parse() {
        let res: Resolution = "1280x720".parse().expect("parse should succeed");
        assert_eq!(res, Resolution::new(1280, 720));

        let res: Resolution = " 3280 X 2464 ".parse().expect("parse should succeed");
        assert_eq!(res, Resolution::new(3280, 2464));
    }

    #[test]
    fn test_resolution_parse_rejects_garbage() {
        assert!("1280".parse::<Resolution>().is_err());
        assert!("0x720".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::new(640, 480).to_string(), "640x480");
    }

    #[test]
    fn test_busy_detection() {
        assert!(CameraError::Busy("resume".to_owned()).is_busy());
        assert!(CameraError::DeviceUnavailable("Device or resource BUSY".to_owned()).is_busy());
        assert!(CameraError::DeviceUnavailable("EBUSY".to_owned()).is_busy());
        assert!(!CameraError::DeviceUnavailable("No such file or directory".to_owned()).is_busy());
        assert!(!CameraError::StreamClosed.is_busy());
    }

    #[test]
    fn test_fourcc_v4l_roundtrip() {
        let v4l_fourcc: v4l::FourCC = FourCC::MJPG.into();
        assert_eq!(FourCC::from(v4l_fourcc), FourCC::MJPG);
    }
}
