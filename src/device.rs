//! V4L2 driver implementation using the v4l crate.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, MenuItem, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::controls::{ControlConfig, ControlId, ControlValue};
use crate::traits::{
    CameraDriver, CameraError, DeviceHandle, Format, FourCC, FrameSource, Resolution, Result,
};

const EBUSY: i32 = 16;

/// How long a dequeue may block before the reader re-checks cancellation.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(50);

/// Map an open/stream error, keeping EBUSY distinguishable for retry logic.
fn open_error(err: &std::io::Error) -> CameraError {
    if err.raw_os_error() == Some(EBUSY) {
        CameraError::Busy(err.to_string())
    } else {
        CameraError::DeviceUnavailable(err.to_string())
    }
}

/// Opens V4L2 devices by path.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4L2Driver;

impl V4L2Driver {
    /// Create a new driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CameraDriver for V4L2Driver {
    fn open(
        &self,
        path: &str,
        format: &Format,
        buffer_depth: u32,
    ) -> Result<Box<dyn DeviceHandle>> {
        let device = Device::with_path(path).map_err(|err| open_error(&err))?;

        let caps = device.query_caps().map_err(|err| open_error(&err))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{path} ({}) cannot capture video",
                caps.card
            )));
        }

        let requested = v4l::Format::new(
            format.resolution.width,
            format.resolution.height,
            format.fourcc.into(),
        );
        let actual = device
            .set_format(&requested)
            .map_err(|err| open_error(&err))?;
        if FourCC::from(actual.fourcc) != format.fourcc {
            return Err(CameraError::DeviceUnavailable(format!(
                "{path} does not support {:?}",
                format.fourcc
            )));
        }
        debug!(
            path,
            width = actual.width,
            height = actual.height,
            "device format set"
        );

        Ok(Box::new(V4L2Handle {
            device: Arc::new(device),
            buffer_depth,
            reader: None,
        }))
    }
}

/// An open V4L2 device.
///
/// The device is shared with the reader thread, so the file descriptor stays
/// open until both this handle and the stream are gone. [`close`] joins the
/// reader, which makes the release happen before it returns.
///
/// [`close`]: DeviceHandle::close
pub struct V4L2Handle {
    device: Arc<Device>,
    buffer_depth: u32,
    reader: Option<Reader>,
}

/// The streaming thread of a started handle.
struct Reader {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

impl Drop for V4L2Handle {
    fn drop(&mut self) {
        // Dropped without close: let the reader wind down on its own.
        if let Some(reader) = self.reader.take() {
            reader.cancel.cancel();
        }
    }
}

impl DeviceHandle for V4L2Handle {
    fn start(&mut self, cancel: CancellationToken) -> Result<FrameSource> {
        if self.reader.is_some() {
            return Err(CameraError::AlreadyStarted);
        }

        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, self.buffer_depth)
            .map_err(|err| open_error(&err))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        let (tx, rx) = mpsc::channel(1);
        let device = Arc::clone(&self.device);
        let token = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("v4l2-stream".to_owned())
            .spawn(move || {
                read_frames(&mut stream, &tx, &token);
                // Buffers are unmapped and streaming is turned off here.
                drop(stream);
                drop(device);
            })?;

        self.reader = Some(Reader { cancel, thread });
        Ok(rx)
    }

    fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()> {
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(i64::from(value)),
            })
            .map_err(|err| CameraError::Control {
                id,
                message: err.to_string(),
            })
    }

    fn control_config(&self, id: ControlId) -> Result<ControlConfig> {
        let control_err = |message: String| CameraError::Control { id, message };

        let desc = self
            .device
            .query_controls()
            .map_err(|err| control_err(err.to_string()))?
            .into_iter()
            .find(|desc| desc.id == id)
            .ok_or_else(|| control_err("not supported by device".to_owned()))?;

        let current = self
            .device
            .control(id)
            .map_err(|err| control_err(err.to_string()))?;
        let value = match current.value {
            Value::Integer(v) => ControlValue::try_from(v)
                .map_err(|_| control_err(format!("value {v} out of range")))?,
            Value::Boolean(b) => ControlValue::from(b),
            _ => return Err(control_err("not an integer control".to_owned())),
        };

        let menu_items: Vec<String> = desc
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|(_, item)| match item {
                MenuItem::Name(name) => name,
                MenuItem::Value(v) => v.to_string(),
            })
            .collect();

        Ok(ControlConfig {
            id,
            name: desc.name,
            value,
            is_menu: !menu_items.is_empty(),
            menu_items,
            minimum: desc.minimum,
            maximum: desc.maximum,
            step: desc.step,
            default: desc.default,
        })
    }

    fn max_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<Resolution>> {
        let sizes = self.device.enum_framesizes(fourcc.into())?;

        Ok(sizes
            .into_iter()
            .map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => Resolution::new(d.width, d.height),
                FrameSizeEnum::Stepwise(s) => Resolution::new(s.max_width, s.max_height),
            })
            .collect())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.cancel.cancel();
            reader.thread.join().map_err(|_| {
                CameraError::DeviceUnavailable("stream reader thread panicked".to_owned())
            })?;
        }
        debug!("closing device handle");
        Ok(())
    }
}

/// Dequeue frames until cancelled, forwarding each into `tx`.
///
/// Frames are dropped when the receiver is not keeping up: the channel holds
/// one frame and a stale frame is worth less than a fresh one.
fn read_frames(stream: &mut Stream<'_>, tx: &mpsc::Sender<Bytes>, cancel: &CancellationToken) {
    let mut count = 0u64;

    while !cancel.is_cancelled() {
        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(err) => {
                warn!(error = %err, "frame dequeue failed, ending stream");
                break;
            }
        };

        let used = usize::try_from(meta.bytesused).unwrap_or(buf.len());
        let data = buf.get(..used).unwrap_or(buf);
        if data.is_empty() {
            continue;
        }

        count += 1;
        match tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("frame receiver dropped");
                break;
            }
        }
    }

    info!(frames = count, "stream stopped");
}
