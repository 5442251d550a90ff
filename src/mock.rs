//! Mock driver implementation for testing without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::controls::{ControlConfig, ControlId, ControlValue, Settings};
use crate::traits::{
    CameraDriver, CameraError, DeviceHandle, Format, FourCC, FrameSource, Resolution, Result,
};

/// How often the reader thread re-checks cancellation while waiting for a frame.
const READER_POLL: Duration = Duration::from_millis(5);

/// Shared counters and scripted behavior behind a [`MockDriver`].
#[derive(Default)]
struct MockState {
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
    contended_opens: AtomicUsize,
    opens: AtomicUsize,
    frame_seq: AtomicU32,
    open_failures: Mutex<VecDeque<Option<CameraError>>>,
    opened_formats: Mutex<Vec<Format>>,
    applied: Mutex<Vec<(ControlId, ControlValue)>>,
    unsupported: Mutex<Vec<ControlId>>,
    frame_sizes: Mutex<Vec<Resolution>>,
}

/// Mock driver producing fake JPEG frames on a reader thread.
///
/// Behaves like a real device in two important ways: opening while another
/// handle is live fails with a busy error, and the device stays held until
/// the reader thread has exited, not merely until the stream is cancelled.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
    frame_interval: Duration,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a new mock driver emitting a frame every 5 ms.
    #[must_use]
    pub fn new() -> Self {
        let state = MockState::default();
        if let Ok(mut sizes) = state.frame_sizes.lock() {
            sizes.extend([Resolution::new(1640, 1232), Resolution::new(3280, 2464)]);
        }
        Self {
            state: Arc::new(state),
            frame_interval: Duration::from_millis(5),
        }
    }

    /// Set the delay between generated frames.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Script the outcome of upcoming opens, in order.
    ///
    /// `None` lets that open succeed; once the script is exhausted every
    /// open succeeds.
    pub fn script_opens<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = Option<CameraError>>,
    {
        if let Ok(mut script) = self.state.open_failures.lock() {
            script.extend(outcomes);
        }
    }

    /// Make `control_config` and `set_control` fail for `id`.
    pub fn mark_unsupported(&self, id: ControlId) {
        if let Ok(mut ids) = self.state.unsupported.lock() {
            ids.push(id);
        }
    }

    /// Replace the frame sizes reported for MJPEG.
    pub fn set_frame_sizes(&self, sizes: Vec<Resolution>) {
        if let Ok(mut current) = self.state.frame_sizes.lock() {
            *current = sizes;
        }
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state.open_handles.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held handles, counting rejected
    /// overlapping opens.
    pub fn max_open_handles(&self) -> usize {
        self.state.max_open_handles.load(Ordering::SeqCst)
    }

    /// Opens attempted while another handle (or its reader) still held the
    /// device.
    pub fn contended_opens(&self) -> usize {
        self.state.contended_opens.load(Ordering::SeqCst)
    }

    /// Total open attempts, including failed ones.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Formats of every successful open, in order.
    pub fn opened_formats(&self) -> Vec<Format> {
        self.state
            .opened_formats
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// Every control write that reached a handle, in order.
    pub fn applied_controls(&self) -> Vec<(ControlId, ControlValue)> {
        self.state
            .applied
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Last value applied per control.
    pub fn applied_settings(&self) -> Settings {
        self.applied_controls().into_iter().collect()
    }
}

impl CameraDriver for MockDriver {
    fn open(
        &self,
        path: &str,
        format: &Format,
        _buffer_depth: u32,
    ) -> Result<Box<dyn DeviceHandle>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .state
            .open_failures
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .flatten();
        if let Some(err) = scripted {
            return Err(err);
        }

        let held = self.state.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open_handles.fetch_max(held, Ordering::SeqCst);
        if held > 1 {
            self.state.contended_opens.fetch_add(1, Ordering::SeqCst);
            self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
            return Err(CameraError::Busy(format!("{path}: Device or resource busy")));
        }
        if let Ok(mut formats) = self.state.opened_formats.lock() {
            formats.push(*format);
        }

        Ok(Box::new(MockHandle {
            state: Arc::clone(&self.state),
            hold: Some(Arc::new(DeviceHold(Arc::clone(&self.state)))),
            resolution: format.resolution,
            frame_interval: self.frame_interval,
            reader: None,
        }))
    }
}

/// Keeps the mock device busy until the last clone is dropped.
///
/// The handle and its reader thread each own a clone, like the file
/// descriptor shared between a real handle and its streaming thread.
struct DeviceHold(Arc<MockState>);

impl Drop for DeviceHold {
    fn drop(&mut self) {
        self.0.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Reader {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

/// Mock device handle.
pub struct MockHandle {
    state: Arc<MockState>,
    hold: Option<Arc<DeviceHold>>,
    resolution: Resolution,
    frame_interval: Duration,
    reader: Option<Reader>,
}

impl MockHandle {
    fn is_unsupported(&self, id: ControlId) -> bool {
        self.state
            .unsupported
            .lock()
            .map(|ids| ids.contains(&id))
            .unwrap_or(false)
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.cancel.cancel();
            if reader.thread.join().is_err() {
                tracing::warn!("mock reader thread panicked");
            }
        }
        self.hold = None;
    }
}

impl DeviceHandle for MockHandle {
    fn start(&mut self, cancel: CancellationToken) -> Result<FrameSource> {
        if self.reader.is_some() {
            return Err(CameraError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(1);
        let state = Arc::clone(&self.state);
        let hold = self.hold.clone();
        let resolution = self.resolution;
        let interval = self.frame_interval;
        let token = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("mock-stream".to_owned())
            .spawn(move || {
                let _hold = hold;
                let mut due = Instant::now() + interval;
                while !token.is_cancelled() {
                    let now = Instant::now();
                    if now < due {
                        std::thread::sleep(READER_POLL.min(due - now));
                        continue;
                    }
                    due += interval;
                    let seq = state.frame_seq.fetch_add(1, Ordering::SeqCst);
                    match tx.try_send(fake_jpeg(resolution, seq)) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            })?;

        self.reader = Some(Reader { cancel, thread });
        Ok(rx)
    }

    fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()> {
        if self.is_unsupported(id) {
            return Err(CameraError::Control {
                id,
                message: "Invalid argument".to_owned(),
            });
        }
        if let Ok(mut applied) = self.state.applied.lock() {
            applied.push((id, value));
        }
        Ok(())
    }

    fn control_config(&self, id: ControlId) -> Result<ControlConfig> {
        if self.is_unsupported(id) {
            return Err(CameraError::Control {
                id,
                message: "Invalid argument".to_owned(),
            });
        }
        let value = self
            .state
            .applied
            .lock()
            .ok()
            .and_then(|applied| applied.iter().rev().find(|(cid, _)| *cid == id).map(|(_, v)| *v))
            .unwrap_or(0);

        Ok(ControlConfig {
            id,
            name: format!("Control {id:#x}"),
            value,
            is_menu: false,
            menu_items: Vec::new(),
            minimum: 0,
            maximum: 10_000,
            step: 1,
            default: 0,
        })
    }

    fn max_frame_sizes(&self, fourcc: FourCC) -> Result<Vec<Resolution>> {
        if fourcc != FourCC::MJPG {
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .frame_sizes
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build a tiny frame with JPEG markers around a `WxH#seq` tag.
pub fn fake_jpeg(resolution: Resolution, seq: u32) -> Bytes {
    let tag = format!("{resolution}#{seq}");
    let mut buf = BytesMut::with_capacity(tag.len() + 4);
    buf.put_slice(&[0xFF, 0xD8]);
    buf.put_slice(tag.as_bytes());
    buf.put_slice(&[0xFF, 0xD9]);
    buf.freeze()
}

/// Resolution tag embedded in a frame produced by [`fake_jpeg`].
pub fn frame_resolution(frame: &[u8]) -> Option<Resolution> {
    let body = frame.get(2..frame.len().checked_sub(2)?)?;
    let tag = std::str::from_utf8(body).ok()?;
    let (res, _) = tag.split_once('#')?;
    res.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_driver_streams_frames() {
        let driver = MockDriver::new();
        let mut handle = driver
            .open("/dev/video0", &Format::mjpeg(Resolution::new(640, 480)), 1)
            .expect("open should succeed");
        let cancel = CancellationToken::new();
        let mut frames = handle.start(cancel.clone()).expect("start should succeed");

        let frame = frames.recv().await.expect("frame should arrive");
        assert_eq!(frame_resolution(&frame), Some(Resolution::new(640, 480)));

        cancel.cancel();
        handle.close().expect("close should succeed");
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn test_mock_driver_rejects_second_open() {
        let driver = MockDriver::new();
        let format = Format::mjpeg(Resolution::new(640, 480));
        let _first = driver.open("/dev/video0", &format, 1).expect("open should succeed");

        let second = driver.open("/dev/video0", &format, 1);
        assert!(matches!(second, Err(ref err) if err.is_busy()));
        assert_eq!(driver.contended_opens(), 1);
        assert_eq!(driver.max_open_handles(), 2);
        assert_eq!(driver.open_handles(), 1);
    }

    #[test]
    fn test_reader_holds_device_until_joined() {
        let driver = MockDriver::new();
        let format = Format::mjpeg(Resolution::new(640, 480));
        let mut handle = driver.open("/dev/video0", &format, 1).expect("open should succeed");
        let cancel = CancellationToken::new();
        let _frames = handle.start(cancel.clone()).expect("start should succeed");

        // Cancelling alone does not free the device; close waits for the reader.
        cancel.cancel();
        handle.close().expect("close should succeed");
        assert_eq!(driver.open_handles(), 0);

        let _again = driver.open("/dev/video0", &format, 1).expect("reopen should succeed");
        assert_eq!(driver.contended_opens(), 0);
    }

    #[test]
    fn test_dropped_handle_releases_device() {
        let driver = MockDriver::new();
        let format = Format::mjpeg(Resolution::new(640, 480));
        let mut handle = driver.open("/dev/video0", &format, 1).expect("open should succeed");
        let _frames = handle
            .start(CancellationToken::new())
            .expect("start should succeed");

        drop(handle);
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn test_mock_driver_scripted_failures() {
        let driver = MockDriver::new();
        driver.script_opens([Some(CameraError::Busy("scripted".to_owned())), None]);
        let format = Format::mjpeg(Resolution::new(640, 480));

        assert!(driver.open("/dev/video0", &format, 1).is_err());
        assert!(driver.open("/dev/video0", &format, 1).is_ok());
        assert_eq!(driver.opens(), 2);
    }

    #[test]
    fn test_fake_jpeg_tag() {
        let frame = fake_jpeg(Resolution::new(3280, 2464), 7);
        assert_eq!(frame.first(), Some(&0xFF));
        assert_eq!(frame_resolution(&frame), Some(Resolution::new(3280, 2464)));
    }
}
