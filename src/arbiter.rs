//! Preview/capture arbitration over a single [`DeviceSession`].
//!
//! Preview consumers get one long-lived channel that survives device
//! reopens. A still capture pauses preview, reopens the device at capture
//! resolution, reads one frame and then resumes preview at its previous
//! resolution. The two modes never hold the device at the same time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controls::{ControlConfig, ControlId, ControlValue};
use crate::session::DeviceSession;
use crate::traits::{CameraError, FrameSource, Resolution, Result};

/// What the device is currently doing on behalf of the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Nothing is streaming.
    Idle,
    /// Frames flow into the preview channel.
    Previewing,
    /// A one-shot still capture owns the device.
    Capturing,
}

/// Retry schedule for reopening preview after a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePolicy {
    /// Total open attempts.
    pub attempts: u32,
    /// Delay before the first attempt, letting the driver release buffers.
    pub settle: Duration,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            settle: Duration::from_millis(50),
            backoff: Duration::from_millis(150),
        }
    }
}

/// Cloneable handle to the persistent preview channel.
///
/// Every clone reads from the same underlying channel; frames go to
/// whichever reader polls first. The channel ends only after
/// [`Arbiter::stop_preview`].
#[derive(Clone)]
pub struct PreviewFrames {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
}

impl PreviewFrames {
    /// Receive the next preview frame, or `None` once preview is stopped.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    /// Whether both handles refer to the same preview channel.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl std::fmt::Debug for PreviewFrames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewFrames")
            .field("channel", &Arc::as_ptr(&self.rx))
            .finish()
    }
}

/// References held while a preview channel exists.
struct PreviewLink {
    frames: PreviewFrames,
    sources: mpsc::Sender<FrameSource>,
    stop: CancellationToken,
}

struct ArbiterState {
    mode: Mode,
    preview: Option<PreviewLink>,
    resolution: Resolution,
    /// Whether the capture in flight paused a running preview.
    paused_preview: bool,
}

/// Enforces mutual exclusion between preview streaming and still capture.
pub struct Arbiter {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<DeviceSession>,
    resume: ResumePolicy,
    /// Serializes `start_preview`, `stop_preview` and `capture`.
    op: tokio::sync::Mutex<()>,
    state: Mutex<ArbiterState>,
}

impl Arbiter {
    /// Wrap `session`. The arbiter assumes it is the session's only user.
    pub fn new(session: Arc<DeviceSession>, resume: ResumePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                resume,
                op: tokio::sync::Mutex::new(()),
                state: Mutex::new(ArbiterState {
                    mode: Mode::Idle,
                    preview: None,
                    resolution: Resolution::new(0, 0),
                    paused_preview: false,
                }),
            }),
        }
    }

    /// The wrapped device session.
    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.inner.session
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.inner.state().mode
    }

    /// Resolution preview resumes at after a capture.
    pub fn preview_resolution(&self) -> Option<Resolution> {
        let state = self.inner.state();
        state.preview.as_ref().map(|_| state.resolution)
    }

    /// Start preview at `width`x`height`.
    ///
    /// The returned channel is the same object across preview sessions until
    /// [`stop_preview`](Self::stop_preview) is called.
    pub async fn start_preview(&self, width: u32, height: u32) -> Result<PreviewFrames> {
        let inner = &self.inner;
        let _op = inner.op.lock().await;

        inner.recover_abandoned_capture().await;

        let (frames, sources) = {
            let mut state = inner.state();
            if state.mode == Mode::Previewing {
                return Err(CameraError::PreviewActive);
            }
            let link = state.preview.get_or_insert_with(spawn_forwarder);
            (link.frames.clone(), link.sources.clone())
        };

        let source = inner.session.start(width, height).await?;
        {
            let mut state = inner.state();
            state.resolution = Resolution::new(width, height);
            state.mode = Mode::Previewing;
        }
        publish(&sources, source).await;

        info!(width, height, "preview started");
        Ok(frames)
    }

    /// Stop preview and close the preview channel.
    pub async fn stop_preview(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op.lock().await;

        let link = {
            let mut state = inner.state();
            if state.mode != Mode::Previewing && state.preview.is_none() {
                return Ok(());
            }
            state.mode = Mode::Idle;
            state.preview.take()
        };

        let result = inner.session.stop().await;
        if let Some(link) = link {
            link.stop.cancel();
        }

        info!("preview stopped");
        result
    }

    /// Capture one frame at `width`x`height`.
    ///
    /// Blocks until the device delivers a frame; wrap the call in a timeout
    /// (or use [`capture_with_timeout`](Self::capture_with_timeout)) for
    /// bounded latency. If preview was running it is paused for the duration
    /// and resumed afterwards.
    ///
    /// Dropping the future mid-capture releases the device in the background
    /// and resumes preview if it had been paused.
    pub async fn capture(&self, width: u32, height: u32) -> Result<Bytes> {
        self.inner.capture_frame(width, height, None).await
    }

    /// [`capture`](Self::capture) with a deadline on the frame read.
    ///
    /// On expiry the device is released and preview resumed exactly as after
    /// a successful capture, then [`CameraError::FrameTimeout`] is returned.
    pub async fn capture_with_timeout(
        &self,
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.inner.capture_frame(width, height, Some(timeout)).await
    }

    /// Store a control value on the session.
    pub async fn set_control_value(&self, id: ControlId, value: ControlValue) -> Result<()> {
        self.inner.session.set_control_value(id, value).await
    }

    /// Registry controls the open device supports.
    pub async fn known_ctrl_configs(&self) -> Result<Vec<ControlConfig>> {
        self.inner.session.known_ctrl_configs().await
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn capture_frame(
        self: &Arc<Self>,
        width: u32,
        height: u32,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let _op = self.op.lock().await;
        self.recover_abandoned_capture().await;

        let was_previewing = {
            let mut state = self.state();
            let was = state.mode == Mode::Previewing;
            state.mode = Mode::Capturing;
            state.paused_preview = was;
            was
        };
        let guard = AbandonGuard::arm(self);

        if was_previewing {
            // The forwarder sees its source end and idles.
            if let Err(err) = self.session.stop().await {
                warn!(error = %err, "failed to pause preview for capture");
            }
        }

        debug!(width, height, was_previewing, "capturing");
        let mut frames = match self.session.start(width, height).await {
            Ok(frames) => frames,
            Err(err) => {
                self.finish_capture(was_previewing).await;
                guard.disarm();
                return Err(err);
            }
        };

        let frame = match timeout {
            Some(limit) => tokio::time::timeout(limit, frames.recv())
                .await
                .map_err(|_| CameraError::FrameTimeout),
            None => Ok(frames.recv().await),
        };
        if let Err(err) = self.session.stop().await {
            warn!(error = %err, "failed to stop capture stream");
        }
        drop(frames);

        let result = match frame {
            Ok(Some(frame)) => Ok(Bytes::copy_from_slice(&frame)),
            Ok(None) => Err(CameraError::StreamClosed),
            Err(err) => Err(err),
        };
        self.finish_capture(was_previewing).await;
        guard.disarm();

        if let Ok(image) = &result {
            info!(width, height, bytes = image.len(), "captured image");
        }
        result
    }

    /// Release the device if a previous capture was cancelled mid-flight.
    ///
    /// Only called with the operation gate held, so a `Capturing` mode here
    /// means the future that set it was dropped before finishing. Preview is
    /// resumed if that capture had paused it.
    async fn recover_abandoned_capture(&self) {
        let paused_preview = {
            let state = self.state();
            if state.mode != Mode::Capturing {
                return;
            }
            state.paused_preview
        };

        warn!(paused_preview, "previous capture was abandoned, releasing device");
        if let Err(err) = self.session.stop().await {
            warn!(error = %err, "failed to release abandoned capture");
        }
        self.finish_capture(paused_preview).await;
    }

    /// Leave capturing mode, resuming preview if it was running before.
    async fn finish_capture(&self, was_previewing: bool) {
        let sources = {
            let state = self.state();
            state.preview.as_ref().map(|link| link.sources.clone())
        };
        let (true, Some(sources)) = (was_previewing, sources) else {
            self.state().mode = Mode::Idle;
            return;
        };

        let resolution = self.state().resolution;
        match self.resume_preview(resolution).await {
            Ok(source) => {
                self.state().mode = Mode::Previewing;
                publish(&sources, source).await;
                debug!(%resolution, "preview resumed");
            }
            Err(err) => {
                self.state().mode = Mode::Idle;
                warn!(%resolution, error = %err, "preview paused, resume failed after capture");
            }
        }
    }

    /// Reopen preview, retrying while the device reports busy.
    async fn resume_preview(&self, resolution: Resolution) -> Result<FrameSource> {
        tokio::time::sleep(self.resume.settle).await;

        let attempts = self.resume.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.session.start(resolution.width, resolution.height).await {
                Ok(source) => return Ok(source),
                Err(err) if err.is_busy() && attempt < attempts => {
                    warn!(attempt, attempts, error = %err, "failed to resume preview, will retry");
                    tokio::time::sleep(self.resume.backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Schedules recovery when a capture future is dropped before it finishes.
struct AbandonGuard {
    inner: Option<Arc<Inner>>,
}

impl AbandonGuard {
    fn arm(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Some(Arc::clone(inner)),
        }
    }

    fn disarm(mut self) {
        self.inner = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _op = inner.op.lock().await;
                    inner.recover_abandoned_capture().await;
                });
            }
            // The next operation recovers instead.
            Err(_) => debug!("capture abandoned outside a runtime"),
        }
    }
}

/// Hand a new source to the forwarding loop.
async fn publish(sources: &mpsc::Sender<FrameSource>, source: FrameSource) {
    if sources.send(source).await.is_err() {
        debug!("preview forwarder already stopped");
    }
}

/// Create the preview channel and spawn its forwarding loop.
fn spawn_forwarder() -> PreviewLink {
    let (out_tx, out_rx) = mpsc::channel(1);
    let (src_tx, src_rx) = mpsc::channel(1);
    let stop = CancellationToken::new();

    tokio::spawn(forward_frames(src_rx, out_tx, stop.clone()));

    PreviewLink {
        frames: PreviewFrames {
            rx: Arc::new(tokio::sync::Mutex::new(out_rx)),
        },
        sources: src_tx,
        stop,
    }
}

enum Event {
    Stop,
    Source(Option<FrameSource>),
    Frame(Option<Bytes>),
}

/// Copy frames from the current source into the preview channel.
///
/// Sends never block: when the consumer has not taken the previous frame the
/// new one is dropped. A source ending (the device was stopped for a capture)
/// leaves the loop idle, not finished. The output channel closes when the
/// loop exits, which happens only on `stop`.
async fn forward_frames(
    mut sources: mpsc::Receiver<FrameSource>,
    out: mpsc::Sender<Bytes>,
    stop: CancellationToken,
) {
    let mut current: Option<FrameSource> = None;
    let mut dropped = 0u64;

    loop {
        let event = match current.as_mut() {
            None => tokio::select! {
                biased;
                () = stop.cancelled() => Event::Stop,
                source = sources.recv() => Event::Source(source),
            },
            Some(source) => tokio::select! {
                biased;
                () = stop.cancelled() => Event::Stop,
                next = sources.recv() => Event::Source(next),
                frame = source.recv() => Event::Frame(frame),
            },
        };

        match event {
            Event::Stop | Event::Source(None) => break,
            Event::Source(Some(source)) => current = Some(source),
            Event::Frame(None) => {
                debug!("preview source ended, waiting for a new one");
                current = None;
            }
            Event::Frame(Some(frame)) if frame.is_empty() => {}
            Event::Frame(Some(frame)) => match out.try_send(frame) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
            },
        }
    }

    debug!(dropped, "preview forwarder exiting");
}
