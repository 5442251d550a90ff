//! Exclusive ownership of the capture device.
//!
//! A [`DeviceSession`] is created once and opened and closed many times. It
//! holds at most one live handle, and it reapplies the stored control
//! settings on every open: drivers are not expected to keep controls across
//! a close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controls::{self, ControlConfig, ControlId, ControlValue, Settings, KNOWN_CONTROLS};
use crate::traits::{
    CameraDriver, CameraError, DeviceHandle, Format, FourCC, FrameSource, Resolution, Result,
};

/// Resolution of the throwaway handle used to query frame sizes.
const SIZE_QUERY_RESOLUTION: Resolution = Resolution::new(320, 240);

/// Tunables for a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Driver buffer count. Kept at 1–2 so frames are fresh, not queued.
    pub buffer_depth: u32,
    /// Wait between cancelling the stream and closing the handle.
    ///
    /// Closing always waits for the stream's reader to exit, so zero is safe;
    /// a small grace gives the driver time to drain its own queue first.
    pub stop_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_depth: 1,
            stop_grace: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct SessionInner {
    handle: Option<Box<dyn DeviceHandle>>,
    cancel: Option<CancellationToken>,
    settings: Settings,
}

impl SessionInner {
    /// Apply every stored setting, logging and skipping failures.
    fn apply_settings(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        for (&id, &value) in &self.settings {
            if let Err(err) = handle.set_control(id, value) {
                warn!(id = format_args!("{id:#x}"), value, error = %err, "failed to apply control");
            }
        }
    }
}

/// Owns the single hardware handle and its open/close lifecycle.
pub struct DeviceSession {
    driver: Arc<dyn CameraDriver>,
    path: String,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
}

impl DeviceSession {
    /// Create a session for the device at `path`. Nothing is opened yet.
    pub fn new<P>(driver: Arc<dyn CameraDriver>, path: P, options: SessionOptions) -> Self
    where
        P: Into<String>,
    {
        Self {
            driver,
            path: path.into(),
            options,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Device path this session opens.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether a handle is currently open.
    pub async fn is_started(&self) -> bool {
        self.inner.lock().await.handle.is_some()
    }

    /// Open the device at `width`x`height` and start streaming.
    pub async fn start(&self, width: u32, height: u32) -> Result<FrameSource> {
        let mut inner = self.inner.lock().await;
        if inner.handle.is_some() {
            return Err(CameraError::AlreadyStarted);
        }

        info!(path = %self.path, width, height, "starting camera");
        let format = Format::mjpeg(Resolution::new(width, height));
        let mut handle = self
            .driver
            .open(&self.path, &format, self.options.buffer_depth)?;

        let cancel = CancellationToken::new();
        let frames = match handle.start(cancel.clone()) {
            Ok(frames) => frames,
            Err(err) => {
                cancel.cancel();
                if let Err(close_err) = close_handle(handle).await {
                    debug!(error = %close_err, "close after failed start");
                }
                return Err(err);
            }
        };

        inner.handle = Some(handle);
        inner.cancel = Some(cancel);
        inner.apply_settings();

        Ok(frames)
    }

    /// Stop streaming and close the handle. Does nothing if not started.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
            // Closing while the stream is still tearing down races the
            // driver's own shutdown.
            tokio::time::sleep(self.options.stop_grace).await;
        }

        match inner.handle.take() {
            Some(handle) => {
                debug!(path = %self.path, "stopping camera");
                close_handle(handle).await
            }
            None => Ok(()),
        }
    }

    /// Store a control value and apply it now if the device is open.
    pub async fn set_control_value(&self, id: ControlId, value: ControlValue) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.settings.insert(id, value);
        match inner.handle.as_mut() {
            Some(handle) => handle.set_control(id, value),
            None => Ok(()),
        }
    }

    /// Replace all stored settings, applying them if the device is open.
    pub async fn update_settings(&self, settings: Settings) {
        let mut inner = self.inner.lock().await;
        inner.settings = settings;
        inner.apply_settings();
    }

    /// Restore the registry defaults.
    pub async fn reset_settings(&self) {
        self.update_settings(controls::default_settings()).await;
    }

    /// Copy of the stored settings.
    pub async fn settings(&self) -> Settings {
        self.inner.lock().await.settings.clone()
    }

    /// Registry controls the open device supports, with current values.
    pub async fn known_ctrl_configs(&self) -> Result<Vec<ControlConfig>> {
        let inner = self.inner.lock().await;
        let handle = inner.handle.as_ref().ok_or(CameraError::NotStarted)?;

        let mut configs = Vec::with_capacity(KNOWN_CONTROLS.len());
        for &id in KNOWN_CONTROLS {
            match handle.control_config(id) {
                Ok(config) => configs.push(config),
                Err(err) => {
                    warn!(id = format_args!("{id:#x}"), error = %err, "control not supported");
                }
            }
        }
        Ok(configs)
    }

    /// Current values of the registry controls the open device supports.
    pub async fn known_ctrl_settings(&self) -> Result<Settings> {
        let inner = self.inner.lock().await;
        let handle = inner.handle.as_ref().ok_or(CameraError::NotStarted)?;

        Ok(KNOWN_CONTROLS
            .iter()
            .filter_map(|&id| handle.control_config(id).ok())
            .map(|config| (config.id, config.value))
            .collect())
    }

    /// Largest MJPEG frame size the device supports.
    ///
    /// Uses the open handle when there is one, otherwise a short-lived scratch
    /// handle at a small resolution.
    pub async fn get_max_size(&self) -> Result<(u32, u32)> {
        let inner = self.inner.lock().await;

        let sizes = if let Some(handle) = inner.handle.as_ref() {
            handle.max_frame_sizes(FourCC::MJPG)?
        } else {
            let scratch = self.driver.open(
                &self.path,
                &Format::mjpeg(SIZE_QUERY_RESOLUTION),
                self.options.buffer_depth,
            )?;
            let sizes = scratch.max_frame_sizes(FourCC::MJPG);
            close_handle(scratch).await?;
            sizes?
        };

        sizes
            .into_iter()
            .max_by_key(|res| res.area())
            .map(|res| (res.width, res.height))
            .ok_or(CameraError::FrameSizeUnknown)
    }
}

/// Close `handle` off the async workers; closing joins the reader thread.
async fn close_handle(handle: Box<dyn DeviceHandle>) -> Result<()> {
    tokio::task::spawn_blocking(move || handle.close())
        .await
        .map_err(|err| CameraError::DeviceUnavailable(format!("close task failed: {err}")))?
}
