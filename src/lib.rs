//! Pi-Shutter: preview, still capture and time-lapse scheduling for a single
//! V4L2 camera on a Raspberry Pi.
//!
//! The camera hardware supports one open handle at a time. The
//! [`Arbiter`] shares that handle between a continuous preview stream and
//! on-demand full-resolution captures, pausing and resuming preview around
//! each capture. The [`Scheduler`] drives periodic captures for a bound
//! time-lapse [`Project`].

pub mod arbiter;
pub mod config;
pub mod controls;
pub mod device;
pub mod scheduler;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use arbiter::{Arbiter, Mode, PreviewFrames, ResumePolicy};
pub use config::{Config, ConfigError};
pub use controls::{ControlConfig, ControlId, ControlValue, Settings};
pub use device::V4L2Driver;
pub use scheduler::{Project, Scheduler};
pub use session::{DeviceSession, SessionOptions};
pub use traits::{
    CameraDriver, CameraError, DeviceHandle, Format, FourCC, FrameSource, Resolution, Result,
};
