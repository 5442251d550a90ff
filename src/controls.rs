//! Registry of the V4L2 controls the camera exposes to users.
//!
//! The session and arbiter treat control IDs as opaque; this module is the
//! only place that knows which ones matter and what their defaults are.

use std::collections::BTreeMap;

/// V4L2 control identifier.
pub type ControlId = u32;

/// V4L2 integer control value.
pub type ControlValue = i32;

/// Control settings reapplied on every device open.
pub type Settings = BTreeMap<ControlId, ControlValue>;

/// Control IDs from `linux/v4l2-controls.h`.
pub mod cid {
    use super::ControlId;

    const USER_BASE: ControlId = 0x0098_0900;
    const CAMERA_CLASS_BASE: ControlId = 0x009a_0900;
    const JPEG_CLASS_BASE: ControlId = 0x009d_0900;

    /// Picture brightness.
    pub const BRIGHTNESS: ControlId = USER_BASE;
    /// Picture contrast.
    pub const CONTRAST: ControlId = USER_BASE + 1;
    /// Color saturation.
    pub const SATURATION: ControlId = USER_BASE + 2;
    /// Automatic white balance toggle.
    pub const AUTO_WHITE_BALANCE: ControlId = USER_BASE + 12;
    /// Sharpness.
    pub const SHARPNESS: ControlId = USER_BASE + 27;
    /// Exposure mode (auto, manual, priority modes).
    pub const EXPOSURE_AUTO: ControlId = CAMERA_CLASS_BASE + 1;
    /// Exposure time in 100 µs units.
    pub const EXPOSURE_ABSOLUTE: ControlId = CAMERA_CLASS_BASE + 2;
    /// White balance preset.
    pub const AUTO_N_PRESET_WHITE_BALANCE: ControlId = CAMERA_CLASS_BASE + 20;
    /// ISO sensitivity.
    pub const ISO_SENSITIVITY: ControlId = CAMERA_CLASS_BASE + 23;
    /// ISO sensitivity mode.
    pub const ISO_SENSITIVITY_AUTO: ControlId = CAMERA_CLASS_BASE + 24;
    /// JPEG compression quality.
    pub const JPEG_COMPRESSION_QUALITY: ControlId = JPEG_CLASS_BASE + 3;
}

/// Controls reported by `known_ctrl_configs`, in display order.
pub const KNOWN_CONTROLS: &[ControlId] = &[
    cid::EXPOSURE_AUTO,
    cid::EXPOSURE_ABSOLUTE,
    cid::AUTO_N_PRESET_WHITE_BALANCE,
    cid::AUTO_WHITE_BALANCE,
    cid::ISO_SENSITIVITY_AUTO,
    cid::ISO_SENSITIVITY,
    cid::BRIGHTNESS,
    cid::CONTRAST,
    cid::SATURATION,
    cid::SHARPNESS,
    cid::JPEG_COMPRESSION_QUALITY,
];

/// Settings `reset_settings` restores.
#[must_use]
pub fn default_settings() -> Settings {
    Settings::from([
        (cid::EXPOSURE_AUTO, 1),
        (cid::EXPOSURE_ABSOLUTE, 3000),
        (cid::AUTO_N_PRESET_WHITE_BALANCE, 0),
        (cid::JPEG_COMPRESSION_QUALITY, 90),
        (cid::ISO_SENSITIVITY_AUTO, 0),
    ])
}

/// Metadata and current value of a device control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Control identifier.
    pub id: ControlId,
    /// Driver-reported name.
    pub name: String,
    /// Current value.
    pub value: ControlValue,
    /// Whether the control is a menu.
    pub is_menu: bool,
    /// Menu labels, empty for non-menu controls.
    pub menu_items: Vec<String>,
    /// Minimum value.
    pub minimum: i64,
    /// Maximum value.
    pub maximum: i64,
    /// Step size.
    pub step: u64,
    /// Driver default.
    pub default: i64,
}
