//! Runtime configuration from `SHUTTER_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::arbiter::ResumePolicy;
use crate::session::SessionOptions;
use crate::traits::Resolution;

/// Deepest mmap queue a session may request.
const MAX_BUFFERS: u32 = 2;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

/// Camera service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Device node to open.
    pub device: String,
    /// Preview stream resolution.
    pub preview: Resolution,
    /// Still capture resolution.
    pub capture: Resolution,
    /// Handle lifecycle options.
    pub session: SessionOptions,
    /// Preview resume retry policy.
    pub resume: ResumePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_owned(),
            preview: Resolution::new(1280, 720),
            capture: Resolution::new(3280, 2464),
            session: SessionOptions::default(),
            resume: ResumePolicy::default(),
        }
    }
}

impl Config {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let device = lookup("SHUTTER_DEVICE")
            .filter(|path| !path.trim().is_empty())
            .unwrap_or(defaults.device);

        let preview = parse_var(&lookup, "SHUTTER_PREVIEW")?.unwrap_or(defaults.preview);
        let capture = parse_var(&lookup, "SHUTTER_CAPTURE")?.unwrap_or(defaults.capture);

        let buffer_depth = parse_var::<u32, _>(&lookup, "SHUTTER_BUFFERS")?
            .map_or(defaults.session.buffer_depth, |depth| depth.clamp(1, MAX_BUFFERS));
        let stop_grace = parse_millis(&lookup, "SHUTTER_STOP_GRACE_MS")?
            .unwrap_or(defaults.session.stop_grace);

        let resume = ResumePolicy {
            attempts: parse_var(&lookup, "SHUTTER_RESUME_ATTEMPTS")?
                .unwrap_or(defaults.resume.attempts),
            settle: parse_millis(&lookup, "SHUTTER_RESUME_SETTLE_MS")?
                .unwrap_or(defaults.resume.settle),
            backoff: parse_millis(&lookup, "SHUTTER_RESUME_BACKOFF_MS")?
                .unwrap_or(defaults.resume.backoff),
        };

        Ok(Self {
            device,
            preview,
            capture,
            session: SessionOptions {
                buffer_depth,
                stop_grace,
            },
            resume,
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|err: T::Err| ConfigError::Invalid {
            var,
            reason: err.to_string(),
            value,
        })
}

fn parse_millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<u64, _>(lookup, var)?.map(Duration::from_millis))
}
