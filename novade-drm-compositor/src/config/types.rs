//! Configuration data structures.
//!
//! All sections deny unknown fields so that typos in the TOML file surface as
//! parse errors instead of being silently ignored.

use serde::Deserialize;
use std::path::PathBuf;

use super::defaults;

/// Logging settings, consumed by [`crate::logging::init_logging`].
///
/// ```
/// use novade_drm_compositor::config::LoggingConfig;
///
/// let config: LoggingConfig = toml::from_str("level = \"debug\"").unwrap();
/// assert_eq!(config.level, "debug");
/// assert_eq!(config.format, "text");
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of "trace", "debug", "info", "warn", "error" (case-insensitive).
    #[serde(default = "defaults::default_log_level")]
    pub level: String,
    /// Optional log file. `None` disables file logging.
    #[serde(default = "defaults::default_log_file_path")]
    pub file_path: Option<PathBuf>,
    /// "text" or "json".
    #[serde(default = "defaults::default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        defaults::default_logging_config()
    }
}

/// How frames are committed to the display device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresentationConfig {
    /// Use per-plane legacy calls even if the device supports atomic modesetting.
    #[serde(default = "defaults::default_bool_false")]
    pub force_legacy_modesetting: bool,
    /// Start out with blocking atomic commits instead of waiting for the first `EBUSY`.
    #[serde(default = "defaults::default_bool_false")]
    pub blocking_atomic_commits: bool,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        defaults::default_presentation_config()
    }
}

/// Initial hardware cursor state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CursorConfig {
    #[serde(default = "defaults::default_bool_false")]
    pub enabled: bool,
    /// Device pixel ratio used to pick the cursor icon size.
    #[serde(default = "defaults::default_pixel_ratio")]
    pub pixel_ratio: f64,
    /// Output rotation in degrees (0, 90, 180 or 270).
    #[serde(default = "defaults::default_rotation")]
    pub rotation: i32,
}

impl Default for CursorConfig {
    fn default() -> Self {
        defaults::default_cursor_config()
    }
}

/// Root configuration of the compositor.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositorConfig {
    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,
    #[serde(default = "defaults::default_presentation_config")]
    pub presentation: PresentationConfig,
    #[serde(default = "defaults::default_cursor_config")]
    pub cursor: CursorConfig,
}
