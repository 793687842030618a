//! Default configuration values.
//!
//! Used by `serde`'s `default` attribute in [`super::types`] when a value is
//! missing from the configuration file.

use super::types::{CursorConfig, LoggingConfig, PresentationConfig};
use std::path::PathBuf;

pub(super) fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file_path: default_log_file_path(),
        format: default_log_format(),
    }
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_file_path() -> Option<PathBuf> {
    None
}

pub(super) fn default_log_format() -> String {
    "text".to_string()
}

pub(super) fn default_presentation_config() -> PresentationConfig {
    PresentationConfig {
        force_legacy_modesetting: default_bool_false(),
        blocking_atomic_commits: default_bool_false(),
    }
}

pub(super) fn default_cursor_config() -> CursorConfig {
    CursorConfig {
        enabled: default_bool_false(),
        pixel_ratio: default_pixel_ratio(),
        rotation: default_rotation(),
    }
}

pub(super) fn default_bool_false() -> bool {
    false
}

pub(super) fn default_pixel_ratio() -> f64 {
    1.0
}

pub(super) fn default_rotation() -> i32 {
    0
}
