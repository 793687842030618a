//! Loading and validation of [`CompositorConfig`].
//!
//! ```rust,ignore
//! use novade_drm_compositor::config::ConfigLoader;
//!
//! let config = ConfigLoader::load_from_path("/etc/novade/drm-compositor.toml")?;
//! novade_drm_compositor::logging::init_logging(&config.logging)?;
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::config::CompositorConfig;
use crate::error::{CompositorError, ConfigError};

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 2] = ["text", "json"];

/// Namespace for the configuration loading functions.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads and validates the TOML file at `path`.
    ///
    /// A missing file yields the default configuration. Any other read error,
    /// a parse error, or a validation failure is returned.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<CompositorConfig, CompositorError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::load_from_str(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No configuration file, using defaults");
                let mut config = CompositorConfig::default();
                Self::validate_config(&mut config)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }
            .into()),
        }
    }

    /// Parses and validates configuration text. Empty text yields the defaults.
    pub fn load_from_str(content: &str) -> Result<CompositorConfig, CompositorError> {
        let mut config: CompositorConfig = if content.trim().is_empty() {
            CompositorConfig::default()
        } else {
            toml::from_str(content).map_err(ConfigError::ParseError)?
        };
        Self::validate_config(&mut config)?;
        Ok(config)
    }

    /// Normalizes case-insensitive values and checks value ranges.
    pub fn validate_config(config: &mut CompositorConfig) -> Result<(), ConfigError> {
        let level = config.logging.level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of {:?}",
                config.logging.level, VALID_LEVELS
            )));
        }
        config.logging.level = level;

        let format = config.logging.format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format '{}'. Must be one of {:?}",
                config.logging.format, VALID_FORMATS
            )));
        }
        config.logging.format = format;

        if !matches!(config.cursor.rotation, 0 | 90 | 180 | 270) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid cursor rotation {}. Must be 0, 90, 180 or 270",
                config.cursor.rotation
            )));
        }

        if !(config.cursor.pixel_ratio.is_finite() && config.cursor.pixel_ratio > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid cursor pixel ratio {}. Must be a positive number",
                config.cursor.pixel_ratio
            )));
        }

        Ok(())
    }
}
