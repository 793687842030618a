//! Configuration of the DRM compositor.
//!
//! - [`types`]: the configuration schema ([`CompositorConfig`] and its sections).
//! - [`defaults`]: default values referenced by `#[serde(default = ...)]`.
//! - [`loader`]: [`ConfigLoader`], which reads TOML and validates the result.
//!
//! A missing configuration file is not an error; the defaults describe a
//! compositor that uses atomic modesetting when the device supports it,
//! non-blocking commits, and a hidden cursor.

pub mod defaults;
pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{CompositorConfig, CursorConfig, LoggingConfig, PresentationConfig};
